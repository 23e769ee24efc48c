//! Generic create-or-update helpers for operator-managed objects.

use crate::error::{OperatorError, Result};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

/// What [`reconcile_resource`] did to the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
}

/// Bring the object named in `desired` in line with it.
///
/// Missing objects are created; existing ones get a forced server-side
/// apply so fields owned by other managers are taken over.
pub async fn reconcile_resource<K>(
    api: &Api<K>,
    desired: &K,
    field_manager: &str,
) -> std::result::Result<ReconcileOutcome, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired.name_any();
    let kind = K::kind(&());

    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), desired).await?;
            info!(kind = %kind, name = %name, "created resource");
            Ok(ReconcileOutcome::Created)
        }
        Some(_existing) => {
            api.patch(
                &name,
                &PatchParams::apply(field_manager).force(),
                &Patch::Apply(desired),
            )
            .await?;
            debug!(kind = %kind, name = %name, "updated resource");
            Ok(ReconcileOutcome::Updated)
        }
    }
}

/// Delete the named object. Returns `false` if it did not exist.
pub async fn remove_resource<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    let kind = K::kind(&());
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!(kind = %kind, name = %name, "removed resource");
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(source) => Err(OperatorError::Remove {
            kind: kind.to_string(),
            name: name.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{deleted, failure, testcontext, timeout_after_1s, NAMESPACE};
    use http::{Method, StatusCode};
    use k8s_openapi::api::core::v1::ServiceAccount;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const SA_PATH: &str = "/api/v1/namespaces/istio-system/serviceaccounts";

    fn service_account() -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some("istio-galley-service-account".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sa_path() -> String {
        format!("{}/istio-galley-service-account", SA_PATH)
    }

    #[tokio::test]
    async fn test_missing_object_is_created() {
        let (client, mut server) = testcontext();
        let desired = service_account();
        let body = serde_json::to_value(&desired).unwrap();

        let scenario = tokio::spawn(async move {
            server.not_found(Method::GET, &sa_path()).await;
            let create = server.ok(Method::POST, SA_PATH, body).await;
            assert_eq!(create.body["metadata"]["name"], "istio-galley-service-account");
            server.assert_idle().await;
        });

        let api: Api<ServiceAccount> = Api::namespaced(client, NAMESPACE);
        let outcome = reconcile_resource(&api, &desired, "istio-operator")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        timeout_after_1s(scenario).await;
    }

    #[tokio::test]
    async fn test_existing_object_is_applied() {
        let (client, mut server) = testcontext();
        let desired = service_account();
        let body = serde_json::to_value(&desired).unwrap();

        let scenario = tokio::spawn(async move {
            server.ok(Method::GET, &sa_path(), body.clone()).await;
            let patch = server.ok(Method::PATCH, &sa_path(), body).await;
            assert!(patch.query.contains("fieldManager=istio-operator"));
            assert!(patch.query.contains("force=true"));
            server.assert_idle().await;
        });

        let api: Api<ServiceAccount> = Api::namespaced(client, NAMESPACE);
        let outcome = reconcile_resource(&api, &desired, "istio-operator")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
        timeout_after_1s(scenario).await;
    }

    #[tokio::test]
    async fn test_remove_existing_object() {
        let (client, mut server) = testcontext();

        let scenario = tokio::spawn(async move {
            server.ok(Method::DELETE, &sa_path(), deleted()).await;
        });

        let api: Api<ServiceAccount> = Api::namespaced(client, NAMESPACE);
        assert!(remove_resource(&api, "istio-galley-service-account")
            .await
            .unwrap());
        timeout_after_1s(scenario).await;
    }

    #[tokio::test]
    async fn test_remove_missing_object_is_not_an_error() {
        let (client, mut server) = testcontext();

        let scenario = tokio::spawn(async move {
            server.not_found(Method::DELETE, &sa_path()).await;
        });

        let api: Api<ServiceAccount> = Api::namespaced(client, NAMESPACE);
        let removed = remove_resource(&api, "istio-galley-service-account")
            .await
            .unwrap();
        assert!(!removed);
        timeout_after_1s(scenario).await;
    }

    #[tokio::test]
    async fn test_remove_failure_names_object() {
        let (client, mut server) = testcontext();

        let scenario = tokio::spawn(async move {
            server
                .handle(
                    Method::DELETE,
                    &sa_path(),
                    StatusCode::FORBIDDEN,
                    failure(403, "Forbidden"),
                )
                .await;
        });

        let api: Api<ServiceAccount> = Api::namespaced(client, NAMESPACE);
        let err = remove_resource(&api, "istio-galley-service-account")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperatorError::Remove { ref kind, ref name, .. }
                if kind == "ServiceAccount" && name == "istio-galley-service-account"
        ));
        timeout_after_1s(scenario).await;
    }
}
