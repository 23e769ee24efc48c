//! Mocked Kubernetes API server for controller tests

use crate::controllers::GalleyObject;
use crate::crd::{ConfigSpec, IstioConfig};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use std::time::Duration;

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub const NAMESPACE: &str = "istio-system";
pub const CONFIG_PATH: &str =
    "/apis/istio.banzaicloud.io/v1beta1/namespaces/istio-system/configs/istio-config";

/// Answers the requests a test expects, in order
pub struct ApiServerVerifier(ApiServerHandle);

/// A request the verifier answered
#[derive(Debug)]
pub struct Received {
    pub query: String,
    pub body: Value,
}

/// Create a mocked kube client and the verifier behind it
pub fn testcontext() -> (Client, ApiServerVerifier) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, NAMESPACE), ApiServerVerifier(handle))
}

/// A Config in the test namespace with a uid, so owner references resolve
pub fn istio_config() -> IstioConfig {
    let mut config = IstioConfig::new("istio-config", ConfigSpec::default());
    config.metadata.namespace = Some(NAMESPACE.to_string());
    config.metadata.uid = Some("8d3f6a52-0000-4000-8000-000000000001".to_string());
    config.metadata.generation = Some(1);
    config
}

/// Request path for a single Galley object
pub fn object_path(object: &GalleyObject) -> String {
    let name = object.name();
    match object {
        GalleyObject::ServiceAccount(_) => {
            format!("/api/v1/namespaces/{}/serviceaccounts/{}", NAMESPACE, name)
        }
        GalleyObject::ClusterRole(_) => {
            format!("/apis/rbac.authorization.k8s.io/v1/clusterroles/{}", name)
        }
        GalleyObject::ClusterRoleBinding(_) => {
            format!("/apis/rbac.authorization.k8s.io/v1/clusterrolebindings/{}", name)
        }
        GalleyObject::ConfigMap(_) => {
            format!("/api/v1/namespaces/{}/configmaps/{}", NAMESPACE, name)
        }
        GalleyObject::Deployment(_) => {
            format!("/apis/apps/v1/namespaces/{}/deployments/{}", NAMESPACE, name)
        }
        GalleyObject::Service(_) => {
            format!("/api/v1/namespaces/{}/services/{}", NAMESPACE, name)
        }
    }
}

/// Collection path the object is created under
pub fn collection_path(object: &GalleyObject) -> String {
    let path = object_path(object);
    match path.rsplit_once('/') {
        Some((collection, _)) => collection.to_string(),
        None => path,
    }
}

pub fn object_json(object: &GalleyObject) -> Value {
    match object {
        GalleyObject::ServiceAccount(o) => serde_json::to_value(o),
        GalleyObject::ClusterRole(o) => serde_json::to_value(o),
        GalleyObject::ClusterRoleBinding(o) => serde_json::to_value(o),
        GalleyObject::ConfigMap(o) => serde_json::to_value(o),
        GalleyObject::Deployment(o) => serde_json::to_value(o),
        GalleyObject::Service(o) => serde_json::to_value(o),
    }
    .unwrap()
}

/// Deletion paths in the order Galley is torn down
pub fn removal_paths() -> Vec<String> {
    vec![
        format!("/api/v1/namespaces/{}/services/istio-galley", NAMESPACE),
        format!("/apis/apps/v1/namespaces/{}/deployments/istio-galley-deployment", NAMESPACE),
        format!("/api/v1/namespaces/{}/configmaps/istio-galley-configuration", NAMESPACE),
        "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings/istio-galley-admin-role-binding"
            .to_string(),
        "/apis/rbac.authorization.k8s.io/v1/clusterroles/istio-galley-cluster-role".to_string(),
        format!("/api/v1/namespaces/{}/serviceaccounts/istio-galley-service-account", NAMESPACE),
    ]
}

/// apiserver `Status` body for a failed call
pub fn failure(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("mock apiserver: {}", reason),
        "reason": reason,
        "code": code
    })
}

/// apiserver `Status` body for a completed delete
pub fn deleted() -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Success",
        "code": 200
    })
}

impl ApiServerVerifier {
    /// Wait for the next request, check method and path, reply with `status` and `response`
    pub async fn handle(
        &mut self,
        method: Method,
        path: &str,
        status: StatusCode,
        response: Value,
    ) -> Received {
        let (request, send) = self
            .0
            .next_request()
            .await
            .unwrap_or_else(|| panic!("service not called: expected {} {}", method, path));
        let (parts, body) = request.into_parts();
        assert_eq!(parts.method, method, "unexpected method for {}", parts.uri);
        assert_eq!(parts.uri.path(), path);

        let bytes = body.collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        send.send_response(
            Response::builder()
                .status(status)
                .body(Body::from(serde_json::to_vec(&response).unwrap()))
                .unwrap(),
        );

        Received {
            query: parts.uri.query().unwrap_or_default().to_string(),
            body,
        }
    }

    pub async fn ok(&mut self, method: Method, path: &str, response: Value) -> Received {
        self.handle(method, path, StatusCode::OK, response).await
    }

    pub async fn not_found(&mut self, method: Method, path: &str) -> Received {
        self.handle(method, path, StatusCode::NOT_FOUND, failure(404, "NotFound"))
            .await
    }

    /// No further request may arrive
    pub async fn assert_idle(mut self) {
        let next = tokio::time::timeout(Duration::from_millis(200), self.0.next_request()).await;
        if let Ok(Some((request, _))) = next {
            panic!("unexpected request {} {}", request.method(), request.uri());
        }
    }
}

/// Wait for a scenario task to finish, failing on a hang
pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded");
}
