//! Galley component
//!
//! Builds the service account, RBAC objects, webhook configuration,
//! deployment and service that make up Galley, and pushes them to the
//! cluster through [`crate::k8sutil`].

use crate::crd::{GalleyConfiguration, IstioConfig};
use crate::error::{OperatorError, Result};
use crate::k8sutil::{reconcile_resource, remove_resource, ReconcileOutcome};
use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, ExecAction, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{info, instrument};

pub const SERVICE_ACCOUNT_NAME: &str = "istio-galley-service-account";
pub const CLUSTER_ROLE_NAME: &str = "istio-galley-cluster-role";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "istio-galley-admin-role-binding";
pub const CONFIG_MAP_NAME: &str = "istio-galley-configuration";
pub const DEPLOYMENT_NAME: &str = "istio-galley-deployment";
pub const SERVICE_NAME: &str = "istio-galley";
pub const WEBHOOK_CONFIG_NAME: &str = "istio-galley";
pub const WEBHOOK_CONFIG_KEY: &str = "validatingwebhookconfiguration.yaml";

const VALIDATION_PORT: i32 = 443;
const MONITORING_PORT: i32 = 9093;

const MIXER_RESOURCES: [&str; 27] = [
    "rules",
    "attributemanifests",
    "circonuses",
    "deniers",
    "fluentds",
    "kubernetesenvs",
    "listcheckers",
    "memquotas",
    "noops",
    "opas",
    "prometheuses",
    "rbacs",
    "servicecontrols",
    "solarwindses",
    "stackdrivers",
    "statsds",
    "stdios",
    "apikeys",
    "authorizations",
    "checknothings",
    "listentries",
    "logentries",
    "metrics",
    "quotas",
    "reportnothings",
    "servicecontrolreports",
    "tracespans",
];

/// One Kubernetes object owned by the Galley component
#[derive(Debug, Clone)]
pub enum GalleyObject {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    Deployment(Deployment),
    Service(Service),
}

impl GalleyObject {
    pub fn kind(&self) -> &'static str {
        match self {
            GalleyObject::ServiceAccount(_) => "ServiceAccount",
            GalleyObject::ClusterRole(_) => "ClusterRole",
            GalleyObject::ClusterRoleBinding(_) => "ClusterRoleBinding",
            GalleyObject::ConfigMap(_) => "ConfigMap",
            GalleyObject::Deployment(_) => "Deployment",
            GalleyObject::Service(_) => "Service",
        }
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    /// Cluster-scoped objects cannot be owned by the namespaced Config
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            GalleyObject::ClusterRole(_) | GalleyObject::ClusterRoleBinding(_)
        )
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            GalleyObject::ServiceAccount(o) => o.meta(),
            GalleyObject::ClusterRole(o) => o.meta(),
            GalleyObject::ClusterRoleBinding(o) => o.meta(),
            GalleyObject::ConfigMap(o) => o.meta(),
            GalleyObject::Deployment(o) => o.meta(),
            GalleyObject::Service(o) => o.meta(),
        }
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            GalleyObject::ServiceAccount(o) => o.meta_mut(),
            GalleyObject::ClusterRole(o) => o.meta_mut(),
            GalleyObject::ClusterRoleBinding(o) => o.meta_mut(),
            GalleyObject::ConfigMap(o) => o.meta_mut(),
            GalleyObject::Deployment(o) => o.meta_mut(),
            GalleyObject::Service(o) => o.meta_mut(),
        }
    }

    async fn reconcile(
        &self,
        client: &Client,
        namespace: &str,
        field_manager: &str,
    ) -> std::result::Result<ReconcileOutcome, kube::Error> {
        let client = client.clone();
        match self {
            GalleyObject::ServiceAccount(o) => {
                reconcile_resource(&Api::namespaced(client, namespace), o, field_manager).await
            }
            GalleyObject::ClusterRole(o) => {
                reconcile_resource(&Api::all(client), o, field_manager).await
            }
            GalleyObject::ClusterRoleBinding(o) => {
                reconcile_resource(&Api::all(client), o, field_manager).await
            }
            GalleyObject::ConfigMap(o) => {
                reconcile_resource(&Api::namespaced(client, namespace), o, field_manager).await
            }
            GalleyObject::Deployment(o) => {
                reconcile_resource(&Api::namespaced(client, namespace), o, field_manager).await
            }
            GalleyObject::Service(o) => {
                reconcile_resource(&Api::namespaced(client, namespace), o, field_manager).await
            }
        }
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn app_labels() -> BTreeMap<String, String> {
    labels(&[("app", "istio-galley")])
}

fn galley_selector() -> BTreeMap<String, String> {
    labels(&[("istio", "galley")])
}

/// Identity the Galley pods run as
pub fn service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Cluster-wide permissions Galley needs.
///
/// Galley manages its own validating webhook registration, reads all
/// `config.istio.io` resources and looks up its own deployment and
/// endpoints by name.
pub fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(strings(&["admissionregistration.k8s.io"])),
                resources: Some(strings(&["validatingwebhookconfigurations"])),
                verbs: strings(&["*"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["config.istio.io"])),
                resources: Some(strings(&["*"])),
                verbs: strings(&["get", "list", "watch"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["*"])),
                resources: Some(strings(&["deployments"])),
                resource_names: Some(strings(&["istio-galley"])),
                verbs: strings(&["get"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["*"])),
                resources: Some(strings(&["endpoints"])),
                resource_names: Some(strings(&["istio-galley"])),
                verbs: strings(&["get"]),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Binds [`cluster_role`] to the Galley service account in `namespace`
pub fn cluster_role_binding(namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING_NAME.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

fn create_update_rule(api_group: &str, api_version: &str, resources: &[&str]) -> RuleWithOperations {
    RuleWithOperations {
        operations: Some(strings(&["CREATE", "UPDATE"])),
        api_groups: Some(strings(&[api_group])),
        api_versions: Some(strings(&[api_version])),
        resources: Some(strings(resources)),
        ..Default::default()
    }
}

fn galley_webhook(name: &str, namespace: &str, path: &str, rules: Vec<RuleWithOperations>) -> ValidatingWebhook {
    ValidatingWebhook {
        name: name.to_string(),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: SERVICE_NAME.to_string(),
                namespace: namespace.to_string(),
                path: Some(path.to_string()),
                ..Default::default()
            }),
            ca_bundle: Some(ByteString(Vec::new())),
            ..Default::default()
        },
        rules: Some(rules),
        failure_policy: Some("Fail".to_string()),
        side_effects: "None".to_string(),
        admission_review_versions: strings(&["v1beta1"]),
        ..Default::default()
    }
}

/// The webhook definition Galley registers on startup, as YAML
pub fn validating_webhook_config(namespace: &str) -> Result<String> {
    let webhook = ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        webhooks: Some(vec![
            galley_webhook(
                "pilot.validation.istio.io",
                namespace,
                "/admitpilot",
                vec![
                    create_update_rule(
                        "config.istio.io",
                        "v1alpha2",
                        &[
                            "httpapispecs",
                            "httpapispecbindings",
                            "quotaspecs",
                            "quotaspecbindings",
                        ],
                    ),
                    create_update_rule("rbac.istio.io", "*", &["*"]),
                    create_update_rule("authentication.istio.io", "*", &["*"]),
                    create_update_rule(
                        "networking.istio.io",
                        "*",
                        &[
                            "destinationrules",
                            "envoyfilters",
                            "gateways",
                            "serviceentries",
                            "virtualservices",
                        ],
                    ),
                ],
            ),
            galley_webhook(
                "mixer.validation.istio.io",
                namespace,
                "/admitmixer",
                vec![create_update_rule(
                    "config.istio.io",
                    "v1alpha2",
                    &MIXER_RESOURCES,
                )],
            ),
        ]),
    };

    serde_yaml::to_string(&webhook).map_err(OperatorError::WebhookConfig)
}

/// ConfigMap carrying the rendered webhook definition under
/// [`WEBHOOK_CONFIG_KEY`], mounted into the validator container.
pub fn config_map(namespace: &str) -> Result<ConfigMap> {
    let webhook_config = validating_webhook_config(namespace)?;
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(&[("app", "istio-galley"), ("istio", "mixer")])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            WEBHOOK_CONFIG_KEY.to_string(),
            webhook_config,
        )])),
        ..Default::default()
    })
}

fn default_deploy_annotations() -> BTreeMap<String, String> {
    labels(&[
        ("sidecar.istio.io/inject", "false"),
        ("scheduler.alpha.kubernetes.io/critical-pod", ""),
    ])
}

fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([(
            "cpu".to_string(),
            Quantity("10m".to_string()),
        )])),
        ..Default::default()
    }
}

fn galley_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(strings(&[
                "/usr/local/bin/galley",
                "probe",
                "--probe-path=/health",
                "--interval=10s",
            ])),
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        ..Default::default()
    }
}

fn validator_command(namespace: &str) -> Vec<String> {
    vec![
        "/usr/local/bin/galley".to_string(),
        "validator".to_string(),
        format!("--deployment-namespace={}", namespace),
        "--caCertFile=/etc/istio/certs/root-cert.pem".to_string(),
        "--tlsCertFile=/etc/istio/certs/cert-chain.pem".to_string(),
        "--tlsKeyFile=/etc/istio/certs/key.pem".to_string(),
        "--healthCheckInterval=1s".to_string(),
        "--healthCheckFile=/health".to_string(),
        "--webhook-config-file".to_string(),
        format!("/etc/istio/config/{}", WEBHOOK_CONFIG_KEY),
    ]
}

/// Galley validator deployment.
///
/// Replicas, image and pull policy come from the Config; everything else is
/// fixed. Rollouts surge one pod and never drop below the desired count.
pub fn deployment(namespace: &str, galley: &GalleyConfiguration) -> Deployment {
    let container = Container {
        name: "validator".to_string(),
        image: Some(galley.image.clone()),
        image_pull_policy: Some(galley.image_pull_policy.clone()),
        ports: Some(vec![
            ContainerPort {
                container_port: VALIDATION_PORT,
                ..Default::default()
            },
            ContainerPort {
                container_port: MONITORING_PORT,
                ..Default::default()
            },
        ]),
        command: Some(validator_command(namespace)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "certs".to_string(),
                mount_path: "/etc/istio/certs".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "config".to_string(),
                mount_path: "/etc/istio/config".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(galley_probe()),
        readiness_probe: Some(galley_probe()),
        resources: Some(default_resources()),
        ..Default::default()
    };

    let pod_template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(galley_selector()),
            annotations: Some(default_deploy_annotations()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            containers: vec![container],
            volumes: Some(vec![
                Volume {
                    name: "certs".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(format!("istio.{}", SERVICE_ACCOUNT_NAME)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: CONFIG_MAP_NAME.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            affinity: Some(Affinity::default()),
            ..Default::default()
        }),
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(&[("app", "istio-galley"), ("istio", "galley")])),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(galley.replica_count),
            strategy: Some(DeploymentStrategy {
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::Int(1)),
                    max_unavailable: Some(IntOrString::Int(0)),
                }),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(galley_selector()),
                ..Default::default()
            },
            template: pod_template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service fronting the validation webhook and monitoring ports
pub fn service(namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(galley_selector()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![
                ServicePort {
                    name: Some("https-validation".to_string()),
                    port: VALIDATION_PORT,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https-monitoring".to_string()),
                    port: MONITORING_PORT,
                    ..Default::default()
                },
            ]),
            selector: Some(galley_selector()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Every Galley object for `config`, in apply order.
///
/// Namespaced objects are owned by the Config so they are garbage collected
/// with it.
pub fn desired_objects(config: &IstioConfig) -> Result<Vec<GalleyObject>> {
    let namespace = config.namespace().ok_or_else(|| {
        OperatorError::InvalidSpec(format!("Config {} has no namespace", config.name_any()))
    })?;
    config
        .spec
        .galley
        .validate()
        .map_err(OperatorError::InvalidSpec)?;

    let mut objects = vec![
        GalleyObject::ServiceAccount(service_account(&namespace)),
        GalleyObject::ClusterRole(cluster_role()),
        GalleyObject::ClusterRoleBinding(cluster_role_binding(&namespace)),
        GalleyObject::ConfigMap(config_map(&namespace)?),
        GalleyObject::Deployment(deployment(&namespace, &config.spec.galley)),
        GalleyObject::Service(service(&namespace)),
    ];

    if let Some(owner) = config.controller_owner_ref(&()) {
        for object in objects.iter_mut().filter(|o| !o.is_cluster_scoped()) {
            set_owner(object.meta_mut(), owner.clone());
        }
    }

    Ok(objects)
}

fn set_owner(meta: &mut ObjectMeta, owner: OwnerReference) {
    meta.owner_references = Some(vec![owner]);
}

/// Create or update every Galley object; stops at the first failure.
#[instrument(skip(client, config), fields(config = %config.name_any()))]
pub async fn reconcile_galley(
    client: &Client,
    config: &IstioConfig,
    field_manager: &str,
) -> Result<()> {
    let namespace = config.namespace().unwrap_or_default();

    for object in desired_objects(config)? {
        let outcome = object
            .reconcile(client, &namespace, field_manager)
            .await
            .map_err(|source| OperatorError::Reconcile {
                kind: object.kind().to_string(),
                name: object.name(),
                source,
            })?;
        if outcome == ReconcileOutcome::Created {
            info!(kind = object.kind(), name = %object.name(), "galley resource created");
        }
    }

    Ok(())
}

/// Delete every Galley object in `namespace`; missing objects are skipped.
pub async fn remove_galley(client: &Client, namespace: &str) -> Result<()> {
    remove_resource::<Service>(&Api::namespaced(client.clone(), namespace), SERVICE_NAME).await?;
    remove_resource::<Deployment>(&Api::namespaced(client.clone(), namespace), DEPLOYMENT_NAME)
        .await?;
    remove_resource::<ConfigMap>(&Api::namespaced(client.clone(), namespace), CONFIG_MAP_NAME)
        .await?;
    remove_cluster_scoped(client).await?;
    remove_resource::<ServiceAccount>(
        &Api::namespaced(client.clone(), namespace),
        SERVICE_ACCOUNT_NAME,
    )
    .await?;
    Ok(())
}

/// Delete the cluster role and its binding.
pub async fn remove_cluster_scoped(client: &Client) -> Result<()> {
    remove_resource::<ClusterRoleBinding>(&Api::all(client.clone()), CLUSTER_ROLE_BINDING_NAME)
        .await?;
    remove_resource::<ClusterRole>(&Api::all(client.clone()), CLUSTER_ROLE_NAME).await?;
    Ok(())
}
