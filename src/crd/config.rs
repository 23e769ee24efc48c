//! Istio `Config` Custom Resource Definition
//!
//! Describes the desired state of the Istio control plane managed by the
//! operator. Only the Galley component is handled here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Config is the Schema for the configs API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "istio.banzaicloud.io",
    version = "v1beta1",
    kind = "Config",
    root = "IstioConfig",
    namespaced,
    status = "ConfigStatus",
    shortname = "istio",
    printcolumn = r#"{"name":"Galley","type":"boolean","jsonPath":".spec.galley.enabled"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.galleyReadyReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// Galley configuration
    #[serde(default)]
    pub galley: GalleyConfiguration,
}

/// Desired state of the Galley deployment
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GalleyConfiguration {
    /// Whether Galley should be deployed at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of Galley replicas
    #[serde(default = "default_replica_count")]
    pub replica_count: i32,

    /// Galley container image
    #[serde(default = "default_galley_image")]
    pub image: String,

    /// Image pull policy
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,
}

impl Default for GalleyConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            replica_count: default_replica_count(),
            image: default_galley_image(),
            image_pull_policy: default_pull_policy(),
        }
    }
}

/// Status of the Config resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ConfigPhase,
    /// Ready Galley replicas as reported by the deployment
    #[serde(default)]
    pub galley_ready_replicas: i32,
    /// Conditions representing the control plane state
    #[serde(default)]
    pub conditions: Vec<ConfigCondition>,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Last time the status content changed
    #[serde(default)]
    pub last_updated: Option<String>,
    /// Error from the last failed reconciliation
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Phase of the control plane lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ConfigPhase {
    /// Nothing reconciled yet
    #[default]
    Pending,
    /// Objects applied, Galley not yet fully available
    Reconciling,
    /// Galley is available
    Available,
    /// Galley is disabled on the Config
    Disabled,
    /// Last reconciliation failed
    Failed,
}

/// Condition of the Config resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl GalleyConfiguration {
    /// Reject values the API server would refuse on the deployment
    pub fn validate(&self) -> Result<(), String> {
        if self.replica_count < 0 {
            return Err(format!(
                "galley.replicaCount must not be negative, got {}",
                self.replica_count
            ));
        }
        if self.image.trim().is_empty() {
            return Err("galley.image must not be empty".to_string());
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_replica_count() -> i32 {
    1
}

fn default_galley_image() -> String {
    "docker.io/istio/galley:1.0.5".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}
