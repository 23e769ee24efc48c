//! Runtime settings shared by the controllers

use std::time::Duration;

/// Field manager recorded on every server-side apply
pub const FIELD_MANAGER: &str = "istio-operator";

/// Settings the controllers run with, built from the command line
#[derive(Debug, Clone)]
pub struct Settings {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Requeue interval after a successful reconciliation
    pub requeue_interval: Duration,
    /// Requeue interval after a failed reconciliation
    pub error_requeue_interval: Duration,
    /// Field manager for server-side apply
    pub field_manager: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_interval: Duration::from_secs(60),
            error_requeue_interval: Duration::from_secs(30),
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

impl Settings {
    /// Treat an empty namespace as "all namespaces"
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        let namespace = namespace.trim();
        self.namespace = (!namespace.is_empty()).then(|| namespace.to_string());
        self
    }

    pub fn with_requeue_interval(mut self, secs: u64) -> Self {
        self.requeue_interval = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_error_requeue_interval(mut self, secs: u64) -> Self {
        self.error_requeue_interval = Duration::from_secs(secs.max(1));
        self
    }
}
