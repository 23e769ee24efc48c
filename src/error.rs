//! Error types for the Istio operator

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T, E = OperatorError> = std::result::Result<T, E>;

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[source] kube::Error),

    /// A single managed object could not be created or updated
    #[error("failed to reconcile resource {kind} {name}: {source}")]
    Reconcile {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// A managed object could not be removed
    #[error("failed to remove resource {kind} {name}: {source}")]
    Remove {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// The webhook definition could not be rendered
    #[error("failed to marshal webhook config: {0}")]
    WebhookConfig(#[source] serde_yaml::Error),

    /// Invalid desired state on the custom resource
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Leader election failure
    #[error("Leader election error: {0}")]
    LeaderElection(String),
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err)
    }
}

impl OperatorError {
    /// Short machine-readable reason, used for status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::KubeApi(_) => "KubeApiError",
            OperatorError::Reconcile { .. } => "ReconcileFailed",
            OperatorError::Remove { .. } => "RemoveFailed",
            OperatorError::WebhookConfig(_) => "WebhookConfigInvalid",
            OperatorError::InvalidSpec(_) => "InvalidSpec",
            OperatorError::LeaderElection(_) => "LeaderElectionError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> kube::Error {
        let response: kube::core::ErrorResponse = serde_json::from_value(serde_json::json!({
            "status": "Failure",
            "message": "deployments \"x\" not found",
            "reason": "NotFound",
            "code": 404
        }))
        .unwrap();
        kube::Error::Api(response)
    }

    #[test]
    fn test_reconcile_error_names_kind_and_object() {
        let err = OperatorError::Reconcile {
            kind: "Deployment".to_string(),
            name: "istio-galley-deployment".to_string(),
            source: not_found(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("failed to reconcile resource"));
        assert!(msg.contains("Deployment istio-galley-deployment"));
        assert_eq!(err.reason(), "ReconcileFailed");
    }

    #[test]
    fn test_kube_conversion() {
        let err: OperatorError = not_found().into();
        assert!(matches!(err, OperatorError::KubeApi(_)));
        assert!(err.to_string().contains("Kubernetes API error"));
    }
}
