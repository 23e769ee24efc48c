//! Controllers for the Istio operator
//!
//! The config controller watches Istio `Config` resources and reconciles
//! the control-plane components they describe.

mod config;
pub mod galley;

pub use config::{
    disabled_status, failed_status, reconciled_status, status_changed, ConfigController,
    GalleyReadiness,
};
pub use galley::GalleyObject;

use crate::crd::IstioConfig;
use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::sync::Arc;

/// Requeue a failed reconciliation after the configured error interval
pub(crate) fn error_policy_backoff(
    _config: Arc<IstioConfig>,
    _error: &OperatorError,
    ctx: Arc<ConfigController>,
) -> Action {
    Action::requeue(ctx.settings().error_requeue_interval)
}
