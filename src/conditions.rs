//! Kubernetes-standard status condition helpers
//!
//! Constants and builder functions for the conditions reported on the
//! `Config` resource, following the Kubernetes API conventions.

use crate::crd::ConfigCondition;
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// Config condition types
pub const CONDITION_RECONCILED: &str = "Reconciled";
pub const CONDITION_GALLEY_AVAILABLE: &str = "GalleyAvailable";

/// Removes cluster-scoped Galley objects before the Config goes away
pub const CONFIG_FINALIZER: &str = "istio.banzaicloud.io/galley-cleanup";

/// Build a condition stamped with the current time.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ConfigCondition {
    ConfigCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ConfigCondition>, new: ConfigCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(
    conditions: &'a [ConfigCondition],
    condition_type: &str,
) -> Option<&'a ConfigCondition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}
