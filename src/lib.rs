//! Istio Kubernetes Operator
//!
//! Manages the Galley component of an Istio control plane. A `Config`
//! resource is translated into Galley's service account, RBAC objects,
//! webhook configuration, deployment and service, which are then created
//! or updated to match.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: istio.banzaicloud.io/v1beta1
//! kind: Config
//! metadata:
//!   name: istio-config
//!   namespace: istio-system
//! spec:
//!   galley:
//!     replicaCount: 1
//! ```

pub mod conditions;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod k8sutil;
pub mod leader_election;
pub mod settings;

#[cfg(test)]
mod fixtures;

pub use controllers::ConfigController;
pub use crd::{
    ConfigCondition, ConfigPhase, ConfigSpec, ConfigStatus, GalleyConfiguration, IstioConfig,
};
pub use error::{OperatorError, Result};
pub use settings::Settings;
