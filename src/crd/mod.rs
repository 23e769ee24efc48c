//! Custom Resource Definitions for the Istio operator
//!
//! - Config: desired state of the Istio control plane

mod config;

pub use config::{
    ConfigCondition, ConfigPhase, ConfigSpec, ConfigStatus, GalleyConfiguration, IstioConfig,
};
