//! Config Controller
//!
//! Reconciles Istio `Config` custom resources into the Galley component
//! and reports Galley availability back on the resource status.

use crate::conditions::{
    build_condition, set_condition, CONDITION_FALSE, CONDITION_GALLEY_AVAILABLE,
    CONDITION_RECONCILED, CONDITION_TRUE, CONDITION_UNKNOWN, CONFIG_FINALIZER,
};
use crate::controllers::galley::{self, DEPLOYMENT_NAME};
use crate::controllers::error_policy_backoff;
use crate::crd::{ConfigPhase, ConfigStatus, IstioConfig};
use crate::error::{OperatorError, Result};
use crate::settings::Settings;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Context for the config controller
pub struct ConfigController {
    client: Client,
    settings: Settings,
}

/// Observed state of the Galley deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GalleyReadiness {
    pub desired: i32,
    pub ready: i32,
}

impl ConfigController {
    /// Create a new config controller
    pub fn new(client: Client, settings: Settings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        match &self.settings.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run the config controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let configs: Api<IstioConfig> = self.api();

        info!(
            namespace = self.settings.namespace.as_deref().unwrap_or("all"),
            "Starting Config controller"
        );

        Controller::new(configs, WatcherConfig::default())
            .owns(self.api::<Deployment>(), WatcherConfig::default())
            .owns(self.api::<Service>(), WatcherConfig::default())
            .owns(self.api::<ConfigMap>(), WatcherConfig::default())
            .owns(self.api::<ServiceAccount>(), WatcherConfig::default())
            .shutdown_on_signal()
            .run(
                |config, ctx| async move { ctx.reconcile(config).await },
                |config, error, ctx| {
                    error!(config = %config.name_any(), "Reconciliation error: {}", error);
                    error_policy_backoff(config, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        info!("Reconciled config: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile a Config
    async fn reconcile(&self, config: Arc<IstioConfig>) -> Result<Action> {
        let name = config.name_any();
        let namespace = config.namespace().ok_or_else(|| {
            OperatorError::InvalidSpec(format!("Config {} has no namespace", name))
        })?;

        info!("Reconciling Config {}/{}", namespace, name);

        if config.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&config, &namespace).await;
        }

        self.ensure_finalizer(&config, &namespace).await?;

        if !config.spec.galley.enabled {
            info!("Galley disabled for Config {}/{}, removing it", namespace, name);
            galley::remove_galley(&self.client, &namespace).await?;
            self.patch_status(&config, &namespace, disabled_status(&config))
                .await?;
            return Ok(Action::requeue(self.settings.requeue_interval));
        }

        if let Err(err) =
            galley::reconcile_galley(&self.client, &config, &self.settings.field_manager).await
        {
            let status = failed_status(&config, &err);
            if let Err(status_err) = self.patch_status(&config, &namespace, status).await {
                warn!("Failed to record failure on Config {}/{}: {}", namespace, name, status_err);
            }
            return Err(err);
        }

        let readiness = self.galley_readiness(&namespace).await?;
        self.patch_status(&config, &namespace, reconciled_status(&config, readiness))
            .await?;

        Ok(Action::requeue(self.settings.requeue_interval))
    }

    /// Ensure the finalizer is present on the resource
    async fn ensure_finalizer(&self, config: &IstioConfig, namespace: &str) -> Result<()> {
        let mut finalizers = config.finalizers().to_vec();
        if finalizers.iter().any(|f| f == CONFIG_FINALIZER) {
            return Ok(());
        }
        finalizers.push(CONFIG_FINALIZER.to_string());

        let configs: Api<IstioConfig> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        configs
            .patch(&config.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    /// Handle deletion: remove cluster-scoped objects, then the finalizer
    async fn handle_deletion(&self, config: &IstioConfig, namespace: &str) -> Result<Action> {
        let name = config.name_any();
        if !config.finalizers().iter().any(|f| f == CONFIG_FINALIZER) {
            return Ok(Action::await_change());
        }

        info!("Handling deletion of Config {}/{}", namespace, name);
        galley::remove_cluster_scoped(&self.client).await?;

        let finalizers: Vec<String> = config
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != CONFIG_FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        let configs: Api<IstioConfig> = Api::namespaced(self.client.clone(), namespace);
        configs
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!("Finalizer removed for Config {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    /// Read replica counts from the Galley deployment, if it exists yet
    async fn galley_readiness(&self, namespace: &str) -> Result<Option<GalleyReadiness>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = deployments.get_opt(DEPLOYMENT_NAME).await?;
        Ok(deployment.map(|d| GalleyReadiness {
            desired: d.spec.and_then(|s| s.replicas).unwrap_or(1),
            ready: d.status.and_then(|s| s.ready_replicas).unwrap_or(0),
        }))
    }

    /// Write `status` unless it matches what the Config already carries.
    ///
    /// Every status write is a watch event on the Config, so unchanged
    /// status must not be written back.
    async fn patch_status(
        &self,
        config: &IstioConfig,
        namespace: &str,
        mut status: ConfigStatus,
    ) -> Result<()> {
        if !status_changed(config.status.as_ref(), &status) {
            debug!(config = %config.name_any(), "status unchanged, skipping write");
            return Ok(());
        }
        status.last_updated = Some(Utc::now().to_rfc3339());

        let configs: Api<IstioConfig> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "status": status
        });
        configs
            .patch_status(&config.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Compare statuses ignoring `lastUpdated`
pub fn status_changed(current: Option<&ConfigStatus>, desired: &ConfigStatus) -> bool {
    let Some(current) = current else {
        return true;
    };
    let mut current = current.clone();
    current.last_updated = desired.last_updated.clone();
    current != *desired
}

fn base_status(config: &IstioConfig) -> ConfigStatus {
    let mut status = config.status.clone().unwrap_or_default();
    status.observed_generation = config.metadata.generation;
    status
}

/// Status after Galley objects were applied successfully
pub fn reconciled_status(config: &IstioConfig, readiness: Option<GalleyReadiness>) -> ConfigStatus {
    let mut status = base_status(config);
    status.error_message = None;
    set_condition(
        &mut status.conditions,
        build_condition(
            CONDITION_RECONCILED,
            CONDITION_TRUE,
            "ResourcesApplied",
            "All Galley resources are up to date",
        ),
    );

    let available = match readiness {
        Some(GalleyReadiness { desired, ready }) => {
            status.galley_ready_replicas = ready;
            let (cond_status, reason) = if ready >= desired {
                (CONDITION_TRUE, "MinimumReplicasAvailable")
            } else {
                (CONDITION_FALSE, "ReplicasNotReady")
            };
            set_condition(
                &mut status.conditions,
                build_condition(
                    CONDITION_GALLEY_AVAILABLE,
                    cond_status,
                    reason,
                    &format!("{}/{} Galley replicas ready", ready, desired),
                ),
            );
            ready >= desired
        }
        None => {
            status.galley_ready_replicas = 0;
            set_condition(
                &mut status.conditions,
                build_condition(
                    CONDITION_GALLEY_AVAILABLE,
                    CONDITION_UNKNOWN,
                    "DeploymentNotFound",
                    "Galley deployment has not been observed yet",
                ),
            );
            false
        }
    };

    status.phase = if available {
        ConfigPhase::Available
    } else {
        ConfigPhase::Reconciling
    };
    status
}

/// Status after a failed reconciliation
pub fn failed_status(config: &IstioConfig, err: &OperatorError) -> ConfigStatus {
    let mut status = base_status(config);
    status.phase = ConfigPhase::Failed;
    status.error_message = Some(err.to_string());
    set_condition(
        &mut status.conditions,
        build_condition(CONDITION_RECONCILED, CONDITION_FALSE, err.reason(), &err.to_string()),
    );
    status
}

/// Status when Galley is disabled on the Config
pub fn disabled_status(config: &IstioConfig) -> ConfigStatus {
    let mut status = base_status(config);
    status.phase = ConfigPhase::Disabled;
    status.galley_ready_replicas = 0;
    status.error_message = None;
    set_condition(
        &mut status.conditions,
        build_condition(CONDITION_RECONCILED, CONDITION_TRUE, "GalleyDisabled", "Galley is disabled"),
    );
    set_condition(
        &mut status.conditions,
        build_condition(
            CONDITION_GALLEY_AVAILABLE,
            CONDITION_FALSE,
            "GalleyDisabled",
            "Galley is disabled",
        ),
    );
    status
}
