use crate::{
    Configuration, MANAGER,
    cluster_state::ClusterState,
    errors::{ControllerError, ExtKubeApiError},
    grafana_api::CatalogClient,
    hash, plugins,
    plan::{DesiredAction, deployment_ready},
    registry::Registry,
    resources::{self, EffectiveConfig},
    utils::{generate_password, instance_matches, metric_name},
};

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Secret, Service, ServiceAccount},
    networking::v1::Ingress,
};
use kube::{Api, Client, Resource, ResourceExt, api::PostParams};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::{ObjectRef, Store},
    watcher::Config,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, fmt::Debug, future::Future, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep};
use grafana_operator_apis::{
    Condition, Grafana, GrafanaDashboard, PHASE_FAILING, PHASE_RECONCILING, PluginRequirement,
};

const GRAFANA_CONTROLLER: &'static str = "grafana_controller";

const READY: &'static str = "Ready";
const SUCCESS: &'static str = "Success";
const FAILURE: &'static str = "Failure";

/// The controller reconciling [`Grafana`] instances: provisions the
/// supporting cluster objects in dependency order and maintains the
/// consolidated plugin install list.
pub(crate) struct GrafanaController {
    pub configuration: Configuration,
    grafana_cache: Store<Grafana>,
    namespace_cache: Store<Namespace>,
    registry: Arc<Registry>,
    catalog: CatalogClient,
    reconcile_grafana_count: Counter<u64>,
    reconcile_grafana_duration: Histogram<u64>,
}

impl GrafanaController {
    pub fn new(
        configuration: Configuration,
        grafana_cache: Store<Grafana>,
        namespace_cache: Store<Namespace>,
        registry: Arc<Registry>,
        catalog: CatalogClient,
    ) -> Self {
        let meter: Meter = global::meter(GRAFANA_CONTROLLER);
        let reconcile_grafana_count = meter
            .u64_counter(metric_name("grafana_reconcile_count"))
            .with_description("Count of Grafana reconcile invocations")
            .build();
        let reconcile_grafana_duration = meter
            .u64_histogram(metric_name("grafana_reconcile_duration_ms"))
            .with_description("Reconcile duration of Grafana objects in milliseconds")
            .build();
        Self {
            configuration,
            grafana_cache,
            namespace_cache,
            registry,
            catalog,
            reconcile_grafana_count,
            reconcile_grafana_duration,
        }
    }

    fn client(&self) -> Client {
        self.configuration.client.clone()
    }

    /// Probe consolidation candidates against the plugin catalog. A plugin
    /// proven absent lands in the failed set and is never retried; a
    /// transient probe failure keeps the currently installed version so
    /// nothing gets uninstalled by accident.
    async fn verify_plugins(
        &self,
        instance: &str,
        candidates: Vec<PluginRequirement>,
        installed: &BTreeMap<String, String>,
    ) -> Vec<PluginRequirement> {
        let mut verified: Vec<PluginRequirement> = Vec::new();
        for plugin in candidates {
            if installed.get(plugin.name.as_str()) == Some(&plugin.version) {
                verified.push(plugin);
                continue;
            }
            match self.catalog.plugin_exists(plugin.name.as_str()).await {
                Ok(true) => verified.push(plugin),
                Ok(false) => {
                    warn!(
                        "plugin {} does not exist on the plugin catalog, it will not be retried",
                        plugin
                    );
                    self.registry.mark_plugin_failed(instance, &plugin);
                }
                Err(e) => {
                    warn!(
                        "failed to probe plugin {} for {}: {}, keeping current state this pass",
                        plugin, instance, e
                    );
                    if let Some(version) = installed.get(plugin.name.as_str()) {
                        verified.push(PluginRequirement {
                            name: plugin.name.clone(),
                            version: version.clone(),
                        });
                    }
                }
            }
        }
        verified
    }

    async fn run_action<K>(
        &self,
        instance: &str,
        kind: &str,
        api: Api<K>,
        observed: Option<&K>,
        desired: Option<K>,
        merge: impl FnOnce(&K, K) -> K,
    ) -> Result<(), ControllerError>
    where
        K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    {
        let action = DesiredAction::plan(observed, desired, merge);
        match &action {
            DesiredAction::NoOp => debug!("{}: {}", instance, action.message(kind)),
            _ => info!("{}: {}", instance, action.message(kind)),
        }
        action.apply(&api).await
    }

    async fn check(&self, grafana: &Grafana) -> Result<Action, ControllerError> {
        let instance = grafana.id();
        let effective = EffectiveConfig::resolve(grafana);
        if self
            .registry
            .note_instance(instance.as_str(), grafana.uid().unwrap_or_default().as_str())
        {
            info!(
                "instance {} reappeared under a new UID, known import state was dropped",
                instance
            );
        }
        // Consolidate plugins first: the install list is baked into the
        // Deployment environment below.
        let requested = self.registry.requested_plugins(instance.as_str());
        let installed = self.registry.installed_plugins(instance.as_str());
        let failed = self.registry.failed_plugins(instance.as_str());
        let consolidation = plugins::consolidate(&requested, &installed, &failed);
        // Probing is only needed when the engine proposes a change; an
        // unchanged list contains nothing but already installed plugins.
        let verified = if consolidation.changed {
            self.verify_plugins(instance.as_str(), consolidation.plugins, &installed)
                .await
        } else {
            consolidation.plugins
        };
        let verified_map: BTreeMap<String, String> = verified
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect();
        if verified_map != installed {
            info!(
                "plugin install list of {} changed: [{}]",
                instance,
                plugins::install_list(&verified)
            );
            self.registry
                .set_installed_plugins(instance.as_str(), &verified);
        }
        let plugin_list = plugins::install_list(&verified);

        let state = ClusterState::read(&self.client(), grafana).await?;
        let namespace = effective.namespace.clone();
        let ns = namespace.as_str();
        let name = effective.name.as_str();

        self.run_action(
            instance.as_str(),
            "ServiceAccount",
            Api::<ServiceAccount>::namespaced(self.client(), ns),
            state.service_account.as_ref(),
            Some(resources::build_service_account(&effective)),
            resources::merge_metadata,
        )
        .await?;
        // The credentials Secret is created once and never regenerated
        // while present, so the admin password stays stable.
        if state.admin_secret.is_none() {
            let password = effective
                .admin_password
                .clone()
                .unwrap_or_else(|| generate_password(24));
            let api = Api::<Secret>::namespaced(self.client(), ns);
            let mut pp = PostParams::default();
            pp.field_manager = Some(MANAGER.to_string());
            info!("{}: creating admin credentials Secret", instance);
            api.create(&pp, &resources::build_admin_secret(&effective, password.as_str()))
                .await?;
        }
        let config_map = resources::build_config_map(&effective);
        let config_hash = hash::sha256_hex(
            config_map
                .data
                .as_ref()
                .and_then(|d| d.get("grafana.ini"))
                .map(|v| v.as_bytes())
                .unwrap_or_default(),
        );
        self.run_action(
            instance.as_str(),
            "ConfigMap",
            Api::<ConfigMap>::namespaced(self.client(), ns),
            state.config.as_ref(),
            Some(config_map),
            resources::merge_metadata,
        )
        .await?;
        self.run_action(
            instance.as_str(),
            "PersistentVolumeClaim",
            Api::<PersistentVolumeClaim>::namespaced(self.client(), ns),
            state.data_pvc.as_ref(),
            effective
                .storage_enabled
                .then(|| resources::build_pvc(&effective)),
            resources::merge_pvc,
        )
        .await?;
        self.run_action(
            instance.as_str(),
            "Service",
            Api::<Service>::namespaced(self.client(), ns),
            state.service.as_ref(),
            Some(resources::build_service(&effective)),
            resources::merge_service,
        )
        .await?;
        self.run_action(
            instance.as_str(),
            "Ingress",
            Api::<Ingress>::namespaced(self.client(), ns),
            state.ingress.as_ref(),
            effective
                .ingress_enabled
                .then(|| resources::build_ingress(&effective)),
            resources::merge_metadata,
        )
        .await?;
        self.run_action(
            instance.as_str(),
            "Deployment",
            Api::<Deployment>::namespaced(self.client(), ns),
            state.deployment.as_ref(),
            Some(resources::build_deployment(
                &effective,
                config_hash.as_str(),
                plugin_list.as_str(),
            )),
            resources::merge_metadata,
        )
        .await?;

        let admin_url = resources::admin_url(&effective);
        // Terminal readiness check: planning work is done, this only
        // decides whether the reconcile reports progress or completion.
        let ready = state.deployment.as_ref().map_or(false, deployment_ready);
        let message = if ready {
            format!("instance {} is ready", name)
        } else {
            format!("waiting for deployment {} to roll out", resources::deployment_name(name))
        };
        self.update_status(
            grafana,
            PHASE_RECONCILING,
            message.clone(),
            Condition::new(READY, Some(ready), SUCCESS, message),
            Some(admin_url),
            Some(verified),
        )
        .await?;
        if ready {
            Ok(Action::requeue(Duration::from_secs(300)))
        } else {
            Ok(Action::requeue(Duration::from_secs(60)))
        }
    }

    /// Best-effort status write: a conflicting concurrent write is
    /// ignored, the next reconcile re-derives the value.
    async fn update_status(
        &self,
        grafana: &Grafana,
        phase: &str,
        message: String,
        condition: Condition,
        admin_url: Option<String>,
        installed_plugins: Option<Vec<PluginRequirement>>,
    ) -> Result<(), ControllerError> {
        let namespace = grafana.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Grafana> = Api::namespaced(self.client(), namespace.as_str());
        let name = grafana.name_any();
        let mut latest = match api.get_status(name.as_str()).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => Err(e)?,
        };
        let previous = latest.status.clone();
        latest.update_phase(phase, message);
        latest.update_condition(condition);
        let mut status = latest.status.take().unwrap_or_default();
        if admin_url.is_some() {
            status.admin_url = admin_url;
        }
        if installed_plugins.is_some() {
            status.installed_plugins = installed_plugins;
        }
        let failed: Vec<PluginRequirement> = {
            let mut failed: Vec<PluginRequirement> = self
                .registry
                .failed_plugins(grafana.id().as_str())
                .into_iter()
                .map(|(name, version)| PluginRequirement { name, version })
                .collect();
            failed.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
            failed
        };
        status.failed_plugins = if failed.is_empty() { None } else { Some(failed) };
        latest.status = Some(status);
        if latest.status == previous {
            return Ok(());
        }
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        match api
            .replace_status(name.as_str(), &pp, serde_json::to_vec(&latest)?)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(
                    "ignoring status write conflict for {}, next reconcile re-derives it",
                    grafana.id()
                );
                Ok(())
            }
            Err(e) => Err(e)?,
        }
    }

    /// Controller triggers this whenever our main object changed
    async fn reconcile(object: Arc<Grafana>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let namespace = object.namespace().unwrap_or_else(|| "".to_string());
        if me
            .configuration
            .watch_namespaces
            .as_ref()
            .map_or(true, |v| {
                v.is_empty() || v.contains(namespace.as_str()) || v.contains("*")
            })
        {
            let start = Instant::now();
            let action = if object.metadata.deletion_timestamp.is_some() {
                // Child objects are owned and garbage collected by the
                // cluster, only the in-memory import state needs dropping.
                me.registry.forget_instance(object.id().as_str());
                Action::await_change()
            } else {
                match me.check(object.as_ref()).await {
                    Ok(action) => action,
                    Err(e) => {
                        me.update_status(
                            object.as_ref(),
                            PHASE_FAILING,
                            format!("{}", e),
                            Condition::new(READY, Some(false), FAILURE, format!("{}", e)),
                            None,
                            None,
                        )
                        .await?;
                        Err(e)?
                    }
                }
            };
            let duration = Instant::now() - start;
            let labels = &[
                KeyValue::new("object_name", object.name_any()),
                KeyValue::new("object_namespace", namespace),
            ];
            me.reconcile_grafana_count.add(1, labels);
            me.reconcile_grafana_duration
                .record(duration.as_millis() as u64, labels);
            Ok(action)
        } else {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch for Grafana objects",
                object.id()
            );
            Ok(Action::requeue(Duration::from_secs(3600)))
        }
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(_object: Arc<Grafana>, error: &ControllerError, _ctx: Arc<Self>) -> Action {
        if error.is_temporary() {
            Action::requeue(Duration::from_secs(30))
        } else {
            Action::requeue(Duration::from_secs(300))
        }
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let mapper_instances = self.grafana_cache.clone();
        let mapper_namespaces = self.namespace_cache.clone();
        let controller = Controller::new(self.configuration.grafanas.clone(), Config::default())
            // Dashboard changes re-trigger the instances they match so the
            // plugin install list follows the content fleet.
            .watches(
                Api::<GrafanaDashboard>::all(self.configuration.client.clone()),
                Config::default(),
                move |dashboard: GrafanaDashboard| {
                    let namespace = dashboard.metadata.namespace.clone().unwrap_or_default();
                    mapper_instances
                        .state()
                        .into_iter()
                        .filter(|grafana| {
                            instance_matches(
                                grafana,
                                namespace.as_str(),
                                dashboard.labels(),
                                &mapper_namespaces,
                            )
                        })
                        .map(|grafana| ObjectRef::from_obj(grafana.as_ref()))
                        .collect::<Vec<_>>()
                },
            );
        controller
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(|res| async move {
                match res {
                    Ok(o) => {
                        debug!("reconciled {:?}", o);
                    }
                    Err(e) => {
                        let meter: Meter = global::meter(GRAFANA_CONTROLLER);
                        let reconcile_grafana_errors = meter
                            .u64_counter(metric_name("grafana_reconcile_errors"))
                            .with_description(
                                "Count of reconcile invocation errors for Grafana resources",
                            )
                            .build();
                        match e {
                            a @ kube_runtime::controller::Error::QueueError { .. } => {
                                debug!("reconcile failed: {:?}", a);
                                reconcile_grafana_errors.add(1, &[]);
                                // Slow down on errors caused by missing CRDs or permissions.
                                sleep(Duration::from_secs(30)).await;
                            }
                            a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                debug!("reconcile failed: {:?}", a);
                            }
                            e => {
                                warn!("reconcile failed: {:?}", e);
                                reconcile_grafana_errors.add(1, &[]);
                            }
                        };
                    }
                }
            })
    }
}
