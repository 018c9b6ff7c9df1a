use crate::{
    Configuration, FINALIZER, MANAGER,
    errors::{ControllerError, ExtKubeApiError},
    grafana_api::GrafanaClient,
    hash,
    registry::{ChannelRef, Registry},
    utils::{add_finalizer_if_missing, instance_matches, metric_name, remove_finalizer},
};

use futures::{StreamExt, future::join_all};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client, ResourceExt, api::PostParams};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::Store,
    watcher::Config,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use serde_json::Value;
use grafana_operator_apis::{
    Grafana, GrafanaNotificationChannel, PHASE_FAILING, PHASE_RECONCILING,
};
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep};

const CHANNEL_CONTROLLER: &'static str = "channel_controller";

/// The controller reconciling [`GrafanaNotificationChannel`] objects:
/// imports the inline channel body into every matching instance, keyed by
/// the `uid` declared in the body, skipping unchanged bodies by hash.
pub(crate) struct ChannelController {
    pub configuration: Configuration,
    grafana_cache: Store<Grafana>,
    namespace_cache: Store<Namespace>,
    registry: Arc<Registry>,
    http: reqwest::Client,
    default_timeout: std::time::Duration,
    reconcile_channel_count: Counter<u64>,
    reconcile_channel_duration: Histogram<u64>,
}

impl ChannelController {
    pub fn new(
        configuration: Configuration,
        grafana_cache: Store<Grafana>,
        namespace_cache: Store<Namespace>,
        registry: Arc<Registry>,
        http: reqwest::Client,
        default_timeout: std::time::Duration,
    ) -> Self {
        let meter: Meter = global::meter(CHANNEL_CONTROLLER);
        let reconcile_channel_count = meter
            .u64_counter(metric_name("channel_reconcile_count"))
            .with_description("Count of GrafanaNotificationChannel reconcile invocations")
            .build();
        let reconcile_channel_duration = meter
            .u64_histogram(metric_name("channel_reconcile_duration_ms"))
            .with_description(
                "Reconcile duration of GrafanaNotificationChannel objects in milliseconds",
            )
            .build();
        Self {
            configuration,
            grafana_cache,
            namespace_cache,
            registry,
            http,
            default_timeout,
            reconcile_channel_count,
            reconcile_channel_duration,
        }
    }

    fn client(&self) -> Client {
        self.configuration.client.clone()
    }

    fn api(&self, channel: &GrafanaNotificationChannel) -> Api<GrafanaNotificationChannel> {
        match channel.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client(), ns),
            None => Api::all(self.client()),
        }
    }

    fn matching_instances(&self, channel: &GrafanaNotificationChannel) -> Vec<Arc<Grafana>> {
        let namespace = channel.metadata.namespace.clone().unwrap_or_default();
        self.grafana_cache
            .state()
            .into_iter()
            .filter(|grafana| {
                instance_matches(
                    grafana,
                    namespace.as_str(),
                    channel.labels(),
                    &self.namespace_cache,
                )
            })
            .collect()
    }

    async fn grafana_client_for(&self, grafana: &Grafana) -> Result<GrafanaClient, ControllerError> {
        GrafanaClient::for_instance(&self.client(), &self.http, grafana, self.default_timeout).await
    }

    /// Best-effort status write: a conflicting concurrent write is
    /// ignored, the next reconcile re-derives the value.
    async fn update_status(
        &self,
        channel: &GrafanaNotificationChannel,
        phase: &str,
        message: String,
        hash: Option<String>,
    ) -> Result<(), ControllerError> {
        let api = self.api(channel);
        let name = channel.name_any();
        let mut latest = match api.get_status(name.as_str()).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => Err(e)?,
        };
        let previous = latest.status.clone();
        let mut status = latest.status.take().unwrap_or_default();
        status.phase = Some(phase.to_string());
        status.message = Some(message);
        if hash.is_some() {
            status.hash = hash;
        }
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
                    channel.id()
                );
                Ok(())
            }
            Err(e) => Err(e)?,
        }
    }

    async fn import_into(
        &self,
        grafana: &Grafana,
        channel: &GrafanaNotificationChannel,
        uid: &str,
        content_hash: &str,
    ) -> Result<bool, ControllerError> {
        let instance = grafana.id();
        let id = channel.id();
        let force = self
            .registry
            .note_instance(instance.as_str(), grafana.uid().unwrap_or_default().as_str());
        if !force {
            if let Some(known) = self.registry.channel(instance.as_str(), id.as_str()) {
                if known.hash == content_hash {
                    debug!(
                        "channel {} is unchanged on {} (hash {}), skipping import",
                        id, instance, content_hash
                    );
                    return Ok(false);
                }
            }
        }
        let body: Value = serde_json::from_str(channel.spec.json.as_str()).map_err(|e| {
            ControllerError::Validation(format!(
                "channel body of {} is not valid JSON: {}",
                id, e
            ))
        })?;
        let client = self.grafana_client_for(grafana).await?;
        match client.get_notification_channel(uid).await? {
            Some(_) => client.update_notification_channel(uid, &body).await?,
            None => client.create_notification_channel(&body).await?,
        }
        self.registry.set_channel(
            instance.as_str(),
            id.as_str(),
            ChannelRef {
                name: channel.metadata.name.clone().unwrap_or_default(),
                namespace: channel.metadata.namespace.clone().unwrap_or_default(),
                uid: uid.to_string(),
                hash: content_hash.to_string(),
            },
        );
        info!("imported notification channel {} into {}", id, instance);
        Ok(true)
    }

    async fn check(&self, channel: &GrafanaNotificationChannel) -> Result<(), ControllerError> {
        let mut latest = channel.clone();
        add_finalizer_if_missing(self.api(channel), &mut latest, FINALIZER).await?;
        let uid = channel.channel_uid().ok_or_else(|| {
            ControllerError::Validation(format!(
                "channel body of {} declares no uid",
                channel.id()
            ))
        })?;
        let content_hash = hash::channel_hash(
            channel.spec.json.as_str(),
            channel.metadata.name.as_deref().unwrap_or(""),
            channel.metadata.namespace.as_deref().unwrap_or(""),
        );
        let instances = self.matching_instances(channel);
        if instances.is_empty() {
            self.update_status(
                channel,
                PHASE_RECONCILING,
                "no matching Grafana instances".to_string(),
                None,
            )
            .await?;
            return Ok(());
        }
        let results = join_all(instances.iter().map(|grafana| {
            let uid = uid.as_str();
            let content_hash = content_hash.as_str();
            async move {
                (
                    grafana.id(),
                    self.import_into(grafana, channel, uid, content_hash).await,
                )
            }
        }))
        .await;
        let mut errors: Vec<ControllerError> = Vec::new();
        for (instance, result) in results {
            if let Err(e) = result {
                error!(
                    "failed to import channel {} into {}: {}",
                    channel.id(),
                    instance,
                    e
                );
                errors.push(e);
            }
        }
        if errors.is_empty() {
            self.update_status(
                channel,
                PHASE_RECONCILING,
                format!("in sync with {} instance(s)", instances.len()),
                Some(content_hash),
            )
            .await?;
            Ok(())
        } else {
            self.update_status(
                channel,
                PHASE_FAILING,
                format!(
                    "failed to import into {} out of {} instances",
                    errors.len(),
                    instances.len()
                ),
                None,
            )
            .await?;
            Err(ControllerError::Aggregate(errors))
        }
    }

    async fn delete(&self, channel: &GrafanaNotificationChannel) -> Result<(), ControllerError> {
        let id = channel.id();
        let mut errors: Vec<ControllerError> = Vec::new();
        for (instance, known) in self.registry.instances_with_channel(id.as_str()) {
            let grafana = self
                .grafana_cache
                .state()
                .into_iter()
                .find(|g| g.id() == instance);
            let Some(grafana) = grafana else {
                self.registry.remove_channel(instance.as_str(), id.as_str());
                continue;
            };
            let outcome: Result<(), ControllerError> = async {
                let client = self.grafana_client_for(&grafana).await?;
                client.delete_notification_channel(known.uid.as_str()).await?;
                debug!(
                    "deleted channel {}/{} (uid {}) from {}",
                    known.namespace, known.name, known.uid, instance
                );
                self.registry.remove_channel(instance.as_str(), id.as_str());
                Ok(())
            }
            .await;
            if let Err(e) = outcome {
                error!("failed to remove channel {} from {}: {}", id, instance, e);
                errors.push(e);
            }
        }
        if !errors.is_empty() {
            return Err(ControllerError::Aggregate(errors));
        }
        let mut latest = channel.clone();
        remove_finalizer(self.api(channel), &mut latest, FINALIZER).await?;
        info!("successfully removed channel {} from all instances", id);
        Ok(())
    }

    /// Controller triggers this whenever our main object changed
    async fn reconcile(
        object: Arc<GrafanaNotificationChannel>,
        ctx: Arc<Self>,
    ) -> Result<Action, ControllerError> {
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
            if object.metadata.deletion_timestamp.is_some() {
                me.delete(object.as_ref()).await?;
            } else {
                if let Err(e) = me.check(object.as_ref()).await {
                    me.update_status(object.as_ref(), PHASE_FAILING, format!("{}", e), None)
                        .await?;
                    Err(e)?
                }
            };
            let duration = Instant::now() - start;
            let labels = &[
                KeyValue::new("object_name", object.name_any()),
                KeyValue::new("object_namespace", namespace),
            ];
            me.reconcile_channel_count.add(1, labels);
            me.reconcile_channel_duration
                .record(duration.as_millis() as u64, labels);
        } else {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch for GrafanaNotificationChannel objects",
                object.id()
            );
        }
        Ok(Action::requeue(Duration::from_secs(3600)))
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(
        _object: Arc<GrafanaNotificationChannel>,
        error: &ControllerError,
        _ctx: Arc<Self>,
    ) -> Action {
        if error.is_temporary() {
            Action::requeue(Duration::from_secs(30))
        } else {
            Action::requeue(Duration::from_secs(300))
        }
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let controller = Controller::new(self.configuration.channels.clone(), Config::default());
        controller
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(|res| async move {
                match res {
                    Ok(o) => {
                        debug!("reconciled {:?}", o);
                    }
                    Err(e) => {
                        let meter: Meter = global::meter(CHANNEL_CONTROLLER);
                        let reconcile_channel_errors = meter
                            .u64_counter(metric_name("channel_reconcile_errors"))
                            .with_description(
                                "Count of reconcile invocation errors for GrafanaNotificationChannel resources",
                            )
                            .build();
                        match e {
                            a @ kube_runtime::controller::Error::QueueError { .. } => {
                                debug!("reconcile failed: {:?}", a);
                                reconcile_channel_errors.add(1, &[]);
                                // Slow down on errors caused by missing CRDs or permissions.
                                sleep(Duration::from_secs(30)).await;
                            }
                            a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                debug!("reconcile failed: {:?}", a);
                            }
                            e => {
                                warn!("reconcile failed: {:?}", e);
                                reconcile_channel_errors.add(1, &[]);
                            }
                        };
                    }
                }
            })
    }
}
