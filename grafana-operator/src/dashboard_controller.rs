use crate::{
    Configuration, FINALIZER,
    content::{cache, resolver::ContentResolver},
    dashboard_modifications::DashboardModifications,
    errors::ControllerError,
    grafana_api::GrafanaClient,
    hash,
    registry::{DashboardRef, FolderRef, Registry},
    utils::{instance_matches, metric_name},
};

use futures::{StreamExt, future::join_all};
use k8s_openapi::{api::core::v1::Namespace, chrono::Utc};
use kube::{Client, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::Store,
    watcher::Config,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use serde_json::{Value, json};
use grafana_operator_apis::{
    DashboardDatasource, Grafana, GrafanaDashboard, PHASE_FAILING, PHASE_RECONCILING,
};
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep};

const DASHBOARD_CONTROLLER: &'static str = "dashboard_controller";

/// Replace `${INPUT_NAME}` datasource placeholders in the raw dashboard
/// content with the configured datasource names.
pub(crate) fn substitute_datasources(
    content: &str,
    datasources: &[DashboardDatasource],
) -> String {
    let mut substituted = content.to_string();
    for ds in datasources {
        let placeholder = format!("${{{}}}", ds.input_name);
        substituted = substituted.replace(placeholder.as_str(), ds.datasource_name.as_str());
    }
    substituted
}

/// The hash short-circuit: an unchanged hash means no Grafana API write at
/// all, unless the target instance's state is suspect (`force`).
fn should_import(known: Option<&DashboardRef>, content_hash: &str, force: bool) -> bool {
    if force {
        return true;
    }
    known.map_or(true, |k| k.hash != content_hash)
}

/// The controller reconciling [`GrafanaDashboard`] objects: resolves the
/// declared content source, skips unchanged content by hash, and fans the
/// import out across every matching Grafana instance.
pub(crate) struct DashboardController {
    pub configuration: Configuration,
    grafana_cache: Store<Grafana>,
    namespace_cache: Store<Namespace>,
    registry: Arc<Registry>,
    resolver: ContentResolver,
    http: reqwest::Client,
    default_timeout: std::time::Duration,
    reconcile_dashboard_count: Counter<u64>,
    reconcile_dashboard_duration: Histogram<u64>,
}

impl DashboardController {
    pub fn new(
        configuration: Configuration,
        grafana_cache: Store<Grafana>,
        namespace_cache: Store<Namespace>,
        registry: Arc<Registry>,
        resolver: ContentResolver,
        http: reqwest::Client,
        default_timeout: std::time::Duration,
    ) -> Self {
        let meter: Meter = global::meter(DASHBOARD_CONTROLLER);
        let reconcile_dashboard_count = meter
            .u64_counter(metric_name("dashboard_reconcile_count"))
            .with_description("Count of GrafanaDashboard reconcile invocations")
            .build();
        let reconcile_dashboard_duration = meter
            .u64_histogram(metric_name("dashboard_reconcile_duration_ms"))
            .with_description("Reconcile duration of GrafanaDashboard objects in milliseconds")
            .build();
        Self {
            configuration,
            grafana_cache,
            namespace_cache,
            registry,
            resolver,
            http,
            default_timeout,
            reconcile_dashboard_count,
            reconcile_dashboard_duration,
        }
    }

    fn client(&self) -> Client {
        self.configuration.client.clone()
    }

    fn matching_instances(&self, dashboard: &GrafanaDashboard) -> Vec<Arc<Grafana>> {
        let namespace = dashboard.metadata.namespace.clone().unwrap_or_default();
        self.grafana_cache
            .state()
            .into_iter()
            .filter(|grafana| {
                instance_matches(
                    grafana,
                    namespace.as_str(),
                    dashboard.labels(),
                    &self.namespace_cache,
                )
            })
            .collect()
    }

    async fn grafana_client_for(&self, grafana: &Grafana) -> Result<GrafanaClient, ControllerError> {
        GrafanaClient::for_instance(&self.client(), &self.http, grafana, self.default_timeout).await
    }

    fn import_payload(
        &self,
        dashboard: &GrafanaDashboard,
        content: &[u8],
        folder_id: Option<i64>,
    ) -> Result<(Value, String), ControllerError> {
        let raw = String::from_utf8_lossy(content);
        let substituted = substitute_datasources(raw.as_ref(), dashboard.datasources());
        let mut body: Value = serde_json::from_str(substituted.as_str()).map_err(|e| {
            ControllerError::Validation(format!(
                "dashboard content of {} is not valid JSON: {}",
                dashboard.id(),
                e
            ))
        })?;
        let uid = body
            .get("uid")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .unwrap_or_else(|| hash::stable_uid(dashboard.id().as_str()));
        if let Some(object) = body.as_object_mut() {
            object.insert("uid".to_string(), Value::String(uid.clone()));
            // Let Grafana assign its own numeric id on first import.
            object.remove("id");
        }
        Ok((
            json!({ "dashboard": body, "folderId": folder_id, "overwrite": true }),
            uid,
        ))
    }

    /// Import one dashboard into one instance. Returns `false` when the
    /// hash short-circuit proved the import redundant.
    async fn import_into(
        &self,
        grafana: &Grafana,
        dashboard: &GrafanaDashboard,
        content: &[u8],
        content_hash: &str,
    ) -> Result<bool, ControllerError> {
        let instance = grafana.id();
        let id = dashboard.id();
        // An instance that disappeared and reappeared under a new UID makes
        // all known state suspect and bypasses the hash short-circuit.
        let force = self
            .registry
            .note_instance(instance.as_str(), grafana.uid().unwrap_or_default().as_str());
        let known = self.registry.dashboard(instance.as_str(), id.as_str());
        if !should_import(known.as_ref(), content_hash, force) {
            debug!(
                "dashboard {} is unchanged on {} (hash {}), skipping import",
                id, instance, content_hash
            );
            return Ok(false);
        }
        let client = self.grafana_client_for(grafana).await?;
        let title = dashboard.folder_title();
        let folder_uid = hash::stable_uid(title.as_str());
        let folder = client.ensure_folder(title.as_str(), folder_uid.as_str()).await?;
        let permissions = grafana.spec.folder_permissions.clone().unwrap_or_default();
        let folder_hash = hash::folder_hash(
            title.as_str(),
            dashboard.metadata.namespace.as_deref().unwrap_or(""),
            &permissions,
        );
        let known_folder = self.registry.folder(instance.as_str(), folder.id);
        if known_folder.map(|f| f.hash) != Some(folder_hash.clone()) {
            if !permissions.is_empty() {
                client
                    .set_folder_permissions(folder.uid.as_str(), &permissions)
                    .await?;
            }
            self.registry.set_folder(
                instance.as_str(),
                FolderRef {
                    title: folder.title.clone(),
                    uid: folder.uid.clone(),
                    id: folder.id,
                    hash: folder_hash,
                },
            );
        }
        let (payload, uid) = self.import_payload(dashboard, content, Some(folder.id))?;
        let imported_uid = client.import_dashboard(&payload).await?.unwrap_or(uid);
        self.registry.set_dashboard(
            instance.as_str(),
            id.as_str(),
            DashboardRef {
                name: dashboard.metadata.name.clone().unwrap_or_default(),
                namespace: dashboard.metadata.namespace.clone().unwrap_or_default(),
                uid: imported_uid,
                hash: content_hash.to_string(),
                folder_id: Some(folder.id),
                folder_name: Some(folder.title),
                plugins: dashboard.plugins().to_vec(),
            },
        );
        info!("imported dashboard {} into {}", id, instance);
        Ok(true)
    }

    async fn check(&self, event: &mut DashboardModifications) -> Result<(), ControllerError> {
        let finalizers = &mut event.finalizers_mut();
        if finalizers.iter().find(|f| f.as_str() == FINALIZER).is_none() {
            finalizers.push(FINALIZER.to_string());
            event.patch_spec(self.client()).await?;
        }
        let instances = self.matching_instances(&event.modified);
        if instances.is_empty() {
            event.update_phase(
                PHASE_RECONCILING,
                "no matching Grafana instances".to_string(),
            );
            event.replace_status(self.client()).await?;
            return Ok(());
        }
        let now = Utc::now();
        let resolved = self.resolver.resolve(&event.modified, now).await?;
        if !resolved.from_cache {
            if let Some(url) = &resolved.source_url {
                cache::put(&mut event.modified, url.as_str(), &resolved.content, now)
                    .map_err(|e| anyhow::anyhow!("failed to compress content cache: {}", e))?;
            }
        }
        let content_hash = hash::dashboard_hash(
            &resolved.content,
            event.datasources(),
            event.spec.custom_folder.as_deref(),
        );
        let dashboard = event.modified.clone();
        // One concurrent import per matching instance; each branch returns
        // its own result and failures never cancel sibling branches.
        let results = join_all(instances.iter().map(|grafana| {
            let content = resolved.content.as_slice();
            let content_hash = content_hash.as_str();
            let dashboard = &dashboard;
            async move {
                (
                    grafana.id(),
                    self.import_into(grafana, dashboard, content, content_hash).await,
                )
            }
        }))
        .await;
        let mut errors: Vec<ControllerError> = Vec::new();
        let mut imported = 0usize;
        for (instance, result) in results {
            match result {
                Ok(true) => imported += 1,
                Ok(false) => (),
                Err(e) => {
                    error!(
                        "failed to import dashboard {} into {}: {}",
                        event.id(),
                        instance,
                        e
                    );
                    errors.push(e);
                }
            }
        }
        if errors.is_empty() {
            if imported > 0 {
                info!(
                    "imported dashboard {} into {} out of {} matching instances",
                    event.id(),
                    imported,
                    instances.len()
                );
            }
            // Keep the success message stable so an unchanged pass writes
            // no status update at all.
            let mut status = event.status.take().unwrap_or_default();
            status.hash = Some(content_hash);
            status.phase = Some(PHASE_RECONCILING.to_string());
            status.message = Some(format!("in sync with {} instance(s)", instances.len()));
            event.status = Some(status);
            event.replace_status(self.client()).await?;
            Ok(())
        } else {
            event.update_phase(
                PHASE_FAILING,
                format!(
                    "failed to import into {} out of {} instances",
                    errors.len(),
                    instances.len()
                ),
            );
            event.replace_status(self.client()).await?;
            Err(ControllerError::Aggregate(errors))
        }
    }

    async fn delete(&self, event: &mut DashboardModifications) -> Result<(), ControllerError> {
        let id = event.id();
        let mut errors: Vec<ControllerError> = Vec::new();
        for (instance, known) in self.registry.instances_with_dashboard(id.as_str()) {
            let grafana = self
                .grafana_cache
                .state()
                .into_iter()
                .find(|g| g.id() == instance);
            let Some(grafana) = grafana else {
                // The instance itself is gone, nothing left to clean up
                // remotely.
                self.registry.remove_dashboard(instance.as_str(), id.as_str());
                continue;
            };
            let outcome: Result<(), ControllerError> = async {
                let client = self.grafana_client_for(&grafana).await?;
                client.delete_dashboard(known.uid.as_str()).await?;
                debug!(
                    "deleted dashboard {}/{} (uid {}) from {}",
                    known.namespace, known.name, known.uid, instance
                );
                self.registry.remove_dashboard(instance.as_str(), id.as_str());
                if let Some(folder_id) = known.folder_id {
                    // Shared folders stay alive while any other dashboard
                    // still points at them.
                    if !self.registry.folder_in_use(instance.as_str(), folder_id) {
                        if let Some(folder) = self.registry.folder(instance.as_str(), folder_id) {
                            client.delete_folder(folder.uid.as_str()).await?;
                            self.registry.remove_folder(instance.as_str(), folder_id);
                            info!(
                                "deleted folder {} on {} as its last dashboard is gone",
                                folder.title, instance
                            );
                        } else if let Some(title) = known.folder_name.as_deref() {
                            // The folder ref was lost (e.g. operator
                            // restart), derive the UID from the title.
                            client.delete_folder(hash::stable_uid(title).as_str()).await?;
                            info!(
                                "deleted folder {} on {} as its last dashboard is gone",
                                title, instance
                            );
                        }
                    }
                }
                Ok(())
            }
            .await;
            if let Err(e) = outcome {
                error!("failed to remove dashboard {} from {}: {}", id, instance, e);
                errors.push(e);
            }
        }
        if !errors.is_empty() {
            return Err(ControllerError::Aggregate(errors));
        }
        let finalizers: &mut Vec<String> = &mut event.finalizers_mut();
        let original_size = finalizers.len();
        finalizers.retain(|f| f.as_str() != FINALIZER);
        if finalizers.len() != original_size {
            event.patch_spec(self.client()).await?;
        }
        info!("successfully removed dashboard {} from all instances", id);
        Ok(())
    }

    /// Controller triggers this whenever our main object changed
    async fn reconcile(
        object: Arc<GrafanaDashboard>,
        ctx: Arc<Self>,
    ) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let mut event = DashboardModifications::new(object.as_ref().clone());
        let namespace = event.namespace().unwrap_or_else(|| "".to_string());
        if me
            .configuration
            .watch_namespaces
            .as_ref()
            .map_or(true, |v| {
                v.is_empty() || v.contains(namespace.as_str()) || v.contains("*")
            })
        {
            let start = Instant::now();
            if event.is_deleted() {
                me.delete(&mut event).await?;
            } else {
                if let Err(e) = me.check(&mut event).await {
                    event.update_phase(PHASE_FAILING, format!("{}", e));
                    event.replace_status(me.client()).await?;
                    Err(e)?
                }
            };
            let duration = Instant::now() - start;
            let labels = &[
                KeyValue::new("object_name", event.name_any()),
                KeyValue::new("object_namespace", namespace),
            ];
            me.reconcile_dashboard_count.add(1, labels);
            me.reconcile_dashboard_duration
                .record(duration.as_millis() as u64, labels);
        } else {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch for GrafanaDashboard objects",
                event.id()
            );
        }
        Ok(Action::requeue(Duration::from_secs(3600)))
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(
        _object: Arc<GrafanaDashboard>,
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
        let controller = Controller::new(self.configuration.dashboards.clone(), Config::default());
        controller
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(|res| async move {
                match res {
                    Ok(o) => {
                        debug!("reconciled {:?}", o);
                    }
                    Err(e) => {
                        let meter: Meter = global::meter(DASHBOARD_CONTROLLER);
                        let reconcile_dashboard_errors = meter
                            .u64_counter(metric_name("dashboard_reconcile_errors"))
                            .with_description(
                                "Count of reconcile invocation errors for GrafanaDashboard resources",
                            )
                            .build();
                        let labels = &[];
                        match e {
                            a @ kube_runtime::controller::Error::QueueError { .. } => {
                                debug!("reconcile failed: {:?}", a);
                                reconcile_dashboard_errors.add(1, labels);
                                // Slow down on errors caused by missing CRDs or permissions.
                                sleep(Duration::from_secs(30)).await;
                            }
                            a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                debug!("reconcile failed: {:?}", a);
                            }
                            e => {
                                warn!("reconcile failed: {:?}", e);
                                reconcile_dashboard_errors.add(1, labels);
                            }
                        };
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datasource_placeholders_are_substituted() {
        let content = r#"{"panels":[{"datasource":"${DS_PROMETHEUS}"},{"datasource":"${DS_LOKI}"}]}"#;
        let datasources = vec![
            DashboardDatasource {
                input_name: "DS_PROMETHEUS".to_string(),
                datasource_name: "Prometheus".to_string(),
            },
            DashboardDatasource {
                input_name: "DS_LOKI".to_string(),
                datasource_name: "Loki".to_string(),
            },
        ];
        assert_eq!(
            r#"{"panels":[{"datasource":"Prometheus"},{"datasource":"Loki"}]}"#,
            substitute_datasources(content, &datasources)
        );
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let content = r#"{"datasource":"${DS_OTHER}"}"#;
        assert_eq!(content, substitute_datasources(content, &[]));
    }

    #[test]
    fn unchanged_hash_skips_the_import() {
        let known = DashboardRef {
            name: "demo".to_string(),
            namespace: "monitoring".to_string(),
            uid: "u".to_string(),
            hash: "abc".to_string(),
            folder_id: None,
            folder_name: None,
            plugins: vec![],
        };
        assert!(!should_import(Some(&known), "abc", false));
        assert!(should_import(Some(&known), "def", false));
        // Suspect instance state bypasses the short-circuit.
        assert!(should_import(Some(&known), "abc", true));
        assert!(should_import(None, "abc", false));
    }
}
