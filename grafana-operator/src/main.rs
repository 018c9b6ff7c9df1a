#[macro_use]
extern crate log;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use kube_runtime::{
    WatchStreamExt,
    reflector::{reflector, store::Writer},
    watcher::{self},
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus_exporter::start_prometheus_metrics_server;
use grafana_operator_apis::{Grafana, GrafanaDashboard, GrafanaNotificationChannel};
use std::{collections::HashSet, sync::Arc, time::Duration};
use url::Url;

mod channel_controller;
mod cluster_state;
mod content;
mod dashboard_controller;
mod dashboard_modifications;
mod errors;
mod grafana_api;
mod grafana_controller;
mod hash;
mod plan;
mod plugins;
mod prometheus_exporter;
mod registry;
mod resources;
mod utils;

use channel_controller::ChannelController;
use content::resolver::ContentResolver;
use dashboard_controller::DashboardController;
use grafana_api::{CatalogClient, DEFAULT_CATALOG_URL};
use grafana_controller::GrafanaController;
use registry::Registry;

/// The K8s field manager name.
const MANAGER: &'static str = "grafana-operator";

/// The K8s finalizer name.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects. So, think twice before you rename it, otherwise users might
/// be stuck with K8s objects which cannot be deleted as they have a finalizer
/// set which is not automatically removed.
const FINALIZER: &'static str = "grafana.rustrial.org/grafana-operator";

/// Default timeout for outward HTTP calls (Grafana admin API, grafana.com
/// catalog), overridable globally via `GRAFANA_API_TIMEOUT_SECONDS` and per
/// instance via `spec.apiTimeoutSeconds`.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Configuration {
    client: Client,
    grafanas: Api<Grafana>,
    dashboards: Api<GrafanaDashboard>,
    channels: Api<GrafanaNotificationChannel>,
    watch_namespaces: Option<HashSet<String>>,
}

impl Configuration {
    pub fn new(client: Client) -> Self {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        let watch_namespaces: Option<HashSet<String>> = env_var("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.to_string()).collect()))
            .flatten();
        let mut tmp = watch_namespaces.iter().flatten();
        let (grafanas, dashboards, channels) = if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            // Optimize for the use-case where exactly one watch-namespace is provided.
            info!("Controller is only watching resources in namespace {}", ns);
            (
                Api::<Grafana>::namespaced(client.clone(), ns.as_str()),
                Api::<GrafanaDashboard>::namespaced(client.clone(), ns.as_str()),
                Api::<GrafanaNotificationChannel>::namespaced(client.clone(), ns.as_str()),
            )
        } else {
            if let Some(namespaces) = &watch_namespaces {
                let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
                info!(
                    "Controller is watching resources in namespaces: {}",
                    namespaces.join(",")
                );
            } else {
                info!("Controller is watching resources in all namespaces");
            }
            (
                Api::<Grafana>::all(client.clone()),
                Api::<GrafanaDashboard>::all(client.clone()),
                Api::<GrafanaNotificationChannel>::all(client.clone()),
            )
        };
        Configuration {
            client,
            grafanas,
            dashboards,
            channels,
            watch_namespaces,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn ok<T, E>(_: T) -> Result<(), E> {
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
    let prometheus_registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(prometheus_registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    opentelemetry::global::set_meter_provider(provider);
    let prometheus_metrics_exporter =
        start_prometheus_metrics_server(metrics_addr, prometheus_registry);
    let client = Client::try_default().await?;
    // Namespace cache, used for namespace-selector matching.
    let namespace_watcher = watcher::watcher(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default(),
    );
    let writer: Writer<Namespace> = Default::default();
    let namespace_cache = writer.as_reader();
    let namespace_reflector = reflector(writer, namespace_watcher)
        .applied_objects()
        .try_for_each(ok);
    let configuration = Configuration::new(client.clone());
    // Grafana instance cache, used by dashboard/channel fan-out and the
    // dashboard-to-instance watch mapper.
    let grafana_watcher = watcher::watcher(
        configuration.grafanas.clone(),
        watcher::Config::default(),
    );
    let grafana_writer: Writer<Grafana> = Default::default();
    let grafana_cache = grafana_writer.as_reader();
    let grafana_reflector = reflector(grafana_writer, grafana_watcher)
        .applied_objects()
        .try_for_each(ok);
    let registry = Arc::new(Registry::new());
    let http = reqwest::Client::new();
    let default_timeout = env_var("GRAFANA_API_TIMEOUT_SECONDS")
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_API_TIMEOUT);
    let catalog_url = env_var("GRAFANA_COM_API_URL")
        .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string());
    let catalog_url = Url::parse(catalog_url.as_str())?;
    let resolver = ContentResolver::new(
        client.clone(),
        http.clone(),
        CatalogClient::new(http.clone(), catalog_url.clone(), default_timeout),
        default_timeout,
    );
    let grafana_controller = GrafanaController::new(
        configuration.clone(),
        grafana_cache.clone(),
        namespace_cache.clone(),
        registry.clone(),
        CatalogClient::new(http.clone(), catalog_url, default_timeout),
    )
    .start();
    let dashboard_controller = DashboardController::new(
        configuration.clone(),
        grafana_cache.clone(),
        namespace_cache.clone(),
        registry.clone(),
        resolver,
        http.clone(),
        default_timeout,
    )
    .start();
    let channel_controller = ChannelController::new(
        configuration,
        grafana_cache,
        namespace_cache,
        registry,
        http,
        default_timeout,
    )
    .start();
    info!("start controllers ...");
    tokio::select! {
       _ = grafana_controller => (),
       _ = dashboard_controller => (),
       _ = channel_controller => (),
       _ = namespace_reflector => (),
       _ = grafana_reflector => (),
       _ = prometheus_metrics_exporter => (),
    };
    Ok(())
}
