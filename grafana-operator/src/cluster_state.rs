//! Read-only snapshot of the observed child objects of one Grafana
//! instance. Built fresh at the start of each reconcile, consumed by the
//! planner and discarded afterwards.

use std::fmt::Debug;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount},
    networking::v1::Ingress,
};
use kube::{Api, Client};
use serde::de::DeserializeOwned;

use crate::{
    errors::{ControllerError, ExtKubeApiError},
    resources,
};
use grafana_operator_apis::Grafana;

pub(crate) struct ClusterState {
    pub service_account: Option<ServiceAccount>,
    pub admin_secret: Option<Secret>,
    pub config: Option<ConfigMap>,
    pub data_pvc: Option<PersistentVolumeClaim>,
    pub service: Option<Service>,
    pub ingress: Option<Ingress>,
    pub deployment: Option<Deployment>,
}

impl ClusterState {
    pub async fn read(client: &Client, grafana: &Grafana) -> Result<Self, ControllerError> {
        let name = grafana.metadata.name.clone().unwrap_or_default();
        let namespace = grafana.metadata.namespace.clone().unwrap_or_default();
        let ns = namespace.as_str();
        Ok(Self {
            service_account: get_opt(
                &Api::namespaced(client.clone(), ns),
                resources::service_account_name(name.as_str()).as_str(),
            )
            .await?,
            admin_secret: get_opt(
                &Api::namespaced(client.clone(), ns),
                resources::admin_secret_name(name.as_str()).as_str(),
            )
            .await?,
            config: get_opt(
                &Api::namespaced(client.clone(), ns),
                resources::config_map_name(name.as_str()).as_str(),
            )
            .await?,
            data_pvc: get_opt(
                &Api::namespaced(client.clone(), ns),
                resources::pvc_name(name.as_str()).as_str(),
            )
            .await?,
            service: get_opt(
                &Api::namespaced(client.clone(), ns),
                resources::service_name(name.as_str()).as_str(),
            )
            .await?,
            ingress: get_opt(
                &Api::namespaced(client.clone(), ns),
                resources::ingress_name(name.as_str()).as_str(),
            )
            .await?,
            deployment: get_opt(
                &Api::namespaced(client.clone(), ns),
                resources::deployment_name(name.as_str()).as_str(),
            )
            .await?,
        })
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>, ControllerError>
where
    K: Clone + Debug + DeserializeOwned,
{
    match api.get(name).await {
        Ok(object) => Ok(Some(object)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e)?,
    }
}
