//! Desired-state planning and action execution for the child objects of a
//! Grafana instance.
//!
//! Planning is a pure function of the observed object and the desired
//! spec; execution happens per kind, in the fixed dependency order chosen
//! by the instance controller. Actions are single-use values and are never
//! mutated after planning.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};

pub(crate) enum DesiredAction<K> {
    Create(K),
    Update(K),
    Delete(K),
    NoOp,
}

impl<K> DesiredAction<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    /// Absent-in-current and wanted: create. Present and wanted: update
    /// with the merged object, where `merge` copies server-owned fields
    /// from the observed object. Present but unwanted: delete.
    pub fn plan(
        observed: Option<&K>,
        desired: Option<K>,
        merge: impl FnOnce(&K, K) -> K,
    ) -> Self {
        match (observed, desired) {
            (None, Some(desired)) => DesiredAction::Create(desired),
            (Some(observed), Some(desired)) => DesiredAction::Update(merge(observed, desired)),
            (Some(observed), None) => DesiredAction::Delete(observed.clone()),
            (None, None) => DesiredAction::NoOp,
        }
    }

    /// Human readable description used for log lines and events.
    pub fn message(&self, kind: &str) -> String {
        match self {
            DesiredAction::Create(o) => format!("creating {} {}", kind, o.name_any()),
            DesiredAction::Update(o) => format!("updating {} {}", kind, o.name_any()),
            DesiredAction::Delete(o) => format!("deleting {} {}", kind, o.name_any()),
            DesiredAction::NoOp => format!("nothing to do for {}", kind),
        }
    }

    /// Execute the action. Side effects only count as committed once the
    /// API call returned success; deleting an already-gone object is a
    /// success.
    pub async fn apply(self, api: &Api<K>) -> Result<(), ControllerError> {
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        match self {
            DesiredAction::Create(object) => {
                api.create(&pp, &object).await?;
            }
            DesiredAction::Update(object) => {
                api.replace(object.name_any().as_str(), &pp, &object).await?;
            }
            DesiredAction::Delete(object) => {
                match api
                    .delete(object.name_any().as_str(), &DeleteParams::default())
                    .await
                {
                    Ok(_) => (),
                    Err(e) if e.is_not_found() => (),
                    Err(e) => Err(e)?,
                }
            }
            DesiredAction::NoOp => (),
        }
        Ok(())
    }
}

/// Terminal planning step: does not mutate anything but downgrades the
/// reconcile outcome to "in progress" while the instance is rolling out.
pub(crate) fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_map(name: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm
    }

    #[test]
    fn absent_and_wanted_becomes_create() {
        let action = DesiredAction::plan(None, Some(config_map("a")), |_, d| d);
        assert_eq!("creating ConfigMap a", action.message("ConfigMap"));
    }

    #[test]
    fn present_and_wanted_becomes_update_with_merge() {
        let mut observed = config_map("a");
        observed.metadata.resource_version = Some("7".to_string());
        let action = DesiredAction::plan(Some(&observed), Some(config_map("a")), |o, mut d| {
            d.metadata.resource_version = o.metadata.resource_version.clone();
            d
        });
        match &action {
            DesiredAction::Update(merged) => {
                assert_eq!(Some("7".to_string()), merged.metadata.resource_version)
            }
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn present_but_unwanted_becomes_delete() {
        let observed = config_map("a");
        let action = DesiredAction::plan(Some(&observed), None, |_, d: ConfigMap| d);
        assert_eq!("deleting ConfigMap a", action.message("ConfigMap"));
    }

    #[test]
    fn absent_and_unwanted_is_a_noop() {
        let action: DesiredAction<ConfigMap> = DesiredAction::plan(None, None, |_, d| d);
        assert_eq!("nothing to do for ConfigMap", action.message("ConfigMap"));
    }

    #[test]
    fn readiness() {
        let mut deployment = Deployment::default();
        assert!(!deployment_ready(&deployment));
        deployment.status = Some(k8s_openapi::api::apps::v1::DeploymentStatus {
            ready_replicas: Some(1),
            ..Default::default()
        });
        assert!(deployment_ready(&deployment));
    }
}
