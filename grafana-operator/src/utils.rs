use std::collections::BTreeMap;

use json_patch::diff;
use k8s_openapi::{
    api::core::v1::Namespace,
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
};
use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
};
use kube_runtime::reflector::Store;
use rand::{Rng, distr::Alphanumeric};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};
use grafana_operator_apis::Grafana;

pub(crate) async fn add_finalizer_if_missing<T>(
    api: Api<T>,
    source: &mut T,
    finalizer: &str,
) -> Result<bool, ControllerError>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Resource,
{
    source.meta_mut().managed_fields = Default::default();
    let finalizers = source.finalizers_mut();
    if finalizers
        .iter()
        .find(|f| f.as_str() == finalizer)
        .is_none()
    {
        finalizers.push(finalizer.to_string());
        api.patch(
            source.name_any().as_str(),
            &PatchParams {
                field_manager: Some(MANAGER.to_string()),
                force: true,
                ..Default::default()
            },
            &Patch::Apply(source),
        )
        .await?;
        Ok(true)
    } else {
        Ok(false)
    }
}

pub(crate) async fn remove_finalizer<T>(
    api: Api<T>,
    source: &mut T,
    finalizer: &str,
) -> Result<bool, ControllerError>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Resource,
{
    let original = source.clone();
    let finalizers = source.finalizers_mut();
    let len = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    if finalizers.len() != len {
        // Use JSON Patch as server-side apply would not remove the finalizer on
        // objects whose fieldManager was not set properly by previous writers.
        let patch = diff(
            &serde_json::to_value(&original)?,
            &serde_json::to_value(&source)?,
        );
        match api
            .patch(
                source.name_any().as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::<T>::Json(patch),
            )
            .await
        {
            Ok(_) => (),
            Err(e) if e.is_not_found() => (),
            Err(e) => Err(e)?,
        }
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Evaluate a Kubernetes label selector against a label set.
pub(crate) fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for e in expressions {
            if !expression_matches(e, labels) {
                return false;
            }
        }
    }
    true
}

fn expression_matches(e: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(e.key.as_str());
    let values = e.values.as_deref().unwrap_or(&[]);
    match e.operator.as_str() {
        "In" => value.map_or(false, |v| values.iter().any(|x| x == v)),
        "NotIn" => value.map_or(true, |v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

/// Whether a content object in `namespace` with `labels` should be imported
/// into `grafana`. The namespace must either be the instance's own one or
/// match the instance's namespace selector; on top of that at least one of
/// the instance's label selectors must match. Instances without label
/// selectors import nothing.
pub(crate) fn instance_matches(
    grafana: &Grafana,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    namespace_cache: &Store<Namespace>,
) -> bool {
    let same_namespace = grafana.metadata.namespace.as_deref() == Some(namespace);
    let namespace_ok = if same_namespace {
        true
    } else if let Some(selector) = &grafana.spec.dashboard_namespace_selector {
        namespace_cache
            .state()
            .iter()
            .find(|ns| ns.name_any() == namespace)
            .map_or(false, |ns| selector_matches(selector, ns.labels()))
    } else {
        false
    };
    if !namespace_ok {
        return false;
    }
    grafana
        .spec
        .dashboard_label_selector
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|s| selector_matches(s, labels))
}

pub(crate) fn generate_password(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("grafana_operator_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grafana_operator_apis::GrafanaSpec;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(pairs)),
            match_expressions: None,
        }
    }

    #[test]
    fn match_labels_must_all_be_present() {
        let s = selector(&[("app", "grafana"), ("tier", "monitoring")]);
        assert!(selector_matches(
            &s,
            &labels(&[("app", "grafana"), ("tier", "monitoring"), ("extra", "x")])
        ));
        assert!(!selector_matches(&s, &labels(&[("app", "grafana")])));
    }

    #[test]
    fn match_expressions() {
        let s = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "env".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["prod".to_string(), "staging".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "legacy".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };
        assert!(selector_matches(&s, &labels(&[("env", "prod")])));
        assert!(!selector_matches(&s, &labels(&[("env", "dev")])));
        assert!(!selector_matches(
            &s,
            &labels(&[("env", "prod"), ("legacy", "true")])
        ));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = LabelSelector {
            match_labels: None,
            match_expressions: None,
        };
        assert!(selector_matches(&s, &labels(&[])));
    }

    #[test]
    fn instances_without_label_selectors_match_nothing() {
        let grafana = Grafana::new(
            "main",
            GrafanaSpec {
                dashboard_label_selector: None,
                dashboard_namespace_selector: None,
                config: None,
                ingress: None,
                data_storage: None,
                base_image: None,
                admin_user: None,
                admin_password: None,
                api_timeout_seconds: None,
                folder_permissions: None,
            },
        );
        let writer: kube_runtime::reflector::store::Writer<Namespace> = Default::default();
        let store = writer.as_reader();
        assert!(!instance_matches(
            &grafana,
            "monitoring",
            &labels(&[("app", "grafana")]),
            &store,
        ));
    }
}
