//! Builders for the child objects of a Grafana instance and the effective
//! configuration they are derived from. The builders are plain declarative
//! field mapping; all defaulting happens once in
//! [`EffectiveConfig::resolve`] so business logic never digs through
//! optional spec fields.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
            PodSpec, PodTemplateSpec, Secret, SecretKeySelector, Service, ServiceAccount,
            ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
    },
};
use kube::api::ObjectMeta;

use grafana_operator_apis::{FolderPermission, Grafana, MANAGED_BY};

const DEFAULT_BASE_IMAGE: &'static str = "docker.io/grafana/grafana:10.4.2";
const DEFAULT_ADMIN_USER: &'static str = "admin";
const DEFAULT_STORAGE_SIZE: &'static str = "1Gi";
const GRAFANA_PORT: i32 = 3000;

/// Annotation on the pod template carrying the hash of the rendered
/// configuration, so config changes roll the deployment.
pub(crate) const CONFIG_HASH_ANNOTATION: &'static str = "grafana.rustrial.org/config-hash";

/// All optional spec fields of a Grafana instance resolved to concrete
/// values, once, at the start of a reconcile.
pub(crate) struct EffectiveConfig {
    pub name: String,
    pub namespace: String,
    /// Kubernetes UID of the owning Grafana object; children carry an
    /// owner reference so the cluster garbage collects them on deletion.
    pub owner_uid: Option<String>,
    pub base_image: String,
    pub admin_user: String,
    pub admin_password: Option<String>,
    pub ingress_enabled: bool,
    pub ingress_hostname: Option<String>,
    pub ingress_path: String,
    pub storage_enabled: bool,
    pub storage_size: String,
    pub storage_class: Option<String>,
    pub config: BTreeMap<String, BTreeMap<String, String>>,
    pub folder_permissions: Vec<FolderPermission>,
}

impl EffectiveConfig {
    pub fn resolve(grafana: &Grafana) -> Self {
        let spec = &grafana.spec;
        let ingress = spec.ingress.as_ref();
        let storage = spec.data_storage.as_ref();
        Self {
            name: grafana.metadata.name.clone().unwrap_or_default(),
            namespace: grafana.metadata.namespace.clone().unwrap_or_default(),
            owner_uid: grafana.metadata.uid.clone(),
            base_image: spec
                .base_image
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string()),
            admin_user: spec
                .admin_user
                .clone()
                .unwrap_or_else(|| DEFAULT_ADMIN_USER.to_string()),
            admin_password: spec.admin_password.clone(),
            ingress_enabled: ingress.map_or(false, |i| i.enabled),
            ingress_hostname: ingress.and_then(|i| i.hostname.clone()),
            ingress_path: ingress
                .and_then(|i| i.path.clone())
                .unwrap_or_else(|| "/".to_string()),
            storage_enabled: storage.map_or(false, |s| s.enabled),
            storage_size: storage
                .and_then(|s| s.size.clone())
                .unwrap_or_else(|| DEFAULT_STORAGE_SIZE.to_string()),
            storage_class: storage.and_then(|s| s.storage_class.clone()),
            config: spec.config.clone().unwrap_or_default(),
            folder_permissions: spec.folder_permissions.clone().unwrap_or_default(),
        }
    }
}

pub(crate) fn service_account_name(name: &str) -> String {
    format!("{}-serviceaccount", name)
}

pub(crate) fn admin_secret_name(name: &str) -> String {
    format!("{}-admin-credentials", name)
}

pub(crate) fn config_map_name(name: &str) -> String {
    format!("{}-config", name)
}

pub(crate) fn pvc_name(name: &str) -> String {
    format!("{}-data", name)
}

pub(crate) fn service_name(name: &str) -> String {
    format!("{}-service", name)
}

pub(crate) fn ingress_name(name: &str) -> String {
    format!("{}-ingress", name)
}

pub(crate) fn deployment_name(name: &str) -> String {
    format!("{}-deployment", name)
}

/// In-cluster URL of the instance's HTTP API.
pub(crate) fn admin_url(effective: &EffectiveConfig) -> String {
    format!(
        "http://{}.{}.svc:{}",
        service_name(effective.name.as_str()),
        effective.namespace,
        GRAFANA_PORT
    )
}

pub(crate) fn instance_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels
}

fn metadata(effective: &EffectiveConfig, name: String) -> ObjectMeta {
    let owner_references = effective.owner_uid.as_ref().map(|uid| {
        vec![OwnerReference {
            api_version: "grafana.rustrial.org/v1alpha1".to_string(),
            kind: "Grafana".to_string(),
            name: effective.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            ..Default::default()
        }]
    });
    ObjectMeta {
        name: Some(name),
        namespace: Some(effective.namespace.clone()),
        labels: Some(instance_labels(effective.name.as_str())),
        owner_references,
        ..Default::default()
    }
}

/// Render the configuration sections into `grafana.ini`. BTreeMap keeps
/// section and key order stable so the config hash only changes when the
/// content does.
pub(crate) fn render_config(config: &BTreeMap<String, BTreeMap<String, String>>) -> String {
    let mut out = String::new();
    for (section, entries) in config {
        out.push_str(format!("[{}]\n", section).as_str());
        for (key, value) in entries {
            out.push_str(format!("{} = {}\n", key, value).as_str());
        }
        out.push('\n');
    }
    out
}

pub(crate) fn build_service_account(effective: &EffectiveConfig) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(effective, service_account_name(effective.name.as_str())),
        ..Default::default()
    }
}

pub(crate) fn build_admin_secret(effective: &EffectiveConfig, password: &str) -> Secret {
    let mut string_data = BTreeMap::new();
    string_data.insert("username".to_string(), effective.admin_user.clone());
    string_data.insert("password".to_string(), password.to_string());
    Secret {
        metadata: metadata(effective, admin_secret_name(effective.name.as_str())),
        string_data: Some(string_data),
        ..Default::default()
    }
}

pub(crate) fn build_config_map(effective: &EffectiveConfig) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("grafana.ini".to_string(), render_config(&effective.config));
    ConfigMap {
        metadata: metadata(effective, config_map_name(effective.name.as_str())),
        data: Some(data),
        ..Default::default()
    }
}

pub(crate) fn build_pvc(effective: &EffectiveConfig) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert(
        "storage".to_string(),
        Quantity(effective.storage_size.clone()),
    );
    PersistentVolumeClaim {
        metadata: metadata(effective, pvc_name(effective.name.as_str())),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: effective.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn build_service(effective: &EffectiveConfig) -> Service {
    Service {
        metadata: metadata(effective, service_name(effective.name.as_str())),
        spec: Some(ServiceSpec {
            selector: Some(instance_labels(effective.name.as_str())),
            ports: Some(vec![ServicePort {
                name: Some("grafana".to_string()),
                port: GRAFANA_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn build_ingress(effective: &EffectiveConfig) -> Ingress {
    Ingress {
        metadata: metadata(effective, ingress_name(effective.name.as_str())),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: effective.ingress_hostname.clone(),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(effective.ingress_path.clone()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name(effective.name.as_str()),
                                port: Some(ServiceBackendPort {
                                    number: Some(GRAFANA_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The Deployment is built last: its pod template embeds the config hash
/// and the consolidated plugin install list, so both must be known first.
pub(crate) fn build_deployment(
    effective: &EffectiveConfig,
    config_hash: &str,
    plugin_list: &str,
) -> Deployment {
    let secret_name = admin_secret_name(effective.name.as_str());
    let secret_env = |var: &str, key: &str| EnvVar {
        name: var.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.clone(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let data_volume = if effective.storage_enabled {
        Volume {
            name: "grafana-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(effective.name.as_str()),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: "grafana-data".to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        }
    };
    let mut annotations = BTreeMap::new();
    annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash.to_string());
    Deployment {
        metadata: metadata(effective, deployment_name(effective.name.as_str())),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(instance_labels(effective.name.as_str())),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(instance_labels(effective.name.as_str())),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account_name(effective.name.as_str())),
                    containers: vec![Container {
                        name: "grafana".to_string(),
                        image: Some(effective.base_image.clone()),
                        ports: Some(vec![ContainerPort {
                            name: Some("grafana".to_string()),
                            container_port: GRAFANA_PORT,
                            ..Default::default()
                        }]),
                        env: Some(vec![
                            secret_env("GF_SECURITY_ADMIN_USER", "username"),
                            secret_env("GF_SECURITY_ADMIN_PASSWORD", "password"),
                            EnvVar {
                                name: "GF_INSTALL_PLUGINS".to_string(),
                                value: Some(plugin_list.to_string()),
                                ..Default::default()
                            },
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "grafana-config".to_string(),
                                mount_path: "/etc/grafana/grafana.ini".to_string(),
                                sub_path: Some("grafana.ini".to_string()),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "grafana-data".to_string(),
                                mount_path: "/var/lib/grafana".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "grafana-config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: config_map_name(effective.name.as_str()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        data_volume,
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Carry the observed resourceVersion so replace does not clobber a
/// concurrent write.
pub(crate) fn merge_metadata<K: kube::Resource>(observed: &K, mut desired: K) -> K {
    desired.meta_mut().resource_version = observed.meta().resource_version.clone();
    desired
}

/// Services keep their server-assigned cluster IPs across updates.
pub(crate) fn merge_service(observed: &Service, desired: Service) -> Service {
    let mut desired = merge_metadata(observed, desired);
    if let (Some(desired_spec), Some(observed_spec)) = (desired.spec.as_mut(), observed.spec.as_ref())
    {
        desired_spec.cluster_ip = observed_spec.cluster_ip.clone();
        desired_spec.cluster_ips = observed_spec.cluster_ips.clone();
    }
    desired
}

/// PVC specs are immutable after creation, only metadata is reconciled.
pub(crate) fn merge_pvc(
    observed: &PersistentVolumeClaim,
    desired: PersistentVolumeClaim,
) -> PersistentVolumeClaim {
    let mut merged = observed.clone();
    merged.metadata.labels = desired.metadata.labels;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use grafana_operator_apis::{GrafanaDataStorage, GrafanaSpec};

    fn grafana() -> Grafana {
        let mut grafana = Grafana::new(
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
        grafana.metadata.namespace = Some("monitoring".to_string());
        grafana
    }

    #[test]
    fn effective_config_defaults() {
        let effective = EffectiveConfig::resolve(&grafana());
        assert_eq!(DEFAULT_BASE_IMAGE, effective.base_image);
        assert_eq!("admin", effective.admin_user);
        assert!(!effective.ingress_enabled);
        assert!(!effective.storage_enabled);
        assert_eq!("http://main-service.monitoring.svc:3000", admin_url(&effective));
    }

    #[test]
    fn render_config_is_deterministic() {
        let mut config = BTreeMap::new();
        let mut security = BTreeMap::new();
        security.insert("disable_gravatar".to_string(), "true".to_string());
        let mut auth = BTreeMap::new();
        auth.insert("disable_login_form".to_string(), "false".to_string());
        config.insert("security".to_string(), security);
        config.insert("auth".to_string(), auth);
        assert_eq!(
            "[auth]\ndisable_login_form = false\n\n[security]\ndisable_gravatar = true\n\n",
            render_config(&config)
        );
    }

    #[test]
    fn deployment_embeds_config_hash_and_plugins() {
        let mut g = grafana();
        g.spec.data_storage = Some(GrafanaDataStorage {
            enabled: true,
            size: Some("10Gi".to_string()),
            storage_class: None,
        });
        let effective = EffectiveConfig::resolve(&g);
        let deployment = build_deployment(&effective, "abc123", "clock 1.0.0");
        let template = deployment.spec.as_ref().unwrap().template.clone();
        let annotations = template.metadata.as_ref().unwrap().annotations.clone().unwrap();
        assert_eq!("abc123", annotations[CONFIG_HASH_ANNOTATION]);
        let container = &template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        let plugins = env.iter().find(|e| e.name == "GF_INSTALL_PLUGINS").unwrap();
        assert_eq!(Some("clock 1.0.0".to_string()), plugins.value);
        let volumes = template.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert!(
            volumes
                .iter()
                .any(|v| v.persistent_volume_claim.is_some())
        );
    }

    #[test]
    fn service_update_preserves_cluster_ip() {
        let effective = EffectiveConfig::resolve(&grafana());
        let mut observed = build_service(&effective);
        observed.metadata.resource_version = Some("42".to_string());
        observed.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".to_string());
        let merged = merge_service(&observed, build_service(&effective));
        assert_eq!(Some("42".to_string()), merged.metadata.resource_version);
        assert_eq!(
            Some("10.0.0.7".to_string()),
            merged.spec.as_ref().unwrap().cluster_ip
        );
    }
}
