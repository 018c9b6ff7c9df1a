use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::ConfigMapKeySelector,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
    chrono::{SecondsFormat, Utc},
};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "grafana.rustrial.org";

/// Value of the `app.kubernetes.io/managed-by` label set on all objects
/// created by the operator.
pub const MANAGED_BY: &'static str = "grafana-operator";

/// Status phase while the operator is still working towards the declared
/// state (or has reached it).
pub const PHASE_RECONCILING: &'static str = "reconciling";

/// Status phase after a non-transient reconciliation failure, see the
/// status message for details.
pub const PHASE_FAILING: &'static str = "failing";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }
}

/// A Grafana plugin requirement as declared by a dashboard, and the unit
/// tracked in the per-instance install list.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct PluginRequirement {
    /// The plugin name as published on the plugin catalog, e.g. `grafana-piechart-panel`.
    pub name: String,
    /// The exact plugin version to install.
    pub version: String,
}

impl std::fmt::Display for PluginRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Permission entry applied to folders created by the operator. Exactly one
/// of `role`, `team_id` or `user_id` identifies the grantee.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct FolderPermission {
    /// Built-in role name (`Viewer`, `Editor` or `Admin`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Grafana team id.
    #[serde(rename = "teamId", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    /// Grafana user id.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// Permission level: 1 (View), 2 (Edit) or 4 (Admin).
    pub permission: i64,
}

/// External access configuration for a Grafana instance.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct GrafanaIngress {
    /// Whether an Ingress object should exist for this instance. Disabling
    /// this removes a previously created Ingress.
    pub enabled: bool,
    /// The ingress hostname, required when `enabled` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// The HTTP path, defaults to `/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Persistent storage configuration for a Grafana instance.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct GrafanaDataStorage {
    /// Whether a PersistentVolumeClaim should exist for this instance.
    /// Disabling this removes a previously created claim.
    pub enabled: bool,
    /// Requested volume size, defaults to `1Gi`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Storage class name, defaults to the cluster default.
    #[serde(rename = "storageClass", skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Declarative specification of a managed Grafana instance.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "grafana.rustrial.org",
    version = "v1alpha1",
    kind = "Grafana",
    derive = "PartialEq",
    status = "GrafanaStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Phase",
        "type": "string",
        "jsonPath": ".status.phase",
        "description": "Last known reconciliation phase of this Grafana instance."
    }"#
)]
pub struct GrafanaSpec {
    /// Label selectors matching the `GrafanaDashboard` objects to import
    /// into this instance. A dashboard is imported if any selector matches.
    /// Without selectors no dashboards are imported.
    #[serde(rename = "dashboardLabelSelector", skip_serializing_if = "Option::is_none")]
    pub dashboard_label_selector: Option<Vec<LabelSelector>>,
    /// Label selector matching the namespaces dashboards may come from.
    /// Without it only dashboards from the instance's own namespace are
    /// considered.
    #[serde(rename = "dashboardNamespaceSelector", skip_serializing_if = "Option::is_none")]
    pub dashboard_namespace_selector: Option<LabelSelector>,
    /// Grafana configuration (`grafana.ini`) as section -> key -> value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, BTreeMap<String, String>>>,
    /// External access configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<GrafanaIngress>,
    /// Persistent storage configuration.
    #[serde(rename = "dataStorage", skip_serializing_if = "Option::is_none")]
    pub data_storage: Option<GrafanaDataStorage>,
    /// Grafana container image, defaults to the operator built-in.
    #[serde(rename = "baseImage", skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Admin user name, defaults to `admin`.
    #[serde(rename = "adminUser", skip_serializing_if = "Option::is_none")]
    pub admin_user: Option<String>,
    /// Admin password, generated and stored in the credentials Secret when
    /// not set.
    #[serde(rename = "adminPassword", skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    /// Timeout in seconds for calls against this instance's HTTP API.
    #[serde(rename = "apiTimeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub api_timeout_seconds: Option<u64>,
    /// Permissions applied to every folder the operator creates on this
    /// instance.
    #[serde(rename = "folderPermissions", skip_serializing_if = "Option::is_none")]
    pub folder_permissions: Option<Vec<FolderPermission>>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct GrafanaStatus {
    /// Last known reconciliation phase, one of `reconciling` or `failing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Human readable detail for the current phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// In-cluster URL of the instance's HTTP API once the instance is up.
    #[serde(rename = "adminUrl", skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    /// Plugins currently part of the install list of this instance.
    #[serde(rename = "installedPlugins", skip_serializing_if = "Option::is_none")]
    pub installed_plugins: Option<Vec<PluginRequirement>>,
    /// Plugins which failed to resolve on the plugin catalog and are not
    /// retried.
    #[serde(rename = "failedPlugins", skip_serializing_if = "Option::is_none")]
    pub failed_plugins: Option<Vec<PluginRequirement>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl Default for GrafanaStatus {
    fn default() -> Self {
        Self {
            phase: Default::default(),
            message: Default::default(),
            admin_url: Default::default(),
            installed_plugins: Default::default(),
            failed_plugins: Default::default(),
            conditions: Default::default(),
        }
    }
}

impl Grafana {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn update_condition(&mut self, c: Condition) {
        let mut status = self.status.take().unwrap_or_default();
        status.update_condition(c);
        self.status = Some(status);
    }

    pub fn update_phase(&mut self, phase: &str, message: String) {
        let mut status = self.status.take().unwrap_or_default();
        status.phase = Some(phase.to_string());
        status.message = Some(message);
        self.status = Some(status);
    }
}

impl GrafanaStatus {
    pub fn update_condition(&mut self, mut c: Condition) {
        let time = Utc::now();
        c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_else(|| vec![]);
        if let Some(existing) = conditions.iter().find(|v| v.type_ == c.type_) {
            if existing.status != c.status
                || existing.reason != c.reason
                || existing.message != c.message
                || existing.observed_generation != c.observed_generation
            {
                conditions.retain(|v| v.type_ != c.type_);
                conditions.push(c);
            }
        } else {
            conditions.push(c);
        };
        self.conditions = Some(conditions);
    }
}

/// Reference to a grafana.com dashboard by its numeric catalog id.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct GrafanaComSource {
    /// The dashboard id on grafana.com.
    pub id: i64,
    /// The revision to import. When not set the latest published revision
    /// is resolved from the catalog.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

/// Template evaluated into dashboard JSON with a set of named variables.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct TemplateSource {
    /// The template body. `import` paths are resolved against the
    /// operator's built-in template library.
    pub source: String,
    /// Variables available inside the template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<BTreeMap<String, String>>,
}

/// Mapping of a dashboard datasource input to a concrete datasource name.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct DashboardDatasource {
    /// Name of the input declared in the dashboard JSON, e.g. `DS_PROMETHEUS`.
    #[serde(rename = "inputName")]
    pub input_name: String,
    /// Name of the datasource to substitute.
    #[serde(rename = "datasourceName")]
    pub datasource_name: String,
}

/// Specification of a dashboard to import into matching Grafana instances.
///
/// Exactly one primary content source should be configured. `url` and
/// `grafanaCom` are mutually exclusive; the remaining sources act as
/// fallbacks in a fixed priority order (grafana.com, URL, ConfigMap,
/// inline JSON, template).
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "grafana.rustrial.org",
    version = "v1alpha1",
    kind = "GrafanaDashboard",
    derive = "PartialEq",
    status = "GrafanaDashboardStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Phase",
        "type": "string",
        "jsonPath": ".status.phase",
        "description": "Last known reconciliation phase of this dashboard."
    }"#,
    printcolumn = r#"{
        "name":"Hash",
        "type": "string",
        "jsonPath": ".status.hash",
        "description": "Content hash of the last successful import."
    }"#
)]
pub struct GrafanaDashboardSpec {
    /// Inline dashboard JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<String>,
    /// URL to fetch the dashboard JSON from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Name of a Secret (in the dashboard's namespace) with `username` and
    /// `password` keys used as HTTP Basic credentials for `url`.
    #[serde(rename = "urlBasicAuthSecret", skip_serializing_if = "Option::is_none")]
    pub url_basic_auth_secret: Option<String>,
    /// ConfigMap key holding the dashboard JSON.
    #[serde(rename = "configMapRef", skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ConfigMapKeySelector>,
    /// Dashboard published on grafana.com.
    #[serde(rename = "grafanaCom", skip_serializing_if = "Option::is_none")]
    pub grafana_com: Option<GrafanaComSource>,
    /// Template evaluated into dashboard JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateSource>,
    /// Plugins this dashboard requires on the target instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<PluginRequirement>>,
    /// Datasource input mappings applied on import.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasources: Option<Vec<DashboardDatasource>>,
    /// Folder title to place the dashboard in, defaults to a folder named
    /// after the dashboard's namespace.
    #[serde(rename = "customFolder", skip_serializing_if = "Option::is_none")]
    pub custom_folder: Option<String>,
    /// How long fetched content stays valid in seconds. Zero (the default)
    /// means the cache never expires and content is only re-fetched when
    /// the source changes.
    #[serde(rename = "contentCacheDuration", skip_serializing_if = "Option::is_none")]
    pub content_cache_duration: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct GrafanaDashboardStatus {
    /// Gzip compressed, base64 encoded copy of the last fetched content.
    #[serde(rename = "contentCache", skip_serializing_if = "Option::is_none")]
    pub content_cache: Option<String>,
    /// The URL `contentCache` was fetched from. The cache is only trusted
    /// while this matches the currently configured source URL.
    #[serde(rename = "contentUrl", skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    /// RFC3339 timestamp of the fetch that populated `contentCache`.
    #[serde(rename = "contentTimestamp", skip_serializing_if = "Option::is_none")]
    pub content_timestamp: Option<String>,
    /// Hash of the semantically relevant resolved fields, used to skip
    /// redundant imports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Last known reconciliation phase, one of `reconciling` or `failing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Human readable detail for the current phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for GrafanaDashboardStatus {
    fn default() -> Self {
        Self {
            content_cache: Default::default(),
            content_url: Default::default(),
            content_timestamp: Default::default(),
            hash: Default::default(),
            phase: Default::default(),
            message: Default::default(),
        }
    }
}

impl GrafanaDashboard {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn plugins(&self) -> &[PluginRequirement] {
        self.spec.plugins.as_deref().unwrap_or(&[])
    }

    pub fn datasources(&self) -> &[DashboardDatasource] {
        self.spec.datasources.as_deref().unwrap_or(&[])
    }

    /// Cache validity in seconds, `<= 0` means the cache never expires.
    pub fn content_cache_duration(&self) -> i64 {
        self.spec.content_cache_duration.unwrap_or(0)
    }

    /// The folder title this dashboard belongs to, defaults to the
    /// dashboard's namespace.
    pub fn folder_title(&self) -> String {
        self.spec
            .custom_folder
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| self.metadata.namespace.clone())
            .unwrap_or_else(|| "General".to_string())
    }

    pub fn update_phase(&mut self, phase: &str, message: String) {
        let mut status = self.status.take().unwrap_or_default();
        status.phase = Some(phase.to_string());
        status.message = Some(message);
        self.status = Some(status);
    }
}

/// Specification of a notification channel to import into matching Grafana
/// instances.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "grafana.rustrial.org",
    version = "v1alpha1",
    kind = "GrafanaNotificationChannel",
    derive = "PartialEq",
    status = "GrafanaNotificationChannelStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Phase",
        "type": "string",
        "jsonPath": ".status.phase",
        "description": "Last known reconciliation phase of this channel."
    }"#
)]
pub struct GrafanaNotificationChannelSpec {
    /// The channel body as accepted by the Grafana alert-notifications API.
    /// Must carry a stable `uid` field.
    pub json: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct GrafanaNotificationChannelStatus {
    /// Last known reconciliation phase, one of `reconciling` or `failing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Human readable detail for the current phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Hash of the last successfully imported channel body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Default for GrafanaNotificationChannelStatus {
    fn default() -> Self {
        Self {
            phase: Default::default(),
            message: Default::default(),
            hash: Default::default(),
        }
    }
}

impl GrafanaNotificationChannel {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    /// The channel `uid` declared in the inline JSON body.
    pub fn channel_uid(&self) -> Option<String> {
        serde_json::from_str::<serde_json::Value>(self.spec.json.as_str())
            .ok()
            .and_then(|v| v.get("uid").and_then(|u| u.as_str()).map(|u| u.to_string()))
    }

    pub fn update_phase(&mut self, phase: &str, message: String) {
        let mut status = self.status.take().unwrap_or_default();
        status.phase = Some(phase.to_string());
        status.message = Some(message);
        self.status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_dashboard_spec() {
        let p = GrafanaDashboardSpec {
            json: Some("{}".to_string()),
            url: None,
            url_basic_auth_secret: None,
            config_map_ref: None,
            grafana_com: None,
            template: None,
            plugins: None,
            datasources: None,
            custom_folder: None,
            content_cache_duration: None,
        };
        assert_eq!(r#"{"json":"{}"}"#, serde_json::to_string(&p).unwrap());
    }

    #[test]
    fn plugin_requirement_display() {
        let p = PluginRequirement {
            name: "grafana-piechart-panel".to_string(),
            version: "1.3.9".to_string(),
        };
        assert_eq!("grafana-piechart-panel 1.3.9", format!("{}", p));
    }

    #[test]
    fn folder_title_defaults_to_namespace() {
        let mut dashboard = GrafanaDashboard::new(
            "queue-depth",
            GrafanaDashboardSpec {
                json: Some("{}".to_string()),
                url: None,
                url_basic_auth_secret: None,
                config_map_ref: None,
                grafana_com: None,
                template: None,
                plugins: None,
                datasources: None,
                custom_folder: None,
                content_cache_duration: None,
            },
        );
        dashboard.metadata.namespace = Some("monitoring".to_string());
        assert_eq!("monitoring", dashboard.folder_title());
        dashboard.spec.custom_folder = Some("TEST".to_string());
        assert_eq!("TEST", dashboard.folder_title());
    }

    #[test]
    fn channel_uid_from_json() {
        let channel = GrafanaNotificationChannel::new(
            "oncall",
            GrafanaNotificationChannelSpec {
                json: r#"{"uid":"oncall","type":"slack","name":"oncall"}"#.to_string(),
            },
        );
        assert_eq!(Some("oncall".to_string()), channel.channel_uid());
        let broken = GrafanaNotificationChannel::new(
            "oncall",
            GrafanaNotificationChannelSpec {
                json: "not json".to_string(),
            },
        );
        assert_eq!(None, broken.channel_uid());
    }

    #[test]
    fn grafana_com_source_serialization() {
        let s = GrafanaComSource {
            id: 1860,
            revision: None,
        };
        assert_eq!(r#"{"id":1860}"#, serde_json::to_string(&s).unwrap());
    }
}
