//! Process-wide index of resources previously imported into each Grafana
//! instance.
//!
//! The registry lets reconcilers diff against the last known imported
//! state without re-listing the Grafana HTTP API on every pass. It is
//! constructor-injected into every controller and guarded by a single
//! mutex; all methods are short read/modify/write critical sections that
//! return copies. Callers must never perform network I/O while a registry
//! call is in flight.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use grafana_operator_apis::PluginRequirement;

/// Identity and hash record of a dashboard imported into one instance.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DashboardRef {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub hash: String,
    pub folder_id: Option<i64>,
    pub folder_name: Option<String>,
    /// Plugin requirements declared by this dashboard, the input to the
    /// per-instance consolidation.
    pub plugins: Vec<PluginRequirement>,
}

/// A folder known to exist on an instance, shared by the dashboards whose
/// refs point at its id.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct FolderRef {
    pub title: String,
    pub uid: String,
    pub id: i64,
    pub hash: String,
}

/// Identity and hash record of a notification channel imported into one
/// instance.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ChannelRef {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub hash: String,
}

#[derive(Default)]
struct InstanceState {
    /// Kubernetes UID of the Grafana object this state belongs to. A UID
    /// change means the instance was deleted and recreated, so all known
    /// state is suspect and gets dropped.
    grafana_uid: Option<String>,
    /// Dashboard id (`namespace/name`) to imported ref.
    dashboards: HashMap<String, DashboardRef>,
    /// Folder id to folder ref.
    folders: HashMap<i64, FolderRef>,
    /// Channel id (`namespace/name`) to imported ref.
    channels: HashMap<String, ChannelRef>,
    /// Plugin name to installed version, at most one version per name.
    installed_plugins: BTreeMap<String, String>,
    /// Exact (name, version) pairs which failed to resolve on the plugin
    /// catalog and must not be retried.
    failed_plugins: HashSet<(String, String)>,
}

pub(crate) struct Registry {
    instances: Mutex<HashMap<String, InstanceState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(Default::default()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, InstanceState>) -> R) -> R {
        let mut guard = self.instances.lock().expect("registry mutex poisoned");
        f(&mut guard)
    }

    /// Record the Kubernetes UID of an instance. Returns `true` if the
    /// instance was known under a different UID, in which case its whole
    /// state has been dropped and callers must treat every resource as not
    /// yet imported (force re-create).
    pub fn note_instance(&self, instance: &str, grafana_uid: &str) -> bool {
        self.with(|instances| {
            let state = instances.entry(instance.to_string()).or_default();
            match &state.grafana_uid {
                Some(known) if known == grafana_uid => false,
                Some(_) => {
                    *state = InstanceState {
                        grafana_uid: Some(grafana_uid.to_string()),
                        ..Default::default()
                    };
                    true
                }
                None => {
                    state.grafana_uid = Some(grafana_uid.to_string());
                    false
                }
            }
        })
    }

    /// Drop everything known about an instance, used when the Grafana
    /// object is deleted.
    pub fn forget_instance(&self, instance: &str) {
        self.with(|instances| {
            instances.remove(instance);
        })
    }

    pub fn dashboard(&self, instance: &str, id: &str) -> Option<DashboardRef> {
        self.with(|instances| {
            instances
                .get(instance)
                .and_then(|state| state.dashboards.get(id))
                .cloned()
        })
    }

    pub fn set_dashboard(&self, instance: &str, id: &str, dashboard: DashboardRef) {
        self.with(|instances| {
            instances
                .entry(instance.to_string())
                .or_default()
                .dashboards
                .insert(id.to_string(), dashboard);
        })
    }

    pub fn remove_dashboard(&self, instance: &str, id: &str) -> Option<DashboardRef> {
        self.with(|instances| {
            instances
                .get_mut(instance)
                .and_then(|state| state.dashboards.remove(id))
        })
    }

    /// All instances a dashboard is known to be imported into.
    pub fn instances_with_dashboard(&self, id: &str) -> Vec<(String, DashboardRef)> {
        self.with(|instances| {
            let mut found: Vec<(String, DashboardRef)> = instances
                .iter()
                .filter_map(|(key, state)| {
                    state.dashboards.get(id).map(|d| (key.clone(), d.clone()))
                })
                .collect();
            found.sort_by(|a, b| a.0.cmp(&b.0));
            found
        })
    }

    pub fn folder(&self, instance: &str, folder_id: i64) -> Option<FolderRef> {
        self.with(|instances| {
            instances
                .get(instance)
                .and_then(|state| state.folders.get(&folder_id))
                .cloned()
        })
    }

    pub fn set_folder(&self, instance: &str, folder: FolderRef) {
        self.with(|instances| {
            instances
                .entry(instance.to_string())
                .or_default()
                .folders
                .insert(folder.id, folder);
        })
    }

    pub fn remove_folder(&self, instance: &str, folder_id: i64) -> Option<FolderRef> {
        self.with(|instances| {
            instances
                .get_mut(instance)
                .and_then(|state| state.folders.remove(&folder_id))
        })
    }

    /// Whether any known dashboard still points at the given folder id.
    /// Deleting a folder is only safe once this returns `false`.
    pub fn folder_in_use(&self, instance: &str, folder_id: i64) -> bool {
        self.with(|instances| {
            instances.get(instance).map_or(false, |state| {
                state
                    .dashboards
                    .values()
                    .any(|d| d.folder_id == Some(folder_id))
            })
        })
    }

    pub fn channel(&self, instance: &str, id: &str) -> Option<ChannelRef> {
        self.with(|instances| {
            instances
                .get(instance)
                .and_then(|state| state.channels.get(id))
                .cloned()
        })
    }

    pub fn set_channel(&self, instance: &str, id: &str, channel: ChannelRef) {
        self.with(|instances| {
            instances
                .entry(instance.to_string())
                .or_default()
                .channels
                .insert(id.to_string(), channel);
        })
    }

    pub fn remove_channel(&self, instance: &str, id: &str) -> Option<ChannelRef> {
        self.with(|instances| {
            instances
                .get_mut(instance)
                .and_then(|state| state.channels.remove(id))
        })
    }

    /// All instances a channel is known to be imported into.
    pub fn instances_with_channel(&self, id: &str) -> Vec<(String, ChannelRef)> {
        self.with(|instances| {
            let mut found: Vec<(String, ChannelRef)> = instances
                .iter()
                .filter_map(|(key, state)| {
                    state.channels.get(id).map(|c| (key.clone(), c.clone()))
                })
                .collect();
            found.sort_by(|a, b| a.0.cmp(&b.0));
            found
        })
    }

    /// The flattened plugin requirements of every dashboard known to target
    /// an instance, ordered by dashboard id so consolidation input is
    /// deterministic across reconciles.
    pub fn requested_plugins(&self, instance: &str) -> Vec<PluginRequirement> {
        self.with(|instances| {
            let Some(state) = instances.get(instance) else {
                return vec![];
            };
            let mut ids: Vec<&String> = state.dashboards.keys().collect();
            ids.sort();
            ids.iter()
                .flat_map(|id| state.dashboards[*id].plugins.iter().cloned())
                .collect()
        })
    }

    pub fn installed_plugins(&self, instance: &str) -> BTreeMap<String, String> {
        self.with(|instances| {
            instances
                .get(instance)
                .map(|state| state.installed_plugins.clone())
                .unwrap_or_default()
        })
    }

    pub fn set_installed_plugins(&self, instance: &str, plugins: &[PluginRequirement]) {
        self.with(|instances| {
            let state = instances.entry(instance.to_string()).or_default();
            state.installed_plugins = plugins
                .iter()
                .map(|p| (p.name.clone(), p.version.clone()))
                .collect();
        })
    }

    pub fn failed_plugins(&self, instance: &str) -> HashSet<(String, String)> {
        self.with(|instances| {
            instances
                .get(instance)
                .map(|state| state.failed_plugins.clone())
                .unwrap_or_default()
        })
    }

    pub fn mark_plugin_failed(&self, instance: &str, plugin: &PluginRequirement) {
        self.with(|instances| {
            instances
                .entry(instance.to_string())
                .or_default()
                .failed_plugins
                .insert((plugin.name.clone(), plugin.version.clone()));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dashboard(id: &str, folder_id: Option<i64>, plugins: &[(&str, &str)]) -> DashboardRef {
        let (namespace, name) = id.split_once('/').unwrap();
        DashboardRef {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: format!("uid-{}", name),
            hash: "h".to_string(),
            folder_id,
            folder_name: folder_id.map(|_| "shared".to_string()),
            plugins: plugins
                .iter()
                .map(|(n, v)| PluginRequirement {
                    name: n.to_string(),
                    version: v.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn folder_is_deletable_once_last_reference_is_gone() {
        let registry = Registry::new();
        registry.set_dashboard("monitoring/main", "a/one", dashboard("a/one", Some(7), &[]));
        registry.set_dashboard("monitoring/main", "a/two", dashboard("a/two", Some(7), &[]));
        assert!(registry.folder_in_use("monitoring/main", 7));
        registry.remove_dashboard("monitoring/main", "a/one");
        assert!(registry.folder_in_use("monitoring/main", 7));
        registry.remove_dashboard("monitoring/main", "a/two");
        assert!(!registry.folder_in_use("monitoring/main", 7));
    }

    #[test]
    fn requested_plugins_are_deterministic() {
        let registry = Registry::new();
        registry.set_dashboard(
            "monitoring/main",
            "b/two",
            dashboard("b/two", None, &[("piechart", "1.2.0")]),
        );
        registry.set_dashboard(
            "monitoring/main",
            "a/one",
            dashboard("a/one", None, &[("clock", "2.0.0"), ("piechart", "1.0.0")]),
        );
        let requested: Vec<String> = registry
            .requested_plugins("monitoring/main")
            .iter()
            .map(|p| format!("{}", p))
            .collect();
        assert_eq!(
            vec!["clock 2.0.0", "piechart 1.0.0", "piechart 1.2.0"],
            requested
        );
    }

    #[test]
    fn instance_uid_change_drops_known_state() {
        let registry = Registry::new();
        assert!(!registry.note_instance("monitoring/main", "uid-1"));
        registry.set_dashboard("monitoring/main", "a/one", dashboard("a/one", None, &[]));
        assert!(!registry.note_instance("monitoring/main", "uid-1"));
        assert!(registry.dashboard("monitoring/main", "a/one").is_some());
        // Instance disappeared and came back under a new UID.
        assert!(registry.note_instance("monitoring/main", "uid-2"));
        assert!(registry.dashboard("monitoring/main", "a/one").is_none());
    }

    #[test]
    fn lookups_return_copies() {
        let registry = Registry::new();
        registry.set_dashboard("monitoring/main", "a/one", dashboard("a/one", None, &[]));
        let mut copy = registry.dashboard("monitoring/main", "a/one").unwrap();
        copy.hash = "mutated".to_string();
        assert_eq!(
            "h",
            registry.dashboard("monitoring/main", "a/one").unwrap().hash
        );
    }

    #[test]
    fn instances_with_dashboard_spans_instances() {
        let registry = Registry::new();
        registry.set_dashboard("ns/a", "a/one", dashboard("a/one", None, &[]));
        registry.set_dashboard("ns/b", "a/one", dashboard("a/one", None, &[]));
        let found = registry.instances_with_dashboard("a/one");
        assert_eq!(2, found.len());
        assert_eq!("ns/a", found[0].0);
        assert_eq!("ns/b", found[1].0);
    }
}
