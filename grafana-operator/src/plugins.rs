//! Consolidation of per-dashboard plugin requirements into one
//! conflict-free install list per Grafana instance.
//!
//! The install list is materialized as the `GF_INSTALL_PLUGINS` environment
//! variable on the instance's Deployment, so a plugin missing from the
//! output implicitly gets uninstalled on the next rollout. The engine is a
//! pure in-memory computation; probing the plugin catalog for existence
//! happens in the instance controller before the list is committed.

use std::collections::{BTreeMap, HashSet};

use grafana_operator_apis::PluginRequirement;
use semver::Version;

pub(crate) struct Consolidation {
    /// Install list, at most one entry per plugin name.
    pub plugins: Vec<PluginRequirement>,
    /// Whether the install list differs from what is currently installed.
    pub changed: bool,
}

struct Candidate {
    requirement: PluginRequirement,
    /// Distinct versions requested for this name across the whole input.
    distinct_versions: usize,
}

/// Pick one candidate per plugin name, in first-encounter order. When all
/// requested versions of a name parse as semver the highest one wins,
/// otherwise the first requested version is kept.
fn candidates(requested: &[PluginRequirement]) -> Vec<Candidate> {
    let mut order: Vec<&str> = Vec::new();
    let mut versions: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for requirement in requested {
        let entry = versions.entry(requirement.name.as_str()).or_default();
        if entry.is_empty() {
            order.push(requirement.name.as_str());
        }
        if !entry.contains(&requirement.version.as_str()) {
            entry.push(requirement.version.as_str());
        }
    }
    order
        .into_iter()
        .map(|name| {
            let distinct = &versions[name];
            let parsed: Option<Vec<Version>> =
                distinct.iter().map(|v| Version::parse(v).ok()).collect();
            let version = match parsed {
                Some(semvers) => {
                    let highest = semvers.iter().max().cloned();
                    distinct
                        .iter()
                        .zip(semvers.iter())
                        .find(|(_, parsed)| highest.as_ref() == Some(*parsed))
                        .map(|(raw, _)| *raw)
                        .unwrap_or(distinct[0])
                }
                // Not comparable, first requested wins.
                None => distinct[0],
            };
            Candidate {
                requirement: PluginRequirement {
                    name: name.to_string(),
                    version: version.to_string(),
                },
                distinct_versions: distinct.len(),
            }
        })
        .collect()
}

/// Merge the flattened requirements of every dashboard targeting one
/// instance against what is already installed there.
pub(crate) fn consolidate(
    requested: &[PluginRequirement],
    installed: &BTreeMap<String, String>,
    failed: &HashSet<(String, String)>,
) -> Consolidation {
    let candidates = candidates(requested);
    if candidates.is_empty() && !installed.is_empty() {
        // Nothing requested anymore, drop the whole install list.
        return Consolidation {
            plugins: vec![],
            changed: true,
        };
    }
    let mut plugins: Vec<PluginRequirement> = Vec::new();
    let mut changed = false;
    for candidate in candidates {
        let requirement = candidate.requirement;
        if plugins.iter().any(|p| p.name == requirement.name) {
            // One version per plugin name per instance.
            continue;
        }
        if failed.contains(&(requirement.name.clone(), requirement.version.clone())) {
            debug!(
                "skipping plugin {} as this exact version previously failed to resolve",
                requirement
            );
            continue;
        }
        match installed.get(requirement.name.as_str()) {
            Some(version) if version == &requirement.version => {
                plugins.push(requirement);
            }
            Some(version) => {
                if candidate.distinct_versions == 1 {
                    changed = true;
                    plugins.push(requirement);
                } else {
                    // Competing versions requested while another one is
                    // installed: leave the installed version alone to avoid
                    // oscillating between requesters.
                    plugins.push(PluginRequirement {
                        name: requirement.name,
                        version: version.clone(),
                    });
                }
            }
            None => {
                if candidate.distinct_versions == 1 {
                    changed = true;
                    plugins.push(requirement);
                }
                // Otherwise the request set is ambiguous and nothing is
                // installed yet, so install none of the versions.
            }
        }
    }
    // A plugin installed but no longer present in the output gets
    // uninstalled by the regenerated install list.
    for name in installed.keys() {
        if !plugins.iter().any(|p| &p.name == name) {
            changed = true;
        }
    }
    Consolidation { plugins, changed }
}

/// Render the consolidated list into the value of `GF_INSTALL_PLUGINS`.
pub(crate) fn install_list(plugins: &[PluginRequirement]) -> String {
    plugins
        .iter()
        .map(|p| format!("{}", p))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(name: &str, version: &str) -> PluginRequirement {
        PluginRequirement {
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    fn installed(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn output_never_contains_duplicate_names() {
        let requested = vec![
            plugin("clock", "1.0.0"),
            plugin("clock", "1.0.0"),
            plugin("piechart", "2.0.0"),
        ];
        let outcome = consolidate(&requested, &installed(&[]), &Default::default());
        let names: Vec<&str> = outcome.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(vec!["clock", "piechart"], names);
    }

    #[test]
    fn competing_versions_of_a_new_plugin_install_nothing() {
        let requested = vec![plugin("clock", "1.0.0"), plugin("clock", "2.0.0")];
        let outcome = consolidate(&requested, &installed(&[]), &Default::default());
        assert!(outcome.plugins.is_empty());
        assert!(!outcome.changed);
    }

    #[test]
    fn exact_version_already_installed_is_a_noop() {
        let requested = vec![plugin("clock", "1.0.0")];
        let outcome = consolidate(
            &requested,
            &installed(&[("clock", "1.0.0")]),
            &Default::default(),
        );
        assert_eq!(vec![plugin("clock", "1.0.0")], outcome.plugins);
        assert!(!outcome.changed);
    }

    #[test]
    fn new_single_version_plugin_is_added() {
        let requested = vec![plugin("clock", "1.0.0")];
        let outcome = consolidate(&requested, &installed(&[]), &Default::default());
        assert_eq!(vec![plugin("clock", "1.0.0")], outcome.plugins);
        assert!(outcome.changed);
    }

    #[test]
    fn unambiguous_upgrade_is_allowed() {
        let requested = vec![plugin("clock", "2.0.0")];
        let outcome = consolidate(
            &requested,
            &installed(&[("clock", "1.0.0")]),
            &Default::default(),
        );
        assert_eq!(vec![plugin("clock", "2.0.0")], outcome.plugins);
        assert!(outcome.changed);
    }

    #[test]
    fn competing_versions_keep_the_installed_one() {
        let requested = vec![plugin("clock", "2.0.0"), plugin("clock", "3.0.0")];
        let outcome = consolidate(
            &requested,
            &installed(&[("clock", "1.0.0")]),
            &Default::default(),
        );
        assert_eq!(vec![plugin("clock", "1.0.0")], outcome.plugins);
        assert!(!outcome.changed);
    }

    #[test]
    fn highest_semver_wins_within_one_name() {
        let requested = vec![
            plugin("clock", "1.2.0"),
            plugin("clock", "1.10.0"),
            plugin("clock", "1.3.0"),
        ];
        let selected = candidates(&requested);
        assert_eq!("1.10.0", selected[0].requirement.version);
        assert_eq!(3, selected[0].distinct_versions);
    }

    #[test]
    fn non_semver_versions_fall_back_to_first_requested() {
        let requested = vec![plugin("clock", "v1.0"), plugin("clock", "v2.0")];
        let selected = candidates(&requested);
        assert_eq!("v1.0", selected[0].requirement.version);
    }

    #[test]
    fn empty_request_set_removes_installed_plugins() {
        let outcome = consolidate(&[], &installed(&[("clock", "1.0.0")]), &Default::default());
        assert!(outcome.plugins.is_empty());
        assert!(outcome.changed);
    }

    #[test]
    fn failed_pairs_are_never_retried() {
        let mut failed = HashSet::new();
        failed.insert(("clock".to_string(), "1.0.0".to_string()));
        let requested = vec![plugin("clock", "1.0.0"), plugin("piechart", "2.0.0")];
        let outcome = consolidate(&requested, &installed(&[]), &failed);
        assert_eq!(vec![plugin("piechart", "2.0.0")], outcome.plugins);
        assert!(outcome.changed);
    }

    #[test]
    fn unrequested_installed_plugin_marks_change() {
        let requested = vec![plugin("clock", "1.0.0")];
        let outcome = consolidate(
            &requested,
            &installed(&[("clock", "1.0.0"), ("piechart", "2.0.0")]),
            &Default::default(),
        );
        assert_eq!(vec![plugin("clock", "1.0.0")], outcome.plugins);
        assert!(outcome.changed);
    }

    #[test]
    fn install_list_rendering() {
        let plugins = vec![plugin("clock", "1.0.0"), plugin("piechart", "2.0.0")];
        assert_eq!("clock 1.0.0,piechart 2.0.0", install_list(&plugins));
    }
}
