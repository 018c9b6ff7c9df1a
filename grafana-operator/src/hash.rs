//! Deterministic fingerprints over the semantically relevant fields of
//! imported resources.
//!
//! The field order fed into the hasher is part of the persisted contract:
//! hashes are stored in resource status fields and in the registry, and a
//! reordering would re-import every dashboard in the fleet. Transient
//! fields (fetch timestamps, cache blobs) must never be hashed.

use grafana_operator_apis::{DashboardDatasource, FolderPermission};
use sha2::{Digest, Sha256};

/// Grafana rejects UIDs longer than 40 characters.
const MAX_UID_LENGTH: usize = 40;

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash of a resolved dashboard: content bytes, then each datasource
/// mapping (input name, datasource name), then the custom folder title.
pub(crate) fn dashboard_hash(
    content: &[u8],
    datasources: &[DashboardDatasource],
    custom_folder: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    for ds in datasources {
        hasher.update(ds.input_name.as_bytes());
        hasher.update(ds.datasource_name.as_bytes());
    }
    if let Some(folder) = custom_folder {
        hasher.update(folder.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hash of a folder: name, namespace, then each permission's target
/// (role, team id, user id) and level in list order.
pub(crate) fn folder_hash(
    name: &str,
    namespace: &str,
    permissions: &[FolderPermission],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(namespace.as_bytes());
    for p in permissions {
        if let Some(role) = &p.role {
            hasher.update(role.as_bytes());
        }
        if let Some(team_id) = p.team_id {
            hasher.update(team_id.to_string().as_bytes());
        }
        if let Some(user_id) = p.user_id {
            hasher.update(user_id.to_string().as_bytes());
        }
        hasher.update(p.permission.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hash of a notification channel: body, name, namespace.
pub(crate) fn channel_hash(json: &str, name: &str, namespace: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(namespace.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive a stable Grafana UID from a seed string (folder title, dashboard
/// identity). Truncated to the API's UID length limit.
pub(crate) fn stable_uid(seed: &str) -> String {
    let mut uid = sha256_hex(seed.as_bytes());
    uid.truncate(MAX_UID_LENGTH);
    uid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str, permission: i64) -> FolderPermission {
        FolderPermission {
            role: Some(name.to_string()),
            team_id: None,
            user_id: None,
            permission,
        }
    }

    // The literal digests below pin the hashing order (name, namespace,
    // then each permission's target/type/level in list order). A failure
    // here means every persisted hash in the fleet would be invalidated.
    #[test]
    fn folder_hash_is_reproducible() {
        let permissions = vec![role("Viewer", 1), role("Editor", 2)];
        assert_eq!(
            "0931271c738bd74a3ba1f58039dd5194087c2d225ef25a5d88a23f11a837d99f",
            folder_hash("TEST", "grafana", &permissions)
        );
    }

    #[test]
    fn folder_hash_depends_on_permission_order() {
        let forward = vec![role("Viewer", 1), role("Editor", 2)];
        let reversed = vec![role("Editor", 2), role("Viewer", 1)];
        assert_ne!(
            folder_hash("TEST", "grafana", &forward),
            folder_hash("TEST", "grafana", &reversed)
        );
    }

    #[test]
    fn dashboard_hash_is_reproducible() {
        let datasources = vec![DashboardDatasource {
            input_name: "DS_PROMETHEUS".to_string(),
            datasource_name: "Prometheus".to_string(),
        }];
        assert_eq!(
            "7cfcc9175edc028aa4f5d7a3028769e943d446e9f5d624c43f0c2a3da20feb6c",
            dashboard_hash(br#"{"title":"demo"}"#, &datasources, Some("TEST"))
        );
        assert_eq!(
            "26c7756637ac2222042162a72754f2244cc214afa608b3816a2c0b0b10d8e2c2",
            dashboard_hash(br#"{"title":"demo"}"#, &[], None)
        );
    }

    #[test]
    fn channel_hash_is_reproducible() {
        assert_eq!(
            "1bab69a1f1b8f05b1b64c4912a5e045f0c347bbf58fd75e1a5a9334594b8f863",
            channel_hash(r#"{"uid":"oncall","type":"slack"}"#, "oncall", "monitoring")
        );
    }

    #[test]
    fn stable_uid_respects_length_limit() {
        let uid = stable_uid("TEST");
        assert_eq!("94ee059335e587e501cc4bf90613e0814f00a7b0", uid);
        assert_eq!(40, uid.len());
        assert_eq!(uid, stable_uid("TEST"));
    }
}
