//! Thin clients for the Grafana admin HTTP API and for the grafana.com
//! catalog (dashboard revisions and plugin existence).
//!
//! All requests carry HTTP Basic admin credentials and a caller-supplied
//! timeout. A 503 maps to [`ControllerError::TemporarilyUnavailable`] so
//! idempotent existence checks requeue instead of failing hard.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::{errors::ControllerError, resources};
use grafana_operator_apis::{FolderPermission, Grafana};

/// Default base URL of the grafana.com catalog, overridable via the
/// `GRAFANA_COM_API_URL` environment variable.
pub(crate) const DEFAULT_CATALOG_URL: &'static str = "https://grafana.com/api/";

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(path.as_str());
    }
    base
}

pub(crate) struct GrafanaClient {
    base: Url,
    http: reqwest::Client,
    user: String,
    password: String,
    timeout: Duration,
}

/// Folder as returned by the Grafana folders API.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Folder {
    pub id: i64,
    pub uid: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct DashboardImportResponse {
    uid: Option<String>,
}

impl GrafanaClient {
    pub fn new(
        http: reqwest::Client,
        base: Url,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            base: with_trailing_slash(base),
            http,
            user: user.to_string(),
            password: password.to_string(),
            timeout,
        }
    }

    /// Build a client for one managed instance from its published admin
    /// URL and its credentials Secret. Fails with a temporary error while
    /// the instance has not published either yet.
    pub async fn for_instance(
        client: &kube::Client,
        http: &reqwest::Client,
        grafana: &Grafana,
        default_timeout: Duration,
    ) -> Result<Self, ControllerError> {
        let admin_url = grafana
            .status
            .as_ref()
            .and_then(|s| s.admin_url.clone())
            .ok_or_else(|| {
                ControllerError::TemporarilyUnavailable(format!(
                    "Grafana instance {} has not published its admin URL yet",
                    grafana.id()
                ))
            })?;
        let base = Url::parse(admin_url.as_str()).map_err(|e| {
            ControllerError::Validation(format!("invalid admin URL {}: {}", admin_url, e))
        })?;
        let namespace = grafana.metadata.namespace.clone().unwrap_or_default();
        let name = grafana.metadata.name.clone().unwrap_or_default();
        let api: kube::Api<k8s_openapi::api::core::v1::Secret> =
            kube::Api::namespaced(client.clone(), namespace.as_str());
        let secret = api
            .get(resources::admin_secret_name(name.as_str()).as_str())
            .await?;
        let field = |key: &str| -> Result<String, ControllerError> {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).to_string())
                .ok_or_else(|| {
                    ControllerError::TemporarilyUnavailable(format!(
                        "admin credentials of {} are not ready",
                        grafana.id()
                    ))
                })
        };
        let timeout = grafana
            .spec
            .api_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Ok(GrafanaClient::new(
            http.clone(),
            base,
            field("username")?.as_str(),
            field("password")?.as_str(),
            timeout,
        ))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ControllerError> {
        let url = self.base.join(path).map_err(|e| {
            ControllerError::Validation(format!("invalid Grafana API path {}: {}", path, e))
        })?;
        Ok(self
            .http
            .request(method, url)
            .basic_auth(self.user.as_str(), Some(self.password.as_str()))
            .timeout(self.timeout))
    }

    async fn error_for(&self, response: Response) -> ControllerError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            ControllerError::TemporarilyUnavailable(format!(
                "Grafana API temporarily unavailable: {}",
                message
            ))
        } else {
            ControllerError::GrafanaApi {
                status: status.as_u16(),
                message,
            }
        }
    }

    /// Create or update a dashboard, keyed by the UID inside the body.
    /// Returns the UID assigned by Grafana.
    pub async fn import_dashboard(&self, body: &Value) -> Result<Option<String>, ControllerError> {
        let response = self
            .request(Method::POST, "api/dashboards/db")?
            .json(body)
            .send()
            .await?;
        if response.status().is_success() {
            let imported: DashboardImportResponse = response.json().await?;
            Ok(imported.uid)
        } else {
            Err(self.error_for(response).await)
        }
    }

    /// Idempotent delete: a dashboard that is already gone is a success.
    pub async fn delete_dashboard(&self, uid: &str) -> Result<(), ControllerError> {
        let path = format!("api/dashboards/uid/{}", uid);
        let response = self.request(Method::DELETE, path.as_str())?.send().await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }

    pub async fn get_folder(&self, uid: &str) -> Result<Option<Folder>, ControllerError> {
        let path = format!("api/folders/{}", uid);
        let response = self.request(Method::GET, path.as_str())?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(self.error_for(response).await)
        }
    }

    /// Find or create a folder with a deterministic UID derived from its
    /// title. Concurrent creation attempts resolve via a second lookup.
    pub async fn ensure_folder(&self, title: &str, uid: &str) -> Result<Folder, ControllerError> {
        if let Some(folder) = self.get_folder(uid).await? {
            return Ok(folder);
        }
        let body = json!({ "uid": uid, "title": title });
        let response = self
            .request(Method::POST, "api/folders")?
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            self.get_folder(uid).await?.ok_or_else(|| {
                ControllerError::TemporarilyUnavailable(format!(
                    "folder {} reported as existing but not found",
                    title
                ))
            })
        } else {
            Err(self.error_for(response).await)
        }
    }

    /// Idempotent delete: a folder that is already gone is a success.
    pub async fn delete_folder(&self, uid: &str) -> Result<(), ControllerError> {
        let path = format!("api/folders/{}", uid);
        let response = self.request(Method::DELETE, path.as_str())?.send().await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }

    pub async fn set_folder_permissions(
        &self,
        uid: &str,
        permissions: &[FolderPermission],
    ) -> Result<(), ControllerError> {
        let path = format!("api/folders/{}/permissions", uid);
        let body = json!({ "items": permissions });
        let response = self
            .request(Method::POST, path.as_str())?
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }

    pub async fn get_notification_channel(
        &self,
        uid: &str,
    ) -> Result<Option<Value>, ControllerError> {
        let path = format!("api/alert-notifications/uid/{}", uid);
        let response = self.request(Method::GET, path.as_str())?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(self.error_for(response).await)
        }
    }

    pub async fn create_notification_channel(&self, body: &Value) -> Result<(), ControllerError> {
        let response = self
            .request(Method::POST, "api/alert-notifications")?
            .json(body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }

    pub async fn update_notification_channel(
        &self,
        uid: &str,
        body: &Value,
    ) -> Result<(), ControllerError> {
        let path = format!("api/alert-notifications/uid/{}", uid);
        let response = self
            .request(Method::PUT, path.as_str())?
            .json(body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }

    /// Idempotent delete: a channel that is already gone is a success.
    pub async fn delete_notification_channel(&self, uid: &str) -> Result<(), ControllerError> {
        let path = format!("api/alert-notifications/uid/{}", uid);
        let response = self.request(Method::DELETE, path.as_str())?.send().await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }
}

/// Revision listing of a dashboard published on grafana.com.
#[derive(Debug, Deserialize)]
pub(crate) struct RevisionListing {
    pub items: Vec<RevisionItem>,
    #[serde(rename = "orderBy")]
    pub order_by: Option<String>,
    pub direction: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevisionItem {
    pub revision: i64,
}

/// The latest revision in a listing. An explicitly declared sort order is
/// honoured; anything else falls back to scanning for the true maximum so
/// a changed API default ordering cannot select a stale revision.
pub(crate) fn pick_latest_revision(listing: &RevisionListing) -> Option<i64> {
    match (listing.order_by.as_deref(), listing.direction.as_deref()) {
        (Some("revision"), Some("asc")) => listing.items.last().map(|i| i.revision),
        (Some("revision"), Some("desc")) => listing.items.first().map(|i| i.revision),
        _ => listing.items.iter().map(|i| i.revision).max(),
    }
}

pub(crate) struct CatalogClient {
    base: Url,
    http: reqwest::Client,
    timeout: Duration,
}

impl CatalogClient {
    pub fn new(http: reqwest::Client, base: Url, timeout: Duration) -> Self {
        Self {
            base: with_trailing_slash(base),
            http,
            timeout,
        }
    }

    fn join(&self, path: &str) -> Result<Url, ControllerError> {
        self.base.join(path).map_err(|e| {
            ControllerError::Validation(format!("invalid catalog path {}: {}", path, e))
        })
    }

    /// Download URL of a specific dashboard revision.
    pub fn download_url(&self, id: i64, revision: i64) -> Result<Url, ControllerError> {
        self.join(format!("dashboards/{}/revisions/{}/download", id, revision).as_str())
    }

    pub async fn list_revisions(&self, id: i64) -> Result<RevisionListing, ControllerError> {
        let url = self.join(format!("dashboards/{}/revisions", id).as_str())?;
        let response = self.http.get(url).timeout(self.timeout).send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(ControllerError::GrafanaApi {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    pub async fn latest_revision(&self, id: i64) -> Result<i64, ControllerError> {
        let listing = self.list_revisions(id).await?;
        pick_latest_revision(&listing).ok_or_else(|| {
            ControllerError::ContentResolution(format!(
                "dashboard {} has no published revisions",
                id
            ))
        })
    }

    /// Existence probe used before a plugin is accepted into an install
    /// list. `Ok(false)` means the catalog proved the plugin absent.
    pub async fn plugin_exists(&self, name: &str) -> Result<bool, ControllerError> {
        let url = self.join(format!("plugins/{}", name).as_str())?;
        let response = self.http.get(url).timeout(self.timeout).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(false)
        } else if response.status().is_success() {
            Ok(true)
        } else if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            Err(ControllerError::TemporarilyUnavailable(format!(
                "plugin catalog temporarily unavailable while probing {}",
                name
            )))
        } else {
            Err(ControllerError::GrafanaApi {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(revisions: &[i64], order_by: Option<&str>, direction: Option<&str>) -> RevisionListing {
        RevisionListing {
            items: revisions.iter().map(|r| RevisionItem { revision: *r }).collect(),
            order_by: order_by.map(|v| v.to_string()),
            direction: direction.map(|v| v.to_string()),
        }
    }

    #[test]
    fn latest_revision_with_declared_ascending_order() {
        let l = listing(&[1, 2, 3], Some("revision"), Some("asc"));
        assert_eq!(Some(3), pick_latest_revision(&l));
    }

    #[test]
    fn latest_revision_with_declared_descending_order() {
        let l = listing(&[3, 2, 1], Some("revision"), Some("desc"));
        assert_eq!(Some(3), pick_latest_revision(&l));
    }

    #[test]
    fn latest_revision_scans_when_order_is_unknown() {
        // A listing that is not actually sorted must still yield the true
        // maximum.
        let l = listing(&[2, 7, 1], None, None);
        assert_eq!(Some(7), pick_latest_revision(&l));
        let l = listing(&[2, 7, 1], Some("updated"), Some("asc"));
        assert_eq!(Some(7), pick_latest_revision(&l));
    }

    #[test]
    fn empty_listing_has_no_latest_revision() {
        let l = listing(&[], Some("revision"), Some("asc"));
        assert_eq!(None, pick_latest_revision(&l));
    }

    #[test]
    fn revision_listing_deserializes() {
        let l: RevisionListing = serde_json::from_str(
            r#"{"items":[{"revision":1},{"revision":2}],"orderBy":"revision","direction":"asc"}"#,
        )
        .unwrap();
        assert_eq!(Some(2), pick_latest_revision(&l));
    }

    #[test]
    fn base_urls_are_normalized() {
        let c = CatalogClient::new(
            reqwest::Client::new(),
            Url::parse("https://grafana.example.com/api").unwrap(),
            Duration::from_secs(5),
        );
        assert_eq!(
            "https://grafana.example.com/api/dashboards/1860/revisions/7/download",
            c.download_url(1860, 7).unwrap().as_str()
        );
    }
}
