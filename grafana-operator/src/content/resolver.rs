//! Ordered, fallback-chained fetch pipeline turning a dashboard's declared
//! source into raw content bytes.
//!
//! Priority order: grafana.com catalog reference, direct URL, ConfigMap
//! key, inline JSON, template. Every miss is logged and falls through to
//! the next configured source; only when all configured sources are
//! exhausted does the resolve fail. The content cache is consulted before
//! any network fetch and a hit short-circuits the whole chain.

use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    chrono::{DateTime, Utc},
};
use kube::{Api, Client};

use crate::{
    content::{cache, template::TemplateEvaluator},
    errors::ControllerError,
    grafana_api::CatalogClient,
};
use grafana_operator_apis::{GrafanaComSource, GrafanaDashboard, GrafanaDashboardSpec};

pub(crate) struct ResolvedContent {
    pub content: Vec<u8>,
    /// Normalized source URL for network sources. The caller persists it
    /// into status together with the cache blob so an unchanged spec is a
    /// guaranteed cache hit on the next reconcile.
    pub source_url: Option<String>,
    pub from_cache: bool,
}

pub(crate) struct ContentResolver {
    client: Client,
    http: reqwest::Client,
    catalog: CatalogClient,
    templates: TemplateEvaluator,
    timeout: Duration,
}

/// Reject specs declaring mutually exclusive sources or no source at all.
/// This is a resolve-time validation error, not a fallback.
pub(crate) fn validate_sources(spec: &GrafanaDashboardSpec) -> Result<(), ControllerError> {
    if spec.url.is_some() && spec.grafana_com.is_some() {
        return Err(ControllerError::Validation(
            "spec.url and spec.grafanaCom are mutually exclusive".to_string(),
        ));
    }
    if spec.json.is_none()
        && spec.url.is_none()
        && spec.config_map_ref.is_none()
        && spec.grafana_com.is_none()
        && spec.template.is_none()
    {
        return Err(ControllerError::Validation(
            "no content source configured".to_string(),
        ));
    }
    Ok(())
}

impl ContentResolver {
    pub fn new(
        client: Client,
        http: reqwest::Client,
        catalog: CatalogClient,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            http,
            catalog,
            templates: TemplateEvaluator::new(),
            timeout,
        }
    }

    pub async fn resolve(
        &self,
        dashboard: &GrafanaDashboard,
        now: DateTime<Utc>,
    ) -> Result<ResolvedContent, ControllerError> {
        validate_sources(&dashboard.spec)?;
        let mut misses: Vec<String> = Vec::new();
        if let Some(source) = &dashboard.spec.grafana_com {
            match self.resolve_grafana_com(dashboard, source, now).await {
                Ok(resolved) => return Ok(resolved),
                Err(e) => {
                    warn!(
                        "failed to fetch {} from the grafana.com catalog: {}",
                        dashboard.id(),
                        e
                    );
                    misses.push(format!("grafana.com: {}", e));
                }
            }
        }
        if let Some(url) = &dashboard.spec.url {
            match self.resolve_url(dashboard, url.as_str(), now).await {
                Ok(resolved) => return Ok(resolved),
                Err(e) => {
                    warn!("failed to fetch {} from {}: {}", dashboard.id(), url, e);
                    misses.push(format!("url: {}", e));
                }
            }
        }
        if let Some(reference) = &dashboard.spec.config_map_ref {
            match self.resolve_config_map(dashboard, reference).await {
                Ok(resolved) => return Ok(resolved),
                Err(e) => {
                    warn!(
                        "failed to read {} from ConfigMap {}: {}",
                        dashboard.id(),
                        reference.name,
                        e
                    );
                    misses.push(format!("configMap: {}", e));
                }
            }
        }
        if let Some(json) = &dashboard.spec.json {
            return Ok(ResolvedContent {
                content: json.clone().into_bytes(),
                source_url: None,
                from_cache: false,
            });
        }
        if let Some(template) = &dashboard.spec.template {
            let mut vars: BTreeMap<String, String> = BTreeMap::new();
            vars.insert("name".to_string(), dashboard.metadata.name.clone().unwrap_or_default());
            vars.insert(
                "namespace".to_string(),
                dashboard.metadata.namespace.clone().unwrap_or_default(),
            );
            if let Some(declared) = &template.vars {
                vars.extend(declared.clone());
            }
            match self.templates.render(template.source.as_str(), &vars) {
                Ok(rendered) => {
                    return Ok(ResolvedContent {
                        content: rendered.into_bytes(),
                        source_url: None,
                        from_cache: false,
                    });
                }
                Err(e) => {
                    warn!("failed to render template for {}: {}", dashboard.id(), e);
                    misses.push(format!("template: {}", e));
                }
            }
        }
        Err(ControllerError::ContentResolution(format!(
            "all content sources of {} failed: {}",
            dashboard.id(),
            misses.join("; ")
        )))
    }

    async fn resolve_grafana_com(
        &self,
        dashboard: &GrafanaDashboard,
        source: &GrafanaComSource,
        now: DateTime<Utc>,
    ) -> Result<ResolvedContent, ControllerError> {
        let revision = match source.revision {
            Some(revision) => revision,
            // Resolving "latest" requires a catalog round-trip even on a
            // cache hit, as the download URL is not known beforehand.
            None => self.catalog.latest_revision(source.id).await?,
        };
        let url = self.catalog.download_url(source.id, revision)?;
        self.fetch_with_cache(dashboard, url.as_str(), None, now)
            .await
    }

    async fn resolve_url(
        &self,
        dashboard: &GrafanaDashboard,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolvedContent, ControllerError> {
        let credentials = match &dashboard.spec.url_basic_auth_secret {
            Some(name) => Some(self.basic_auth_credentials(dashboard, name.as_str()).await?),
            None => None,
        };
        self.fetch_with_cache(dashboard, url, credentials, now).await
    }

    async fn fetch_with_cache(
        &self,
        dashboard: &GrafanaDashboard,
        url: &str,
        credentials: Option<(String, String)>,
        now: DateTime<Utc>,
    ) -> Result<ResolvedContent, ControllerError> {
        if let Some(content) = cache::get(dashboard, url, now) {
            debug!("content cache hit for {} ({})", dashboard.id(), url);
            return Ok(ResolvedContent {
                content,
                source_url: Some(url.to_string()),
                from_cache: true,
            });
        }
        let mut request = self.http.get(url).timeout(self.timeout);
        if let Some((user, password)) = &credentials {
            request = request.basic_auth(user.as_str(), Some(password.as_str()));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ControllerError::ContentResolution(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        let content = response.bytes().await?.to_vec();
        Ok(ResolvedContent {
            content,
            source_url: Some(url.to_string()),
            from_cache: false,
        })
    }

    async fn resolve_config_map(
        &self,
        dashboard: &GrafanaDashboard,
        reference: &k8s_openapi::api::core::v1::ConfigMapKeySelector,
    ) -> Result<ResolvedContent, ControllerError> {
        let namespace = dashboard.metadata.namespace.clone().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace.as_str());
        let config_map = api.get(reference.name.as_str()).await?;
        let content = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(reference.key.as_str()))
            .ok_or_else(|| {
                ControllerError::ContentResolution(format!(
                    "ConfigMap {}/{} has no key {}",
                    namespace, reference.name, reference.key
                ))
            })?;
        Ok(ResolvedContent {
            content: content.clone().into_bytes(),
            source_url: None,
            from_cache: false,
        })
    }

    async fn basic_auth_credentials(
        &self,
        dashboard: &GrafanaDashboard,
        secret_name: &str,
    ) -> Result<(String, String), ControllerError> {
        let namespace = dashboard.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace.as_str());
        let secret = api.get(secret_name).await?;
        let field = |key: &str| -> Result<String, ControllerError> {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).to_string())
                .ok_or_else(|| {
                    ControllerError::Validation(format!(
                        "Secret {}/{} has no key {}",
                        namespace, secret_name, key
                    ))
                })
        };
        Ok((field("username")?, field("password")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GrafanaDashboardSpec {
        GrafanaDashboardSpec {
            json: None,
            url: None,
            url_basic_auth_secret: None,
            config_map_ref: None,
            grafana_com: None,
            template: None,
            plugins: None,
            datasources: None,
            custom_folder: None,
            content_cache_duration: None,
        }
    }

    #[test]
    fn url_and_grafana_com_are_mutually_exclusive() {
        let mut s = spec();
        s.url = Some("https://example.com/d.json".to_string());
        s.grafana_com = Some(GrafanaComSource {
            id: 1860,
            revision: None,
        });
        match validate_sources(&s) {
            Err(ControllerError::Validation(_)) => (),
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn at_least_one_source_is_required() {
        match validate_sources(&spec()) {
            Err(ControllerError::Validation(_)) => (),
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn single_sources_validate() {
        let mut s = spec();
        s.json = Some("{}".to_string());
        assert!(validate_sources(&s).is_ok());
        let mut s = spec();
        s.grafana_com = Some(GrafanaComSource {
            id: 1860,
            revision: Some(2),
        });
        assert!(validate_sources(&s).is_ok());
    }
}
