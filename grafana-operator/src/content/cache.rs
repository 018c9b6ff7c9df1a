//! Compressed content cache stored in the dashboard's status
//! sub-resource.
//!
//! Cached content is only trusted while the stored URL still equals the
//! currently configured source URL and the cache duration has not passed.
//! Any violation, including a blob that fails to decode or decompress, is
//! a cache miss and never an error: callers treat an empty result as
//! "must fetch".

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use grafana_operator_apis::GrafanaDashboard;
use k8s_openapi::chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Decompressed cached content, or `None` on URL mismatch, expiry or
/// corruption.
pub(crate) fn get(
    dashboard: &GrafanaDashboard,
    source_url: &str,
    now: DateTime<Utc>,
) -> Option<Vec<u8>> {
    let status = dashboard.status.as_ref()?;
    let blob = status.content_cache.as_deref()?;
    if status.content_url.as_deref() != Some(source_url) {
        return None;
    }
    let duration = dashboard.content_cache_duration();
    if duration > 0 {
        let fetched = status
            .content_timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())?
            .with_timezone(&Utc);
        if fetched + Duration::seconds(duration) <= now {
            return None;
        }
    }
    decompress(blob)
}

/// Store freshly fetched content alongside its source URL and fetch
/// timestamp, so an unchanged spec is a guaranteed cache hit on the next
/// reconcile.
pub(crate) fn put(
    dashboard: &mut GrafanaDashboard,
    source_url: &str,
    content: &[u8],
    now: DateTime<Utc>,
) -> Result<(), std::io::Error> {
    let mut status = dashboard.status.take().unwrap_or_default();
    status.content_cache = Some(compress(content)?);
    status.content_url = Some(source_url.to_string());
    status.content_timestamp = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    dashboard.status = Some(status);
    Ok(())
}

fn compress(content: &[u8]) -> Result<String, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(BASE64.encode(encoder.finish()?))
}

fn decompress(blob: &str) -> Option<Vec<u8>> {
    let compressed = BASE64.decode(blob).ok()?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut content = Vec::new();
    decoder.read_to_end(&mut content).ok()?;
    Some(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grafana_operator_apis::{GrafanaDashboardSpec, GrafanaDashboardStatus};

    fn dashboard(cache_duration: Option<i64>) -> GrafanaDashboard {
        GrafanaDashboard::new(
            "demo",
            GrafanaDashboardSpec {
                json: None,
                url: Some("https://example.com/d.json".to_string()),
                url_basic_auth_secret: None,
                config_map_ref: None,
                grafana_com: None,
                template: None,
                plugins: None,
                datasources: None,
                custom_folder: None,
                content_cache_duration: cache_duration,
            },
        )
    }

    #[test]
    fn round_trip() {
        let mut d = dashboard(Some(86400));
        let now = Utc::now();
        let content = br#"{"title":"demo","panels":[]}"#;
        put(&mut d, "https://example.com/d.json", content, now).unwrap();
        assert_eq!(
            Some(content.to_vec()),
            get(&d, "https://example.com/d.json", now)
        );
    }

    #[test]
    fn url_mismatch_is_a_miss() {
        let mut d = dashboard(Some(86400));
        let now = Utc::now();
        put(&mut d, "https://example.com/u1.json", b"content", now).unwrap();
        assert_eq!(None, get(&d, "https://example.com/u2.json", now));
        assert!(get(&d, "https://example.com/u1.json", now).is_some());
    }

    #[test]
    fn expired_cache_is_a_miss() {
        let mut d = dashboard(Some(3600));
        let fetched = Utc::now();
        put(&mut d, "https://example.com/d.json", b"content", fetched).unwrap();
        let later = fetched + Duration::seconds(3601);
        assert_eq!(None, get(&d, "https://example.com/d.json", later));
    }

    #[test]
    fn zero_duration_never_expires() {
        let mut d = dashboard(None);
        let fetched = Utc::now() - Duration::days(365);
        put(&mut d, "https://example.com/d.json", b"content", fetched).unwrap();
        assert_eq!(
            Some(b"content".to_vec()),
            get(&d, "https://example.com/d.json", Utc::now())
        );
    }

    #[test]
    fn corrupted_blob_is_a_miss_not_an_error() {
        let now = Utc::now();
        let mut d = dashboard(Some(86400));
        put(&mut d, "https://example.com/d.json", b"content", now).unwrap();
        // Not base64.
        d.status.as_mut().unwrap().content_cache = Some("%%%".to_string());
        assert_eq!(None, get(&d, "https://example.com/d.json", now));
        // Base64, but not gzip.
        d.status.as_mut().unwrap().content_cache = Some(BASE64.encode(b"plain"));
        assert_eq!(None, get(&d, "https://example.com/d.json", now));
    }

    #[test]
    fn missing_status_is_a_miss() {
        let d = dashboard(Some(86400));
        assert_eq!(None, get(&d, "https://example.com/d.json", Utc::now()));
        let mut d = dashboard(Some(86400));
        d.status = Some(GrafanaDashboardStatus::default());
        assert_eq!(None, get(&d, "https://example.com/d.json", Utc::now()));
    }
}
