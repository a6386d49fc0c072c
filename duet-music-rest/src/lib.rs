use async_trait::async_trait;
use const_format::concatcp;
use duet_core::{CoreError, MusicResolver, ProvidersConfig};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Name of the `[providers.*]` table this resolver reads.
pub const PROVIDER_NAME: &str = "rest_music";

/// Default table holding one background-music record per figure
const DEFAULT_TABLE: &str = "figure_music";
/// Default storage bucket for uploaded tracks
const DEFAULT_BUCKET: &str = "music";
/// Default timeout for HTTP requests (10 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Default number of retry attempts
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Config template appended to the core template.
pub const CONFIG_TEMPLATE: &str = concatcp!(
    r#"
# Background music lookup over the hosted REST API
[providers.rest_music]
# Project URL, e.g. "https://xyzcompany.example.co"
base_url = ""
# Public (anon) API key
api_key = ""
# Table with one row per figure: figure_id, url, storage_path
table = ""#,
    DEFAULT_TABLE,
    r#""
# Storage bucket that storage_path values refer to
bucket = ""#,
    DEFAULT_BUCKET,
    r#""
timeout_secs = "#,
    DEFAULT_TIMEOUT_SECS,
    r"
max_retries = ",
    DEFAULT_MAX_RETRIES,
    "\n"
);

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// `[providers.rest_music]` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RestMusicConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RestMusicConfig {
    /// Read the resolver's table from the providers config, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the table exists but does not match.
    pub fn from_providers(providers: &ProvidersConfig) -> Result<Option<Self>, CoreError> {
        providers.get(PROVIDER_NAME)
    }

    /// Check that the settings can be used to build a resolver.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing key or an unusable base URL.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_url.trim().is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: format!("providers.{PROVIDER_NAME}.base_url"),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: format!("providers.{PROVIDER_NAME}.api_key"),
            });
        }
        let url = Url::parse(self.base_url.trim()).map_err(|e| CoreError::ConfigInvalid {
            message: format!("providers.{PROVIDER_NAME}.base_url: {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::ConfigInvalid {
                message: format!(
                    "providers.{PROVIDER_NAME}.base_url must be http(s), got {}",
                    url.scheme()
                ),
            });
        }
        if self.table.trim().is_empty() || self.bucket.trim().is_empty() {
            return Err(CoreError::ConfigInvalid {
                message: format!("providers.{PROVIDER_NAME}: table and bucket must not be empty"),
            });
        }
        Ok(())
    }
}

/// Row of the background-music table.
///
/// Unused columns are ignored.
#[derive(Debug, Deserialize)]
struct MusicTrackRecord {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    storage_path: Option<String>,
}

/// Background-music resolver backed by a PostgREST-style API
pub struct RestMusicResolver {
    client: ClientWithMiddleware,
    base_url: String,
    table: String,
    bucket: String,
}

impl RestMusicResolver {
    /// Create a resolver from validated settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the HTTP client cannot
    /// be created.
    pub fn new(config: &RestMusicConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let api_key = config.api_key.trim();
        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(api_key)?);
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {api_key}"))?);

        // Base client with timeout
        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .user_agent("Duet/1.0")
            .default_headers(headers)
            .build()?;

        // Wrap with retry middleware (exponential backoff)
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            table: config.table.trim().to_string(),
            bucket: config.bucket.trim().to_string(),
        })
    }

    fn lookup_url(&self, figure_id: &str) -> String {
        format!(
            "{}/rest/v1/{}?figure_id=eq.{}&select=url,storage_path",
            self.base_url,
            urlencoding::encode(&self.table),
            urlencoding::encode(figure_id)
        )
    }

    /// Public URL of an object in the configured bucket.
    fn public_object_url(&self, path: &str) -> String {
        let path = path
            .trim()
            .trim_start_matches('/')
            .split('/')
            .map(urlencoding::encode)
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            urlencoding::encode(&self.bucket),
            path
        )
    }

    /// First record with something playable wins.
    fn pick_url(&self, records: Vec<MusicTrackRecord>) -> Option<String> {
        records.into_iter().find_map(|record| {
            let url = record.url.as_deref().map(str::trim).filter(|u| !u.is_empty());
            if let Some(url) = url {
                if url.starts_with("http://") || url.starts_with("https://") {
                    return Some(url.to_string());
                }
                return Some(self.public_object_url(url));
            }
            record
                .storage_path
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| self.public_object_url(p))
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, CoreError> {
    HeaderValue::from_str(value).map_err(|e| CoreError::ConfigInvalid {
        message: format!("providers.{PROVIDER_NAME}.api_key: {e}"),
    })
}

#[async_trait]
impl MusicResolver for RestMusicResolver {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn resolve(&self, figure_id: &str) -> Result<Option<String>, CoreError> {
        let url = self.lookup_url(figure_id);
        info!("Looking up background music for figure {}", figure_id);
        debug!("REST GET: {}", url);

        let response = self.client.get(&url).send().await?;
        debug!("REST response status: {}", response.status());

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("Background music table {} not found", self.table);
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(CoreError::MusicLookupFailed {
                provider: self.name().to_string(),
                reason: format!("lookup returned status: {}", response.status()),
            });
        }

        let records: Vec<MusicTrackRecord> = response.json().await?;
        let found = self.pick_url(records);
        match &found {
            Some(url) => info!("Background music for figure {}: {}", figure_id, url),
            None => info!("No background music stored for figure {}", figure_id),
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::{build_config_template, resolve_or_none, DuetConfig};

    fn config() -> RestMusicConfig {
        RestMusicConfig {
            base_url: "https://project.example.co/".into(),
            api_key: "anon-key".into(),
            table: default_table(),
            bucket: default_bucket(),
            timeout_secs: 1,
            max_retries: 0,
        }
    }

    fn records(json: &str) -> Vec<MusicTrackRecord> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_lookup_url() {
        let resolver = RestMusicResolver::new(&config()).unwrap();
        assert_eq!(
            resolver.lookup_url("grand ma"),
            "https://project.example.co/rest/v1/figure_music?figure_id=eq.grand%20ma&select=url,storage_path"
        );
    }

    #[test]
    fn test_absolute_url_is_used_as_is() {
        let resolver = RestMusicResolver::new(&config()).unwrap();
        let found = resolver.pick_url(records(
            r#"[{"url": " https://cdn.example/rain.mp3 ", "storage_path": "ignored.mp3"}]"#,
        ));
        assert_eq!(found.as_deref(), Some("https://cdn.example/rain.mp3"));
    }

    #[test]
    fn test_storage_path_is_expanded() {
        let resolver = RestMusicResolver::new(&config()).unwrap();
        let found = resolver.pick_url(records(
            r#"[{"url": null, "storage_path": "/figures/grandma/rain night.mp3"}]"#,
        ));
        assert_eq!(
            found.as_deref(),
            Some("https://project.example.co/storage/v1/object/public/music/figures/grandma/rain%20night.mp3")
        );
    }

    #[test]
    fn test_first_usable_record_wins() {
        let resolver = RestMusicResolver::new(&config()).unwrap();
        let found = resolver.pick_url(records(
            r#"[
                {"url": "", "storage_path": " "},
                {"figure_id": "grandma", "url": "https://cdn.example/second.mp3"},
                {"url": "https://cdn.example/third.mp3"}
            ]"#,
        ));
        assert_eq!(found.as_deref(), Some("https://cdn.example/second.mp3"));
    }

    #[test]
    fn test_no_records_means_no_music() {
        let resolver = RestMusicResolver::new(&config()).unwrap();
        assert_eq!(resolver.pick_url(records("[]")), None);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut missing_key = config();
        missing_key.api_key = "  ".into();
        assert!(matches!(
            missing_key.validate(),
            Err(CoreError::ConfigMissingField { .. })
        ));

        let mut bad_scheme = config();
        bad_scheme.base_url = "ftp://project.example.co".into();
        assert!(matches!(
            bad_scheme.validate(),
            Err(CoreError::ConfigInvalid { .. })
        ));

        let mut not_a_url = config();
        not_a_url.base_url = "project".into();
        assert!(RestMusicResolver::new(&not_a_url).is_err());
    }

    #[test]
    fn test_reads_provider_table() {
        let config = DuetConfig::from_toml_str(
            r#"
            [providers.rest_music]
            base_url = "https://project.example.co"
            api_key = "anon-key"
            bucket = "ambience"
            "#,
        )
        .unwrap();

        let rest = RestMusicConfig::from_providers(&config.providers)
            .unwrap()
            .unwrap();
        assert_eq!(rest.bucket, "ambience");
        assert_eq!(rest.table, DEFAULT_TABLE);
        assert_eq!(rest.max_retries, DEFAULT_MAX_RETRIES);
        assert!(rest.validate().is_ok());
    }

    #[test]
    fn test_missing_provider_table() {
        let config = DuetConfig::from_toml_str("").unwrap();
        assert!(RestMusicConfig::from_providers(&config.providers)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_template_parses() {
        let template = build_config_template(Some(&[CONFIG_TEMPLATE][..]));
        let config = DuetConfig::from_toml_str(&template).unwrap();
        let rest = RestMusicConfig::from_providers(&config.providers)
            .unwrap()
            .unwrap();
        assert_eq!(rest.table, DEFAULT_TABLE);
        assert_eq!(rest.bucket, DEFAULT_BUCKET);
        assert_eq!(rest.timeout_secs, DEFAULT_TIMEOUT_SECS);
        // The template ships without credentials
        assert!(rest.validate().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_degrades_to_no_music() {
        let mut unreachable = config();
        unreachable.base_url = "http://127.0.0.1:9".into();
        let resolver = RestMusicResolver::new(&unreachable).unwrap();

        assert!(resolver.resolve("grandma").await.is_err());
        assert_eq!(resolve_or_none(&resolver, Some("grandma")).await, None);
    }
}
