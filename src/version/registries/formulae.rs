//! formulae.brew.sh JSON API implementation

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{FETCH_TIMEOUT_SECS, PackageKind, WatchItem};
use crate::version::error::RegistryError;
use crate::version::registry::{Fetched, Latest, MetadataSource};

/// Default base URL for the Homebrew formulae API
const DEFAULT_BASE_URL: &str = "https://formulae.brew.sh/api";

#[derive(Debug, Default, Deserialize)]
struct StableVersions {
    #[serde(default)]
    stable: Option<String>,
}

/// Response from `/formula/<name>.json`
#[derive(Debug, Deserialize)]
struct FormulaResponse {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    revision: i64,
    #[serde(default)]
    version_scheme: i64,
    #[serde(default)]
    versions: StableVersions,
}

/// Response from `/cask/<name>.json`
#[derive(Debug, Deserialize)]
struct CaskResponse {
    #[serde(default)]
    version: Option<String>,
}

/// Metadata source backed by the Homebrew formulae API
pub struct FormulaeApi {
    client: reqwest::Client,
    base_url: String,
}

impl FormulaeApi {
    /// Creates a new FormulaeApi with a custom base URL
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("brew-updater")
                .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn parse_latest(kind: Option<PackageKind>, body: &[u8]) -> Result<Latest, RegistryError> {
        match kind {
            Some(PackageKind::Cask) => {
                let cask: CaskResponse = serde_json::from_slice(body)
                    .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
                Ok(Latest {
                    version: cask.version.unwrap_or_default(),
                    scheme: 0,
                })
            }
            _ => {
                let formula: FormulaResponse = serde_json::from_slice(body)
                    .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
                let mut version = formula
                    .versions
                    .stable
                    .filter(|v| !v.is_empty())
                    .or(formula.version)
                    .unwrap_or_default();
                if !version.is_empty() && formula.revision > 0 {
                    version = format!("{}_{}", version, formula.revision);
                }
                Ok(Latest {
                    version,
                    scheme: formula.version_scheme,
                })
            }
        }
    }
}

impl Default for FormulaeApi {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait::async_trait]
impl MetadataSource for FormulaeApi {
    fn url_for(&self, item: &WatchItem) -> String {
        match item.kind {
            Some(PackageKind::Cask) => format!("{}/cask/{}.json", self.base_url, item.name),
            _ => format!("{}/formula/{}.json", self.base_url, item.name),
        }
    }

    async fn fetch_latest(
        &self,
        item: &WatchItem,
        etag: Option<String>,
    ) -> Result<Fetched, RegistryError> {
        let url = self.url_for(item);

        let mut request = self.client.get(&url);
        if let Some(etag) = etag.as_deref().filter(|e| !e.is_empty()) {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await?;

        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!("Not modified: {}", url);
            return Ok(Fetched::NotModified);
        }

        if status != StatusCode::OK {
            warn!("formulae API returned status {}: {}", status, url);
            return Err(RegistryError::Status(status.as_u16()));
        }

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let body = response.bytes().await?;

        let latest = Self::parse_latest(item.kind, &body).inspect_err(|e| {
            warn!("Failed to parse formulae API response for {}: {}", url, e);
        })?;

        Ok(Fetched::Modified {
            latest,
            etag: new_etag,
        })
    }
}
