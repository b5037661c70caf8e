//! Source of latest-version metadata for watched packages

#[cfg(test)]
use mockall::automock;

use crate::config::WatchItem;
use crate::version::error::RegistryError;

/// Latest version published upstream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Latest {
    pub version: String,
    /// Versioning scheme tag; 0 when the source has no such concept
    pub scheme: i64,
}

/// Outcome of a conditional metadata request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// The freshness token is still valid; reuse what was stored last time
    NotModified,
    Modified {
        latest: Latest,
        /// New freshness token, if the server sent one
        etag: Option<String>,
    },
}

/// Trait for fetching the latest version of a single package
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    /// URL the metadata for `item` is fetched from; freshness tokens are keyed by it
    fn url_for(&self, item: &WatchItem) -> String;

    /// Fetches the latest version for `item`
    ///
    /// # Arguments
    /// * `item` - The watched package
    /// * `etag` - Freshness token from the previous successful fetch, sent as a precondition
    ///
    /// # Returns
    /// * `Ok(Fetched)` - New metadata, or `NotModified` when the token is still valid
    /// * `Err(RegistryError)` - Transport failure or unexpected status
    async fn fetch_latest(
        &self,
        item: &WatchItem,
        etag: Option<String>,
    ) -> Result<Fetched, RegistryError>;
}
