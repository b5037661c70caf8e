//! Version layer: fetching latest metadata and deciding whether an upgrade is warranted
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌─────────────┐
//! │ MetadataSource │────▶│   semver    │
//! │    (fetch)     │     │ (outdated?) │
//! └────────────────┘     └─────────────┘
//!         │
//!         ▼
//! ┌────────────────┐
//! │   registries   │
//! │ (formulae API) │
//! └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: `MetadataSource` trait for conditional latest-version fetches
//! - [`registries`]: Concrete sources (formulae.brew.sh)
//! - [`error`]: Error types for fetch operations
//! - [`semver`]: Normalization and scheme-aware outdated check

pub mod error;
pub mod registries;
pub mod registry;
pub mod semver;
