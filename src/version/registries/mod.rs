//! Metadata source implementations for fetching latest versions

pub mod formulae;

pub use formulae::FormulaeApi;
