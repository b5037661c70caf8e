//! Interactive watchlist selection

use std::collections::HashMap;
use std::fmt;

use inquire::{InquireError, MultiSelect};
use thiserror::Error;

use crate::config::{PackageKind, Policy, watch_key};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("selection prompt failed: {0}")]
    Prompt(#[from] InquireError),
}

/// An installed package offered for watching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub kind: PackageKind,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// A chosen package with its per-item settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub name: String,
    pub kind: PackageKind,
    pub policy: Option<Policy>,
    pub interval_min: u32,
}

/// Settings applied to newly selected packages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionDefaults {
    pub policy: Option<Policy>,
    pub interval_min: u32,
}

/// Presents candidates and returns the chosen set, or `None` when cancelled.
///
/// `preset` holds current selections keyed by watch key; they start selected
/// and keep their settings.
pub trait Selector {
    fn present(
        &self,
        candidates: &[Candidate],
        defaults: SelectionDefaults,
        preset: &HashMap<String, Selection>,
    ) -> Result<Option<Vec<Selection>>, SelectError>;
}

/// Terminal multi-select backed by `inquire`
pub struct PromptSelector;

impl Selector for PromptSelector {
    fn present(
        &self,
        candidates: &[Candidate],
        defaults: SelectionDefaults,
        preset: &HashMap<String, Selection>,
    ) -> Result<Option<Vec<Selection>>, SelectError> {
        let preselected: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| preset.contains_key(&watch_key(&c.name, Some(c.kind))))
            .map(|(i, _)| i)
            .collect();

        let chosen = match MultiSelect::new("Packages to watch:", candidates.to_vec())
            .with_default(&preselected)
            .with_page_size(20)
            .prompt()
        {
            Ok(chosen) => chosen,
            Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(apply_defaults(chosen, defaults, preset)))
    }
}

/// Builds selections, keeping preset settings for packages already watched
pub fn apply_defaults(
    chosen: Vec<Candidate>,
    defaults: SelectionDefaults,
    preset: &HashMap<String, Selection>,
) -> Vec<Selection> {
    chosen
        .into_iter()
        .map(|c| {
            let key = watch_key(&c.name, Some(c.kind));
            match preset.get(&key) {
                Some(existing) => existing.clone(),
                None => Selection {
                    name: c.name,
                    kind: c.kind,
                    policy: defaults.policy,
                    interval_min: defaults.interval_min,
                },
            }
        })
        .collect()
}
