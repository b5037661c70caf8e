//! Manual upgrade of watched packages

use tracing::info;

use crate::brew::{BrewError, PackageManager};
use crate::config::{PackageKind, WatchItem};

/// Names to upgrade, split by kind and sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeTargets {
    pub formulae: Vec<String>,
    pub casks: Vec<String>,
}

impl UpgradeTargets {
    /// Selects watched items by name (all of them when `names` is empty or `all`
    /// is set), restricted to `kind` when given.
    pub fn select(
        watchlist: &[WatchItem],
        names: &[String],
        all: bool,
        kind: Option<PackageKind>,
    ) -> Self {
        let mut targets = Self::default();
        for item in watchlist {
            if !all && !names.is_empty() && !names.contains(&item.name) {
                continue;
            }
            let item_kind = item.kind.unwrap_or(PackageKind::Formula);
            if kind.is_some_and(|k| k != item_kind) {
                continue;
            }
            match item_kind {
                PackageKind::Formula => targets.formulae.push(item.name.clone()),
                PackageKind::Cask => targets.casks.push(item.name.clone()),
            }
        }
        targets.formulae.sort();
        targets.casks.sort();
        targets
    }

    pub fn is_empty(&self) -> bool {
        self.formulae.is_empty() && self.casks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.formulae.len() + self.casks.len()
    }
}

/// Refreshes the index, keeps only what brew reports as outdated, and upgrades
/// formulae then casks. Returns what was upgraded; any failure aborts.
pub async fn upgrade_targets(
    brew: &dyn PackageManager,
    targets: UpgradeTargets,
    greedy: bool,
) -> Result<UpgradeTargets, BrewError> {
    brew.update().await?;

    let mut outdated = UpgradeTargets::default();
    if !targets.formulae.is_empty() {
        outdated.formulae = brew
            .outdated(PackageKind::Formula, targets.formulae, greedy)
            .await?;
    }
    if !targets.casks.is_empty() {
        outdated.casks = brew.outdated(PackageKind::Cask, targets.casks, greedy).await?;
    }
    if outdated.is_empty() {
        info!("No outdated packages");
        return Ok(outdated);
    }

    if !outdated.formulae.is_empty() {
        brew.upgrade(PackageKind::Formula, outdated.formulae.clone(), false)
            .await?;
    }
    if !outdated.casks.is_empty() {
        brew.upgrade(PackageKind::Cask, outdated.casks.clone(), greedy)
            .await?;
    }
    Ok(outdated)
}
