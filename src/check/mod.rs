//! Check-and-reconcile engine
//!
//! One run: snapshot installed packages, migrate and prune state, fetch the
//! latest version of every due item, record what changed, and then upgrade or
//! notify according to each item's policy.
//!
//! # Modules
//!
//! - [`fetch`]: Worker pool fanning due items out to a [`MetadataSource`]
//! - [`schedule`]: Due-set computation and next-check stamping

pub mod fetch;
pub mod schedule;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brew::{BrewError, Installed, PackageManager};
use crate::config::{APP_NAME, Config, FETCH_WORKERS, PackageKind, Policy, WatchItem};
use crate::notify::Notifier;
use crate::state::State;
use crate::version::registry::{Fetched, MetadataSource};
use crate::version::semver::is_outdated;

use fetch::{FetchJob, fetch_all};
use schedule::{due_items, next_check_after};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("failed to list installed packages: {0}")]
    ListInstalled(#[source] BrewError),

    #[error("check cancelled")]
    Cancelled,
}

/// Flags of a single `check` invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOptions {
    /// Report and notify, never upgrade
    pub dry_run: bool,
    /// Refresh the package index even when nothing is outdated
    pub force_update: bool,
    /// Notify about every outdated item regardless of policy, never upgrade
    pub notify_only: bool,
}

/// A watched item whose upstream version is newer than the installed one
#[derive(Debug, Clone, PartialEq)]
pub struct OutdatedItem {
    pub item: WatchItem,
    pub installed: String,
    pub latest: String,
}

/// What a run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckReport {
    pub checked: usize,
    pub checked_names: Vec<String>,
    /// Outdated items that were acted on (upgraded or notified)
    pub outdated: Vec<OutdatedItem>,
    /// Items dropped from the watchlist because they are no longer installed
    pub removed: Vec<WatchItem>,
    /// Errors raised during this run
    pub errors: Vec<String>,
}

/// Outcome of a successful run: the report plus the updated config and state
#[derive(Debug, Clone)]
pub struct CheckRun {
    pub report: CheckReport,
    pub config: Config,
    pub state: State,
}

/// Drives one check-and-reconcile run against its collaborators
pub struct Checker {
    source: Arc<dyn MetadataSource>,
    brew: Arc<dyn PackageManager>,
    notifier: Arc<dyn Notifier>,
    workers: usize,
}

impl Checker {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        brew: Arc<dyn PackageManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            brew,
            notifier,
            workers: FETCH_WORKERS,
        }
    }

    /// Overrides the number of concurrent fetch workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub async fn run(
        &self,
        config: Config,
        state: State,
        opts: CheckOptions,
        cancel: CancellationToken,
    ) -> Result<CheckRun, CheckError> {
        self.run_at(Utc::now(), config, state, opts, cancel).await
    }

    /// Runs with an explicit clock reading; every timestamp of the run uses `now`
    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        mut config: Config,
        mut state: State,
        opts: CheckOptions,
        cancel: CancellationToken,
    ) -> Result<CheckRun, CheckError> {
        let mut report = CheckReport::default();

        let installed = self
            .brew
            .list_installed()
            .await
            .map_err(CheckError::ListInstalled)?;

        state.migrate_legacy_keys(&config.watchlist);
        let installed_by_key = prune_missing(&mut config, &mut state, &installed, &mut report);
        state.retain_watched(&config.watchlist);

        let due = due_items(&config.watchlist, &state, now);
        report.checked = due.len();
        report.checked_names = sorted(due.iter().map(|item| item.name.clone()));
        if due.is_empty() {
            debug!("No items due");
            state.last_check_at = Some(now);
            return Ok(CheckRun {
                report,
                config,
                state,
            });
        }
        info!("Checking {} due items", due.len());

        // Scheme recorded before this run's fetches overwrite it
        let prev_schemes: HashMap<String, i64> = due
            .iter()
            .map(|item| (item.key(), state.last_scheme(item).unwrap_or(0)))
            .collect();
        let jobs = due
            .into_iter()
            .map(|item| {
                let etag = state.etag_cache.get(&self.source.url_for(&item)).cloned();
                FetchJob { item, etag }
            })
            .collect();
        let outcomes = fetch_all(Arc::clone(&self.source), jobs, self.workers, cancel.clone()).await;
        if cancel.is_cancelled() {
            return Err(CheckError::Cancelled);
        }

        let mut outdated = Vec::new();
        for outcome in outcomes {
            let item = outcome.item;
            let key = item.key();
            let (latest, scheme) = match outcome.result {
                Err(e) => {
                    record_error(&mut report, &mut state, format!("{}: {}", item.name, e));
                    continue;
                }
                Ok(Fetched::NotModified) => (
                    state.last_version(&item).cloned().unwrap_or_default(),
                    state.last_scheme(&item).unwrap_or(0),
                ),
                Ok(Fetched::Modified { latest, etag }) => {
                    if let Some(etag) = etag {
                        state.etag_cache.insert(outcome.url, etag);
                    }
                    if !latest.version.is_empty() {
                        state.last_versions.insert(key.clone(), latest.version.clone());
                    }
                    state.last_schemes.insert(key.clone(), latest.scheme);
                    if key != item.name {
                        state.last_versions.remove(&item.name);
                        state.last_schemes.remove(&item.name);
                    }
                    (latest.version, latest.scheme)
                }
            };

            let installed_version = installed_by_key.get(&key).cloned().unwrap_or_default();
            let prev_scheme = prev_schemes.get(&key).copied().unwrap_or(0);
            if is_outdated(&installed_version, &latest, scheme, prev_scheme) {
                debug!(key = %key, "Outdated: {} -> {}", installed_version, latest);
                outdated.push(OutdatedItem {
                    item: item.clone(),
                    installed: installed_version,
                    latest,
                });
            }

            state.next_check_at.insert(key.clone(), next_check_after(&item, now));
            if key != item.name {
                state.next_check_at.remove(&item.name);
            }
        }
        outdated.sort_by(|a, b| a.item.key().cmp(&b.item.key()));
        report.outdated = outdated;

        self.dispatch(now, &config, &mut state, &mut report, opts)
            .await;

        Ok(CheckRun {
            report,
            config,
            state,
        })
    }

    /// Upgrades or notifies for `report.outdated`, narrowing it to what was acted on
    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        config: &Config,
        state: &mut State,
        report: &mut CheckReport,
        opts: CheckOptions,
    ) {
        let mut refreshed = false;
        if opts.force_update && !opts.dry_run && !opts.notify_only {
            if let Err(e) = self.brew.update().await {
                self.fail(report, state, "brew update failed", e).await;
                state.last_check_at = Some(now);
                return;
            }
            refreshed = true;
        }

        if report.outdated.is_empty() {
            state.last_check_at = Some(now);
            return;
        }

        if opts.dry_run || opts.notify_only {
            self.notify_items(&report.outdated, "Update available").await;
            state.last_check_at = Some(now);
            return;
        }

        if !refreshed {
            if let Err(e) = self.brew.update().await {
                self.fail(report, state, "brew update failed", e).await;
                state.last_check_at = Some(now);
                return;
            }
        }

        let (auto, notify): (Vec<_>, Vec<_>) = std::mem::take(&mut report.outdated)
            .into_iter()
            .partition(|o| o.item.effective_policy(config.default_policy) == Policy::Auto);
        self.notify_items(&notify, "Update available").await;
        report.outdated = notify;

        let greedy = config.include_auto_update_cask;
        let mut confirmed: HashMap<PackageKind, Vec<String>> = HashMap::new();
        for kind in [PackageKind::Formula, PackageKind::Cask] {
            let candidates = sorted(
                auto.iter()
                    .filter(|o| o.item.kind.unwrap_or(PackageKind::Formula) == kind)
                    .map(|o| o.item.name.clone()),
            );
            if candidates.is_empty() {
                continue;
            }
            match self.brew.outdated(kind, candidates.clone(), greedy).await {
                Ok(reported) => {
                    let reported: HashSet<String> = reported.into_iter().collect();
                    let names: Vec<String> = candidates
                        .into_iter()
                        .filter(|name| reported.contains(name))
                        .collect();
                    if !names.is_empty() {
                        confirmed.insert(kind, names);
                    }
                }
                Err(e) => {
                    let what = format!("brew outdated {} failed", kind);
                    self.fail(report, state, &what, e).await;
                }
            }
        }

        if confirmed.is_empty() {
            debug!("Nothing confirmed outdated by brew");
            state.last_check_at = Some(now);
            return;
        }

        let mut upgraded = Vec::new();
        for kind in [PackageKind::Formula, PackageKind::Cask] {
            let Some(names) = confirmed.remove(&kind) else {
                continue;
            };
            let acted: Vec<OutdatedItem> = auto
                .iter()
                .filter(|o| o.item.kind.unwrap_or(PackageKind::Formula) == kind)
                .filter(|o| names.contains(&o.item.name))
                .cloned()
                .collect();
            let cask_greedy = kind == PackageKind::Cask && greedy;
            match self.brew.upgrade(kind, names, cask_greedy).await {
                Ok(()) => upgraded.extend(acted.iter().cloned()),
                Err(e) => {
                    let what = format!("{} upgrade failed", kind);
                    self.fail(report, state, &what, e).await;
                }
            }
            report.outdated.extend(acted);
        }

        if !upgraded.is_empty() {
            info!("Upgraded {} packages", upgraded.len());
            state.last_update_at = Some(now);
            self.notify_items(&upgraded, "Updated").await;
        }
        state.last_check_at = Some(now);
    }

    async fn notify_items(&self, items: &[OutdatedItem], heading: &str) {
        let title = format!("{}: {}", APP_NAME, heading);
        let sends = items.iter().map(|o| {
            let message = format!("{} {} → {}", o.item.name, o.installed, o.latest);
            let action = format!("{} upgrade {}", APP_NAME, o.item.name);
            let title = title.clone();
            async move {
                if let Err(e) = self.notifier.notify(&title, &message, &action).await {
                    debug!("Notification dropped: {}", e);
                }
            }
        });
        join_all(sends).await;
    }

    async fn fail(&self, report: &mut CheckReport, state: &mut State, what: &str, err: BrewError) {
        warn!("{}: {}", what, err);
        record_error(report, state, format!("{}: {}", what, err));
        let message = format!("{}: {}", what, err.to_string().trim());
        let title = format!("{} failed", APP_NAME);
        let action = format!("{} status", APP_NAME);
        if let Err(e) = self.notifier.notify(&title, &message, &action).await {
            debug!("Notification dropped: {}", e);
        }
    }
}

/// Drops watch items that are no longer installed and syncs the kind of the rest.
/// Returns the installed version of each surviving item by key.
fn prune_missing(
    config: &mut Config,
    state: &mut State,
    installed: &Installed,
    report: &mut CheckReport,
) -> HashMap<String, String> {
    let mut versions = HashMap::new();
    let mut kept = Vec::with_capacity(config.watchlist.len());
    for mut item in std::mem::take(&mut config.watchlist) {
        match installed.find(&item.name, item.kind) {
            Some((kind, version)) => {
                item.kind = Some(kind);
                versions.insert(item.key(), version.to_string());
                kept.push(item);
            }
            None => {
                info!(key = %item.key(), "No longer installed, removing from watchlist");
                state.forget(&item);
                report.removed.push(item);
            }
        }
    }
    config.watchlist = kept;
    versions
}

fn record_error(report: &mut CheckReport, state: &mut State, message: String) {
    state.record_error(message.clone());
    report.errors.push(message);
}

fn sorted(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut names: Vec<String> = names.collect();
    names.sort();
    names
}
