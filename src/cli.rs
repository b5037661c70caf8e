//! Command line interface

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::brew::{Homebrew, Installed, PackageManager};
use crate::check::{CheckOptions, CheckReport, Checker};
use crate::config::{
    APP_NAME, Config, DEFAULT_INTERVAL_MIN, DEFAULT_TICK_INTERVAL_SEC, LOCK_STALE_TIMEOUT_SECS,
    PackageKind, Policy, WatchItem, lock_path, state_path, validate_interval, watch_key,
};
use crate::launchd;
use crate::lock::{LockError, ProcessLock};
use crate::notify::{Notifier, notifier_for};
use crate::select::{Candidate, PromptSelector, Selection, SelectionDefaults, Selector};
use crate::state::State;
use crate::upgrade::{UpgradeTargets, upgrade_targets};
use crate::version::registries::FormulaeApi;

#[derive(Parser, Debug)]
#[command(name = "brew-updater")]
#[command(version, about = "Aggressive Homebrew updater")]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Reduce output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize config and state
    Init,

    /// Select packages to watch
    Watch {
        #[arg(long = "type", value_enum, default_value_t = TypeFilter::All)]
        kind: TypeFilter,

        /// Policy for newly selected packages
        #[arg(long)]
        policy: Option<Policy>,

        /// Check interval for newly selected packages (1-1440)
        #[arg(long, default_value_t = 0)]
        interval_min: u32,
    },

    /// List watched packages
    List {
        #[arg(long = "type", value_enum, default_value_t = TypeFilter::All)]
        kind: TypeFilter,

        #[arg(long)]
        policy: Option<Policy>,
    },

    /// Check updates and upgrade if needed
    Check {
        /// Check only
        #[arg(long)]
        dry_run: bool,

        /// Force brew update
        #[arg(long)]
        force_update: bool,

        /// Notify only
        #[arg(long)]
        notify_only: bool,
    },

    /// Upgrade watched packages
    Upgrade {
        names: Vec<String>,

        /// Upgrade all watched packages
        #[arg(long)]
        all: bool,

        #[arg(long = "type", value_enum, default_value_t = TypeFilter::All)]
        kind: TypeFilter,
    },

    /// Show last check status
    Status,

    /// Update watchlist settings
    Set {
        #[arg(required = true)]
        names: Vec<String>,

        #[arg(long)]
        policy: Option<Policy>,

        /// 1-1440
        #[arg(long, default_value_t = 0)]
        interval_min: u32,
    },

    /// Manage the launchd agent
    Launchd {
        #[command(subcommand)]
        action: LaunchdCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum LaunchdCommand {
    /// Install launchd agent
    Install {
        /// Fixed to 60
        #[arg(long, default_value_t = DEFAULT_TICK_INTERVAL_SEC)]
        interval_sec: u32,

        /// Run immediately
        #[arg(long)]
        start_now: bool,
    },
    /// Uninstall launchd agent
    Uninstall,
    /// Show launchd status
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TypeFilter {
    Formula,
    Cask,
    All,
}

impl TypeFilter {
    pub fn kind(self) -> Option<PackageKind> {
        match self {
            TypeFilter::Formula => Some(PackageKind::Formula),
            TypeFilter::Cask => Some(PackageKind::Cask),
            TypeFilter::All => None,
        }
    }
}

/// Global options, resolved once and passed to every handler
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config_path: PathBuf,
    pub quiet: bool,
    pub verbose: bool,
}

impl GlobalArgs {
    fn say(&self, line: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", line.as_ref());
        }
    }
}

/// Dispatches a parsed command line
pub async fn run(cli: Cli, config_path: PathBuf) -> anyhow::Result<()> {
    let args = GlobalArgs {
        config_path,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    match cli.command {
        Command::Init => init(&args.config_path),
        Command::Watch {
            kind,
            policy,
            interval_min,
        } => watch(&args, kind, policy, interval_min).await,
        Command::List { kind, policy } => list(&args, kind, policy),
        Command::Check {
            dry_run,
            force_update,
            notify_only,
        } => {
            let opts = CheckOptions {
                dry_run,
                force_update,
                notify_only,
            };
            check(&args, opts).await
        }
        Command::Upgrade { names, all, kind } => upgrade(&args, names, all, kind).await,
        Command::Status => status(&args),
        Command::Set {
            names,
            policy,
            interval_min,
        } => set(&args, &names, policy, interval_min),
        Command::Launchd { action } => launchd_command(&args, action).await,
    }
}

fn require_config(config_path: &Path) -> anyhow::Result<()> {
    let exists = config_path
        .try_exists()
        .with_context(|| format!("failed to access {}", config_path.display()))?;
    if !exists {
        bail!("config not found, run '{} init'", APP_NAME);
    }
    Ok(())
}

fn load_config_state(config_path: &Path) -> anyhow::Result<(Config, State)> {
    require_config(config_path)?;
    let config = Config::load(config_path)?;
    let state = State::load(&state_path(config_path))?;
    Ok((config, state))
}

fn check_interval_flag(interval_min: u32) -> anyhow::Result<()> {
    if interval_min != 0 {
        validate_interval("interval-min", interval_min)?;
    }
    Ok(())
}

fn init(config_path: &Path) -> anyhow::Result<()> {
    if config_path.exists() {
        bail!("config already exists: {}", config_path.display());
    }
    Config::default().save(config_path)?;
    State::default().save(&state_path(config_path))?;
    println!("Initialized: {}", config_path.display());
    Ok(())
}

async fn watch(
    args: &GlobalArgs,
    filter: TypeFilter,
    policy: Option<Policy>,
    interval_min: u32,
) -> anyhow::Result<()> {
    let config_path = &args.config_path;
    let (config, mut state) = load_config_state(config_path)?;
    check_interval_flag(interval_min)?;

    let installed = Homebrew::new(args.verbose).list_installed().await?;
    let candidates = watch_candidates(&installed, filter);
    if candidates.is_empty() {
        println!("No new packages to watch");
        return Ok(());
    }

    let defaults = SelectionDefaults {
        policy,
        interval_min: if interval_min == 0 {
            DEFAULT_INTERVAL_MIN
        } else {
            interval_min
        },
    };
    let preset = preset_selections(&config, &candidates);
    let Some(selected) = PromptSelector.present(&candidates, defaults, &preset)? else {
        println!("Canceled");
        return Ok(());
    };

    let count = selected.len();
    let config = merge_selection(config, filter, selected, Utc::now());
    state.retain_watched(&config.watchlist);

    config.save(config_path)?;
    state.save(&state_path(config_path))?;
    println!("Updated watchlist: {} selected", count);
    Ok(())
}

/// Installed packages offered by `watch`, sorted by name
fn watch_candidates(installed: &Installed, filter: TypeFilter) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = [PackageKind::Formula, PackageKind::Cask]
        .into_iter()
        .filter(|kind| filter.kind().is_none_or(|k| k == *kind))
        .flat_map(|kind| {
            installed.of_kind(kind).keys().map(move |name| Candidate {
                name: name.clone(),
                kind,
            })
        })
        .collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name).then(a.kind.cmp(&b.kind)));
    candidates
}

/// Current settings of candidates that are already watched, keyed by watch key
fn preset_selections(config: &Config, candidates: &[Candidate]) -> HashMap<String, Selection> {
    let existing: HashMap<String, &WatchItem> =
        config.watchlist.iter().map(|w| (w.key(), w)).collect();
    candidates
        .iter()
        .filter_map(|c| {
            let key = watch_key(&c.name, Some(c.kind));
            let item = existing
                .get(&key)
                .or_else(|| existing.get(&c.name))
                .copied()?;
            Some((
                key,
                Selection {
                    name: c.name.clone(),
                    kind: c.kind,
                    policy: item.policy,
                    interval_min: item.interval_min,
                },
            ))
        })
        .collect()
}

/// Replaces the watched items covered by `filter` with `selected`, keeping the
/// original `added_at` of items that stay watched.
fn merge_selection(
    mut config: Config,
    filter: TypeFilter,
    selected: Vec<Selection>,
    now: DateTime<Utc>,
) -> Config {
    let previous = std::mem::take(&mut config.watchlist);
    let added_at: HashMap<String, DateTime<Utc>> = previous
        .iter()
        .filter_map(|w| w.added_at.map(|t| (w.key(), t)))
        .collect();

    let mut watchlist: Vec<WatchItem> = match filter.kind() {
        Some(kind) => previous
            .into_iter()
            .filter(|w| w.kind.is_some_and(|k| k != kind))
            .collect(),
        None => Vec::new(),
    };
    watchlist.extend(selected.into_iter().map(|sel| {
        let key = watch_key(&sel.name, Some(sel.kind));
        let added = added_at
            .get(&key)
            .or_else(|| added_at.get(&sel.name))
            .copied()
            .unwrap_or(now);
        WatchItem {
            name: sel.name,
            kind: Some(sel.kind),
            policy: sel.policy,
            interval_min: sel.interval_min,
            added_at: Some(added),
        }
    }));
    config.watchlist = watchlist;
    config
}

fn list(args: &GlobalArgs, filter: TypeFilter, policy: Option<Policy>) -> anyhow::Result<()> {
    let (config, _) = load_config_state(&args.config_path)?;
    for line in list_lines(&config, filter, policy) {
        println!("{}", line);
    }
    Ok(())
}

/// Renders the watchlist as an aligned table
fn list_lines(config: &Config, filter: TypeFilter, policy: Option<Policy>) -> Vec<String> {
    let mut rows = vec![[
        "NAME".to_string(),
        "TYPE".to_string(),
        "POLICY".to_string(),
        "INTERVAL".to_string(),
    ]];
    for item in &config.watchlist {
        if let Some(kind) = filter.kind() {
            if item.kind != Some(kind) {
                continue;
            }
        }
        let effective = item.effective_policy(config.default_policy);
        if policy.is_some_and(|p| p != effective) {
            continue;
        }
        rows.push([
            item.name.clone(),
            item.kind.map(|k| k.to_string()).unwrap_or_default(),
            effective.to_string(),
            format!("{}m", item.interval_min),
        ]);
    }

    let mut widths = [0usize; 4];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    rows.iter()
        .map(|row| {
            let line = row
                .iter()
                .zip(widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = width))
                .collect::<Vec<_>>()
                .join("  ");
            line.trim_end().to_string()
        })
        .collect()
}

/// Takes the check lock, then reads config and state under it.
///
/// Returns `None` when another check holds the lock. The config must exist
/// before any lock file is created.
fn prepare_check(config_path: &Path) -> anyhow::Result<Option<(ProcessLock, Config, State)>> {
    require_config(config_path)?;
    let lock = match ProcessLock::acquire(
        &lock_path(config_path),
        Duration::from_secs(LOCK_STALE_TIMEOUT_SECS),
    ) {
        Ok(lock) => lock,
        Err(LockError::AlreadyHeld) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let (config, state) = load_config_state(config_path)?;
    Ok(Some((lock, config, state)))
}

async fn check(args: &GlobalArgs, opts: CheckOptions) -> anyhow::Result<()> {
    let config_path = &args.config_path;
    let Some((lock, config, state)) = prepare_check(config_path)? else {
        args.say("skip: another check running");
        return Ok(());
    };

    let brew: Arc<dyn PackageManager> = Arc::new(Homebrew::new(args.verbose));
    match brew.is_running().await {
        Ok(true) => {
            args.say("skip: brew already running");
            return Ok(());
        }
        Ok(false) => {}
        Err(e) => debug!("Could not look for a running brew: {}", e),
    }

    args.say("checking...");
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling check");
                cancel.cancel();
            }
        })
    };

    let notifier: Arc<dyn Notifier> = Arc::from(notifier_for(&config.notify_method));
    let checker = Checker::new(Arc::new(FormulaeApi::default()), brew, notifier);
    let result = checker.run(config, state, opts, cancel).await;
    interrupt.abort();
    let run = result?;

    run.config.save(config_path)?;
    run.state.save(&state_path(config_path))?;
    lock.release()?;

    if !args.quiet {
        for line in summary_lines(&run.report, args.verbose) {
            println!("{}", line);
        }
    }
    Ok(())
}

fn join_names(names: &[String]) -> String {
    if names.is_empty() {
        return "-".to_string();
    }
    names.join(", ")
}

fn sorted_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut names: Vec<String> = names.map(str::to_string).collect();
    names.sort();
    names
}

/// Human-readable summary of a check run
fn summary_lines(report: &CheckReport, verbose: bool) -> Vec<String> {
    if report.checked == 0 {
        return vec!["no packages due for check".to_string()];
    }
    let mut lines = Vec::new();
    if verbose {
        lines.push(format!("checked={}", report.checked));
        lines.push(format!(
            "checked packages: {}",
            join_names(&report.checked_names)
        ));
    } else {
        lines.push(format!(
            "checked={}: {}",
            report.checked,
            join_names(&report.checked_names)
        ));
    }

    if report.outdated.is_empty() {
        lines.push("outdated=0".to_string());
    } else if verbose {
        lines.push(format!("outdated={}", report.outdated.len()));
        for o in &report.outdated {
            lines.push(format!("- {} {} -> {}", o.item.name, o.installed, o.latest));
        }
    } else {
        let names = sorted_names(report.outdated.iter().map(|o| o.item.name.as_str()));
        lines.push(format!("outdated={}: {}", names.len(), join_names(&names)));
    }

    if !report.removed.is_empty() {
        let names = sorted_names(report.removed.iter().map(|w| w.name.as_str()));
        lines.push(format!("removed={}: {}", names.len(), join_names(&names)));
    }
    lines
}

async fn upgrade(
    args: &GlobalArgs,
    names: Vec<String>,
    all: bool,
    filter: TypeFilter,
) -> anyhow::Result<()> {
    let (config, _) = load_config_state(&args.config_path)?;
    let targets = UpgradeTargets::select(&config.watchlist, &names, all, filter.kind());
    if targets.is_empty() {
        args.say("no watched packages matched");
        return Ok(());
    }

    args.say(format!("targets={}", targets.len()));
    if !targets.formulae.is_empty() {
        args.say(format!("formula: {}", join_names(&targets.formulae)));
    }
    if !targets.casks.is_empty() {
        args.say(format!("cask: {}", join_names(&targets.casks)));
    }
    args.say("brew update...");

    let greedy = config.include_auto_update_cask;
    let brew = Homebrew::new(args.verbose);
    let upgraded = upgrade_targets(&brew, targets, greedy).await?;
    if upgraded.is_empty() {
        args.say("no outdated packages");
        return Ok(());
    }
    if !upgraded.formulae.is_empty() {
        args.say(format!("upgraded formula: {}", join_names(&upgraded.formulae)));
    }
    if !upgraded.casks.is_empty() {
        let suffix = if greedy { " (greedy)" } else { "" };
        args.say(format!(
            "upgraded cask{}: {}",
            suffix,
            join_names(&upgraded.casks)
        ));
    }
    Ok(())
}

fn status(args: &GlobalArgs) -> anyhow::Result<()> {
    let (_, state) = load_config_state(&args.config_path)?;
    for line in status_lines(&state) {
        println!("{}", line);
    }
    Ok(())
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

fn status_lines(state: &State) -> Vec<String> {
    let mut lines = vec![
        format!("last_check: {}", format_time(state.last_check_at)),
        format!("last_update: {}", format_time(state.last_update_at)),
    ];
    if !state.last_errors.is_empty() {
        lines.push("errors:".to_string());
        lines.extend(state.last_errors.iter().map(|e| format!("- {}", e)));
    }
    lines
}

fn set(
    args: &GlobalArgs,
    names: &[String],
    policy: Option<Policy>,
    interval_min: u32,
) -> anyhow::Result<()> {
    check_interval_flag(interval_min)?;
    let (mut config, _) = load_config_state(&args.config_path)?;
    let changed = apply_settings(&mut config, names, policy, interval_min);
    config.save(&args.config_path)?;
    args.say(format!("updated: {}", changed));
    Ok(())
}

/// Applies the given settings to every watched item named in `names`.
/// Returns the number of items touched.
fn apply_settings(
    config: &mut Config,
    names: &[String],
    policy: Option<Policy>,
    interval_min: u32,
) -> usize {
    let mut changed = 0;
    for item in config
        .watchlist
        .iter_mut()
        .filter(|w| names.contains(&w.name))
    {
        if let Some(policy) = policy {
            item.policy = Some(policy);
        }
        if interval_min > 0 {
            item.interval_min = interval_min;
        }
        changed += 1;
    }
    changed
}

async fn launchd_command(args: &GlobalArgs, action: LaunchdCommand) -> anyhow::Result<()> {
    let config_path = &args.config_path;
    match action {
        LaunchdCommand::Install {
            interval_sec,
            start_now,
        } => {
            if interval_sec != DEFAULT_TICK_INTERVAL_SEC {
                bail!("interval-sec fixed to {}", DEFAULT_TICK_INTERVAL_SEC);
            }
            load_config_state(config_path)?;
            let binary = std::env::current_exe().context("failed to locate the executable")?;
            let plist = launchd::install(&binary, config_path, start_now).await?;
            println!("installed: {}", plist.display());
        }
        LaunchdCommand::Uninstall => {
            launchd::uninstall().await?;
            println!("uninstalled");
        }
        LaunchdCommand::Status => {
            let running = launchd::status().await?;
            println!("running: {}", running);
        }
    }
    Ok(())
}
