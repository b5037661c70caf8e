//! Homebrew subprocess wrapper

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;

#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::PackageKind;

#[derive(Debug, Error)]
pub enum BrewError {
    #[error("brew not found")]
    NotFound,

    #[error("brew {args} failed: {status}: {stderr}")]
    CommandFailed {
        args: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Installed packages with their versions, by kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Installed {
    pub formulae: HashMap<String, String>,
    pub casks: HashMap<String, String>,
}

impl Installed {
    pub fn of_kind(&self, kind: PackageKind) -> &HashMap<String, String> {
        match kind {
            PackageKind::Formula => &self.formulae,
            PackageKind::Cask => &self.casks,
        }
    }

    /// Looks up an installed package. With no kind, formulae are tried before casks.
    pub fn find(&self, name: &str, kind: Option<PackageKind>) -> Option<(PackageKind, &str)> {
        let kinds: &[PackageKind] = match kind {
            Some(PackageKind::Formula) => &[PackageKind::Formula],
            Some(PackageKind::Cask) => &[PackageKind::Cask],
            None => &[PackageKind::Formula, PackageKind::Cask],
        };
        kinds.iter().find_map(|&kind| {
            self.of_kind(kind)
                .get(name)
                .map(|version| (kind, version.as_str()))
        })
    }
}

/// Capabilities of the package manager used by the check engine
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait PackageManager: Send + Sync {
    /// Lists installed names and versions, partitioned by kind
    async fn list_installed(&self) -> Result<Installed, BrewError>;

    /// Refreshes the package index (`brew update`)
    async fn update(&self) -> Result<(), BrewError>;

    /// Upgrades the given packages; a no-op for an empty list
    async fn upgrade(
        &self,
        kind: PackageKind,
        names: Vec<String>,
        greedy: bool,
    ) -> Result<(), BrewError>;

    /// Returns the subset of `names` the package manager itself reports as outdated
    async fn outdated(
        &self,
        kind: PackageKind,
        names: Vec<String>,
        greedy: bool,
    ) -> Result<Vec<String>, BrewError>;

    /// Whether another package manager process is already running
    async fn is_running(&self) -> Result<bool, BrewError>;
}

/// `brew` executable found on `PATH`
pub struct Homebrew {
    verbose: bool,
}

impl Homebrew {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn find_brew() -> Result<PathBuf, BrewError> {
        let cwd = std::env::current_dir().unwrap_or_default();
        find_brew_in(std::env::var_os("PATH"), &cwd)
    }

    async fn run(&self, args: &[String]) -> Result<String, BrewError> {
        let brew = Self::find_brew()?;
        debug!("Running brew {}", args.join(" "));
        let output = Command::new(&brew)
            .args(args)
            .output()
            .await
            .map_err(|source| BrewError::Io {
                program: brew.display().to_string(),
                source,
            })?;
        self.finish(args, output)
    }

    fn finish(&self, args: &[String], output: Output) -> Result<String, BrewError> {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(BrewError::CommandFailed {
                args: args.join(" "),
                status: output.status,
                stderr: stderr.trim().to_string(),
            });
        }
        if self.verbose && !stderr.trim().is_empty() {
            return Ok(format!("{}\n{}", stdout, stderr));
        }
        Ok(stdout)
    }

    /// Runs a side-effecting command, echoing its output in verbose mode
    async fn run_echo(&self, args: Vec<String>) -> Result<(), BrewError> {
        let out = self.run(&args).await?;
        if self.verbose && !out.is_empty() {
            print!("{}", out);
        }
        Ok(())
    }
}

fn args<const N: usize>(fixed: [&str; N]) -> Vec<String> {
    fixed.iter().map(|s| s.to_string()).collect()
}

#[async_trait::async_trait]
impl PackageManager for Homebrew {
    async fn list_installed(&self) -> Result<Installed, BrewError> {
        let formulae = self.run(&args(["list", "--versions"])).await?;
        let casks = self.run(&args(["list", "--cask", "--versions"])).await?;
        Ok(Installed {
            formulae: parse_versions(&formulae),
            casks: parse_versions(&casks),
        })
    }

    async fn update(&self) -> Result<(), BrewError> {
        info!("Refreshing package index");
        self.run_echo(args(["update"])).await
    }

    async fn upgrade(
        &self,
        kind: PackageKind,
        names: Vec<String>,
        greedy: bool,
    ) -> Result<(), BrewError> {
        if names.is_empty() {
            return Ok(());
        }
        info!("Upgrading {} {}: {}", names.len(), kind, names.join(", "));
        let mut cmd = args(["upgrade"]);
        if kind == PackageKind::Cask {
            cmd.push("--cask".to_string());
            if greedy {
                cmd.push("--greedy".to_string());
            }
        }
        cmd.extend(names);
        self.run_echo(cmd).await
    }

    async fn outdated(
        &self,
        kind: PackageKind,
        names: Vec<String>,
        greedy: bool,
    ) -> Result<Vec<String>, BrewError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = args(["outdated", "--quiet"]);
        match kind {
            PackageKind::Formula => cmd.push("--formula".to_string()),
            PackageKind::Cask => {
                cmd.push("--cask".to_string());
                if greedy {
                    cmd.push("--greedy".to_string());
                }
            }
        }
        cmd.extend(names);
        let out = self.run(&cmd).await?;
        Ok(parse_outdated(&out))
    }

    async fn is_running(&self) -> Result<bool, BrewError> {
        let output = Command::new("pgrep")
            .args(["-x", "brew"])
            .output()
            .await
            .map_err(|source| BrewError::Io {
                program: "pgrep".to_string(),
                source,
            })?;
        // pgrep exits non-zero when nothing matches
        Ok(output.status.success() && !String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}

/// Parses `brew list --versions` output: `<name> <version> [<older versions>...]`
fn parse_versions(out: &str) -> HashMap<String, String> {
    out.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let version = fields.next()?;
            Some((name.to_string(), version.to_string()))
        })
        .collect()
}

/// Parses `brew outdated --quiet` output: one name per line
/// First executable `brew` on the given search path
fn find_brew_in(paths: Option<OsString>, cwd: &Path) -> Result<PathBuf, BrewError> {
    which::which_in("brew", paths, cwd).map_err(|e| {
        debug!("brew lookup failed: {}", e);
        BrewError::NotFound
    })
}

fn parse_outdated(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
