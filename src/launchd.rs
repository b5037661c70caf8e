//! launchd agent that runs `check` on a fixed tick

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::DEFAULT_TICK_INTERVAL_SEC;

pub const LABEL: &str = "dev.brew-updater";

const LAUNCHCTL: &str = "/bin/launchctl";

#[derive(Debug, Error)]
pub enum LaunchdError {
    #[error("could not determine the home directory")]
    NoHomeDir,

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("launchctl {action} failed: {detail}")]
    Launchctl { action: String, detail: String },
}

/// Agent plist and log locations under a home directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    pub plist: PathBuf,
    pub log: PathBuf,
}

impl AgentPaths {
    pub fn for_home(home: &Path) -> Self {
        Self {
            plist: home
                .join("Library/LaunchAgents")
                .join(format!("{}.plist", LABEL)),
            log: home.join("Library/Logs/brew-updater.log"),
        }
    }

    pub fn current() -> Result<Self, LaunchdError> {
        dirs::home_dir()
            .map(|home| Self::for_home(&home))
            .ok_or(LaunchdError::NoHomeDir)
    }
}

/// Writes the agent plist and loads it; returns the plist path
pub async fn install(
    binary: &Path,
    config_path: &Path,
    start_now: bool,
) -> Result<PathBuf, LaunchdError> {
    let paths = AgentPaths::current()?;
    for dir in [paths.plist.parent(), paths.log.parent()].into_iter().flatten() {
        std::fs::create_dir_all(dir).map_err(|source| LaunchdError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let plist = render_plist(binary, config_path, &paths.log, start_now);
    std::fs::write(&paths.plist, plist).map_err(|source| LaunchdError::Io {
        path: paths.plist.clone(),
        source,
    })?;

    bootstrap(&paths.plist).await?;
    Ok(paths.plist)
}

pub async fn uninstall() -> Result<(), LaunchdError> {
    let paths = AgentPaths::current()?;
    bootout(&paths.plist).await;
    std::fs::remove_file(&paths.plist).map_err(|source| LaunchdError::Io {
        path: paths.plist.clone(),
        source,
    })
}

/// Whether the agent is currently loaded
pub async fn status() -> Result<bool, LaunchdError> {
    let output = Command::new(LAUNCHCTL)
        .arg("list")
        .output()
        .await
        .map_err(|source| LaunchdError::Io {
            path: PathBuf::from(LAUNCHCTL),
            source,
        })?;
    if !output.status.success() {
        return Err(LaunchdError::Launchctl {
            action: "list".to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).contains(LABEL))
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn render_plist(binary: &Path, config_path: &Path, log_path: &Path, start_now: bool) -> String {
    let run_at_load = if start_now {
        "<key>RunAtLoad</key>\n  <true/>\n  "
    } else {
        ""
    };
    let binary = escape_xml(&binary.display().to_string());
    let config = escape_xml(&config_path.display().to_string());
    let log = escape_xml(&log_path.display().to_string());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{LABEL}</string>
  <key>ProgramArguments</key>
  <array>
    <string>{binary}</string>
    <string>check</string>
    <string>--config</string>
    <string>{config}</string>
  </array>
  {run_at_load}<key>StartInterval</key>
  <integer>{DEFAULT_TICK_INTERVAL_SEC}</integer>
  <key>StandardOutPath</key>
  <string>{log}</string>
  <key>StandardErrorPath</key>
  <string>{log}</string>
  <key>LowPriorityBackgroundIO</key>
  <true/>
  <key>LowPriorityIO</key>
  <true/>
  <key>ProcessType</key>
  <string>Background</string>
</dict>
</plist>
"#
    )
}

fn gui_domain() -> String {
    // SAFETY: getuid has no preconditions and cannot fail
    let uid = unsafe { libc::getuid() };
    format!("gui/{}", uid)
}

async fn bootstrap(plist: &Path) -> Result<(), LaunchdError> {
    let output = Command::new(LAUNCHCTL)
        .arg("bootstrap")
        .arg(gui_domain())
        .arg(plist)
        .output()
        .await;
    let detail = match output {
        Ok(out) if out.status.success() => None,
        Ok(out) => Some(String::from_utf8_lossy(&out.stderr).trim().to_string()),
        Err(e) => Some(e.to_string()),
    };

    if let Some(detail) = detail {
        debug!("launchctl bootstrap failed ({}), falling back to load", detail);
        let loaded = Command::new(LAUNCHCTL)
            .arg("load")
            .arg(plist)
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !loaded {
            return Err(LaunchdError::Launchctl {
                action: "bootstrap".to_string(),
                detail,
            });
        }
    }
    // Give launchd a moment to pick the agent up
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

async fn bootout(plist: &Path) {
    let result = Command::new(LAUNCHCTL)
        .arg("bootout")
        .arg(gui_domain())
        .arg(plist)
        .status()
        .await;
    if let Err(e) = result {
        warn!("launchctl bootout failed: {}", e);
    }
}
