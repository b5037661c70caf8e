//! In-memory package manager

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use brew_updater::brew::{BrewError, Installed, PackageManager};
use brew_updater::config::PackageKind;

/// Package manager double that records every mutating call
#[derive(Default)]
pub struct FakeBrew {
    installed: Installed,
    outdated: HashSet<String>,
    failing_upgrades: HashSet<PackageKind>,
    calls: Mutex<Vec<String>>,
}

impl FakeBrew {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_formula(mut self, name: &str, version: &str) -> Self {
        self.installed
            .formulae
            .insert(name.to_string(), version.to_string());
        self
    }

    pub fn with_cask(mut self, name: &str, version: &str) -> Self {
        self.installed
            .casks
            .insert(name.to_string(), version.to_string());
        self
    }

    /// Marks `name` as outdated from brew's point of view
    pub fn with_outdated(mut self, name: &str) -> Self {
        self.outdated.insert(name.to_string());
        self
    }

    pub fn with_failing_upgrade(mut self, kind: PackageKind) -> Self {
        self.failing_upgrades.insert(kind);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PackageManager for FakeBrew {
    async fn list_installed(&self) -> Result<Installed, BrewError> {
        Ok(self.installed.clone())
    }

    async fn update(&self) -> Result<(), BrewError> {
        self.record("update".to_string());
        Ok(())
    }

    async fn upgrade(
        &self,
        kind: PackageKind,
        names: Vec<String>,
        greedy: bool,
    ) -> Result<(), BrewError> {
        let greedy = if greedy { " --greedy" } else { "" };
        self.record(format!("upgrade {} {}{}", kind, names.join(" "), greedy));
        if self.failing_upgrades.contains(&kind) {
            return Err(BrewError::NotFound);
        }
        Ok(())
    }

    async fn outdated(
        &self,
        kind: PackageKind,
        names: Vec<String>,
        _greedy: bool,
    ) -> Result<Vec<String>, BrewError> {
        self.record(format!("outdated {} {}", kind, names.join(" ")));
        Ok(names
            .into_iter()
            .filter(|name| self.outdated.contains(name))
            .collect())
    }

    async fn is_running(&self) -> Result<bool, BrewError> {
        Ok(false)
    }
}

