//! Check engine test utilities

#![allow(dead_code)]

mod brew;
mod notify;

pub use brew::FakeBrew;
pub use notify::{RecordingNotifier, Sent};

use chrono::{DateTime, TimeZone, Utc};

use brew_updater::config::{Config, PackageKind, Policy, WatchItem};

/// Fixed clock reading shared by the scenarios
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn watched(name: &str, kind: PackageKind, policy: Option<Policy>) -> WatchItem {
    let mut item = WatchItem::new(name, kind, now());
    item.policy = policy;
    item
}

pub fn config_with(watchlist: Vec<WatchItem>) -> Config {
    Config {
        watchlist,
        ..Config::default()
    }
}
