//! Cross-run memory: last seen versions, schemes, freshness tokens, and schedule

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::config::{ConfigError, MAX_RECORDED_ERRORS, WatchItem, write_json};

/// Persisted state, keyed by watch item key (`kind:name`).
///
/// Entries written before the kind was tracked are keyed by the bare name;
/// [`State::migrate_legacy_keys`] moves them forward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_versions: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_schemes: BTreeMap<String, i64>,
    /// Freshness tokens keyed by request URL
    #[serde(default, deserialize_with = "null_as_default")]
    pub etag_cache: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_errors: Vec<String>,
    /// Next scheduled check per item, RFC 3339
    #[serde(default, deserialize_with = "null_as_default")]
    pub next_check_at: BTreeMap<String, String>,
}

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

impl State {
    /// Loads state, returning an empty state when the file is missing or empty.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(&data).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(path, self)
    }

    /// Appends to the error ring, dropping the oldest entries past the cap.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_errors.push(message.into());
        if self.last_errors.len() > MAX_RECORDED_ERRORS {
            let excess = self.last_errors.len() - MAX_RECORDED_ERRORS;
            self.last_errors.drain(..excess);
        }
    }

    pub fn last_version(&self, item: &WatchItem) -> Option<&String> {
        lookup(&self.last_versions, item)
    }

    pub fn last_scheme(&self, item: &WatchItem) -> Option<i64> {
        lookup(&self.last_schemes, item).copied()
    }

    pub fn next_check(&self, item: &WatchItem) -> Option<&String> {
        lookup(&self.next_check_at, item)
    }

    /// Drops every per-item entry for `item`, under both key forms.
    pub fn forget(&mut self, item: &WatchItem) {
        for key in [item.key(), item.name.clone()] {
            self.next_check_at.remove(&key);
            self.last_versions.remove(&key);
            self.last_schemes.remove(&key);
        }
    }

    /// Copies entries filed under a bare name to the item's composite key, then
    /// removes the bare entry. Existing composite entries are never overwritten,
    /// and a bare name that is itself the key of a watched item is left alone.
    pub fn migrate_legacy_keys(&mut self, watchlist: &[WatchItem]) {
        let own_keys: HashSet<String> = watchlist.iter().map(WatchItem::key).collect();
        let mut migrated = Vec::new();

        for item in watchlist {
            let key = item.key();
            if key == item.name {
                continue;
            }
            let mut moved = false;
            moved |= carry_forward(&mut self.next_check_at, &item.name, &key);
            moved |= carry_forward(&mut self.last_versions, &item.name, &key);
            moved |= carry_forward(&mut self.last_schemes, &item.name, &key);
            if moved {
                debug!(from = %item.name, to = %key, "Migrated legacy state key");
            }
            migrated.push(item.name.clone());
        }

        for name in migrated.iter().filter(|name| !own_keys.contains(*name)) {
            self.next_check_at.remove(name);
            self.last_versions.remove(name);
            self.last_schemes.remove(name);
        }
    }

    /// Removes per-item entries that belong to no watched item (by either key form).
    pub fn retain_watched(&mut self, watchlist: &[WatchItem]) {
        let watched: HashSet<String> = watchlist
            .iter()
            .flat_map(|item| [item.key(), item.name.clone()])
            .collect();

        let before = self.next_check_at.len() + self.last_versions.len() + self.last_schemes.len();
        self.next_check_at.retain(|key, _| watched.contains(key));
        self.last_versions.retain(|key, _| watched.contains(key));
        self.last_schemes.retain(|key, _| watched.contains(key));
        let after = self.next_check_at.len() + self.last_versions.len() + self.last_schemes.len();
        if before != after {
            debug!("Dropped {} orphaned state entries", before - after);
        }
    }
}

fn lookup<'a, V>(map: &'a BTreeMap<String, V>, item: &WatchItem) -> Option<&'a V> {
    map.get(&item.key()).or_else(|| map.get(&item.name))
}

fn carry_forward<V: Clone>(map: &mut BTreeMap<String, V>, from: &str, to: &str) -> bool {
    if map.contains_key(to) {
        return false;
    }
    match map.get(from).cloned() {
        Some(value) => {
            map.insert(to.to_string(), value);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageKind;
    use chrono::TimeZone;

    fn item(name: &str, kind: Option<PackageKind>) -> WatchItem {
        WatchItem {
            name: name.to_string(),
            kind,
            policy: None,
            interval_min: 5,
            added_at: Some(Utc.timestamp_opt(0, 0).unwrap()),
        }
    }

    #[test]
    fn load_substitutes_empty_maps_for_null_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"last_versions": null, "last_schemes": null, "etag_cache": null, "last_errors": null}"#,
        )
        .unwrap();

        let state = State::load(&path).unwrap();

        assert_eq!(state, State::default());
    }

    #[test]
    fn load_fails_on_malformed_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            State::load(&path),
            Err(ConfigError::Json { .. })
        ));
    }

    #[test]
    fn record_error_keeps_only_most_recent_entries() {
        let mut state = State::default();
        for i in 0..25 {
            state.record_error(format!("error {i}"));
        }

        assert_eq!(state.last_errors.len(), MAX_RECORDED_ERRORS);
        assert_eq!(state.last_errors.first().unwrap(), "error 5");
        assert_eq!(state.last_errors.last().unwrap(), "error 24");
    }

    #[test]
    fn migrate_legacy_keys_moves_bare_entries_to_composite_key() {
        let mut state = State::default();
        state.last_versions.insert("jq".into(), "1.7".into());
        state.last_schemes.insert("jq".into(), 0);
        state
            .next_check_at
            .insert("jq".into(), "2024-01-01T00:00:00Z".into());

        state.migrate_legacy_keys(&[item("jq", Some(PackageKind::Formula))]);

        assert_eq!(state.last_versions.get("formula:jq").unwrap(), "1.7");
        assert_eq!(state.last_schemes.get("formula:jq"), Some(&0));
        assert!(state.next_check_at.contains_key("formula:jq"));
        assert!(!state.last_versions.contains_key("jq"));
        assert!(!state.next_check_at.contains_key("jq"));
    }

    #[test]
    fn migrate_legacy_keys_never_overwrites_composite_entry() {
        let mut state = State::default();
        state.last_versions.insert("jq".into(), "1.6".into());
        state.last_versions.insert("formula:jq".into(), "1.7".into());

        state.migrate_legacy_keys(&[item("jq", Some(PackageKind::Formula))]);

        assert_eq!(state.last_versions.get("formula:jq").unwrap(), "1.7");
    }

    #[test]
    fn migrate_legacy_keys_keeps_bare_key_owned_by_kindless_item() {
        let mut state = State::default();
        state.last_versions.insert("jq".into(), "1.7".into());

        state.migrate_legacy_keys(&[item("jq", Some(PackageKind::Formula)), item("jq", None)]);

        assert_eq!(state.last_versions.get("formula:jq").unwrap(), "1.7");
        assert_eq!(state.last_versions.get("jq").unwrap(), "1.7");
    }

    #[test]
    fn retain_watched_drops_orphans_but_keeps_both_key_forms() {
        let mut state = State::default();
        state.last_versions.insert("formula:jq".into(), "1.7".into());
        state.last_versions.insert("jq".into(), "1.7".into());
        state.last_versions.insert("cask:gone".into(), "2.0".into());
        state.last_schemes.insert("gone".into(), 1);
        state
            .etag_cache
            .insert("https://example.invalid/gone.json".into(), "\"x\"".into());

        state.retain_watched(&[item("jq", Some(PackageKind::Formula))]);

        assert!(state.last_versions.contains_key("formula:jq"));
        assert!(state.last_versions.contains_key("jq"));
        assert!(!state.last_versions.contains_key("cask:gone"));
        assert!(state.last_schemes.is_empty());
        assert_eq!(state.etag_cache.len(), 1);
    }

    #[test]
    fn lookups_fall_back_to_bare_name() {
        let mut state = State::default();
        state.last_versions.insert("jq".into(), "1.7".into());
        state.last_schemes.insert("formula:jq".into(), 2);

        let jq = item("jq", Some(PackageKind::Formula));

        assert_eq!(state.last_version(&jq).unwrap(), "1.7");
        assert_eq!(state.last_scheme(&jq), Some(2));
        assert_eq!(state.next_check(&jq), None);
    }

    #[test]
    fn forget_removes_both_key_forms() {
        let mut state = State::default();
        state.next_check_at.insert("jq".into(), "x".into());
        state.next_check_at.insert("formula:jq".into(), "x".into());

        state.forget(&item("jq", Some(PackageKind::Formula)));

        assert!(state.next_check_at.is_empty());
    }
}
