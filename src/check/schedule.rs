//! Per-item check scheduling

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::config::{DEFAULT_INTERVAL_MIN, WatchItem};
use crate::state::State;

/// Returns the items whose next check time has arrived, was never set, or
/// cannot be parsed. A zero interval is replaced with the default.
pub fn due_items(watchlist: &[WatchItem], state: &State, now: DateTime<Utc>) -> Vec<WatchItem> {
    watchlist
        .iter()
        .filter(|item| is_due(item, state, now))
        .cloned()
        .map(|mut item| {
            if item.interval_min == 0 {
                item.interval_min = DEFAULT_INTERVAL_MIN;
            }
            item
        })
        .collect()
}

fn is_due(item: &WatchItem, state: &State, now: DateTime<Utc>) -> bool {
    let Some(next) = state.next_check(item).filter(|s| !s.is_empty()) else {
        return true;
    };
    match DateTime::parse_from_rfc3339(next) {
        Ok(next) => now >= next.with_timezone(&Utc),
        Err(_) => true,
    }
}

/// Next check instant for `item`, formatted for the state file
pub fn next_check_after(item: &WatchItem, now: DateTime<Utc>) -> String {
    let interval = if item.interval_min == 0 {
        DEFAULT_INTERVAL_MIN
    } else {
        item.interval_min
    };
    (now + Duration::minutes(i64::from(interval))).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageKind;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn jq(interval_min: u32) -> WatchItem {
        let mut item = WatchItem::new("jq", PackageKind::Formula, now());
        item.interval_min = interval_min;
        item
    }

    #[rstest]
    #[case(None, true)] // never scheduled
    #[case(Some(""), true)]
    #[case(Some("not a time"), true)]
    #[case(Some("2024-06-01T11:59:59Z"), true)] // past
    #[case(Some("2024-06-01T12:00:00Z"), true)] // exactly now
    #[case(Some("2024-06-01T14:00:00+02:00"), true)] // same instant, other offset
    #[case(Some("2024-06-01T12:00:01Z"), false)] // future
    fn test_due_items(#[case] next: Option<&str>, #[case] expected: bool) {
        let mut state = State::default();
        if let Some(next) = next {
            state.next_check_at.insert("formula:jq".into(), next.into());
        }

        let due = due_items(&[jq(5)], &state, now());

        assert_eq!(!due.is_empty(), expected);
    }

    #[test]
    fn due_items_reads_legacy_bare_name_schedule() {
        let mut state = State::default();
        state
            .next_check_at
            .insert("jq".into(), "2024-06-01T13:00:00Z".into());

        assert!(due_items(&[jq(5)], &state, now()).is_empty());
    }

    #[test]
    fn due_items_replaces_zero_interval_with_default() {
        let due = due_items(&[jq(0)], &State::default(), now());
        assert_eq!(due[0].interval_min, DEFAULT_INTERVAL_MIN);
    }

    #[test]
    fn next_check_after_is_not_due_until_interval_elapses() {
        let item = jq(30);
        let mut state = State::default();
        state
            .next_check_at
            .insert(item.key(), next_check_after(&item, now()));

        assert_eq!(state.next_check_at["formula:jq"], "2024-06-01T12:30:00Z");
        assert!(due_items(&[item.clone()], &state, now() + Duration::minutes(29)).is_empty());
        assert_eq!(
            due_items(&[item], &state, now() + Duration::minutes(30)).len(),
            1
        );
    }
}
