use semver::Version;

/// Sentinel used by packages without a fixed version (rolling releases)
const LATEST_SENTINEL: &str = "latest";

/// Normalize a version string for structured comparison.
///
/// Trims whitespace, strips a leading `v`, and turns `_` and `,` into `.`.
///
/// Examples:
/// - "v1_2_3" -> "1.2.3"
/// - "1.2.3_1" -> "1.2.3.1"
pub fn normalize_version(version: &str) -> String {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    version.replace(['_', ','], ".")
}

/// Parse a version string into a semver::Version, normalizing partial versions.
///
/// Handles partial versions like "1" or "1.2" by padding with zeros, and
/// drops leading zeros from numeric parts as in date-based versions.
/// Does NOT strip 'v' prefix (use `normalize_version` first if needed).
///
/// Examples:
/// - "1" -> Version(1, 0, 0)
/// - "1.2" -> Version(1, 2, 0)
/// - "1.2.3" -> Version(1, 2, 3)
/// - "2024.07.16" -> Version(2024, 7, 16)
pub fn parse_version(version: &str) -> Option<Version> {
    let (core, rest) = match version.find(['-', '+']) {
        Some(idx) => version.split_at(idx),
        None => (version, ""),
    };
    let mut parts: Vec<&str> = core.split('.').map(trim_leading_zeros).collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

fn trim_leading_zeros(part: &str) -> &str {
    if part.len() < 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return part;
    }
    match part.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    }
}

fn is_latest_sentinel(version: &str) -> bool {
    version.trim().eq_ignore_ascii_case(LATEST_SENTINEL)
}

/// Decide whether `latest` warrants upgrading from `installed`.
///
/// A scheme bump (`scheme > prev_scheme`) means the upstream versioning
/// convention changed, so any difference counts. Otherwise both strings are
/// compared as semantic versions when they parse, and by plain inequality
/// when they don't.
pub fn is_outdated(installed: &str, latest: &str, scheme: i64, prev_scheme: i64) -> bool {
    if installed.is_empty() || latest.is_empty() {
        return false;
    }
    if is_latest_sentinel(installed) || is_latest_sentinel(latest) {
        return false;
    }
    if scheme > prev_scheme && installed != latest {
        return true;
    }

    let installed_norm = normalize_version(installed);
    let latest_norm = normalize_version(latest);
    match (parse_version(&installed_norm), parse_version(&latest_norm)) {
        (Some(installed), Some(latest)) => latest > installed,
        _ => installed != latest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("v1_2_3", "1.2.3")]
    #[case("1.2.3", "1.2.3")]
    #[case("  v2.0  ", "2.0")]
    #[case("1,2,3", "1.2.3")]
    #[case("1.2.3_1", "1.2.3.1")]
    fn test_normalize_version(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_version(input), expected);
    }

    #[test]
    fn normalize_version_is_idempotent() {
        let once = normalize_version("v1_2_3");
        assert_eq!(normalize_version(&once), once);
        assert_eq!(once, normalize_version("1.2.3"));
    }

    #[rstest]
    #[case("1", Some(Version::new(1, 0, 0)))]
    #[case("1.2", Some(Version::new(1, 2, 0)))]
    #[case("1.2.3", Some(Version::new(1, 2, 3)))]
    #[case("1.2-beta", Version::parse("1.2.0-beta").ok())]
    #[case("2021a", None)]
    #[case("1.2.3.4", None)]
    #[case("2024.07.16", Some(Version::new(2024, 7, 16)))]
    #[case("2024.07", Some(Version::new(2024, 7, 0)))]
    #[case("1.00.0", Some(Version::new(1, 0, 0)))]
    #[case("1.02-beta.1", Version::parse("1.2.0-beta.1").ok())]
    fn test_parse_version(#[case] input: &str, #[case] expected: Option<Version>) {
        assert_eq!(parse_version(input), expected);
    }

    #[rstest]
    #[case("1.2.0", "1.3.0", 0, 0, true)]
    #[case("1.3.0", "1.2.0", 0, 0, false)] // downgrade
    #[case("1.2.0", "1.2.0", 0, 0, false)] // same
    #[case("v1.2.0", "1.10.0", 0, 0, true)] // numeric, not lexical
    #[case("1.2_1", "1.2.1", 0, 0, false)] // revision suffix normalizes to equal
    #[case("1.2.3", "1.2.3_1", 0, 0, true)] // unparseable, strings differ
    #[case("", "1.0.0", 0, 0, false)] // missing installed
    #[case("1.0.0", "", 0, 0, false)] // missing latest
    #[case("latest", "2.0.0", 0, 0, false)]
    #[case("2.0.0", "LATEST", 0, 0, false)]
    #[case("latest", "2.0.0", 5, 0, false)] // sentinel wins over scheme bump
    #[case("2021a", "2021b", 1, 0, true)] // scheme bump shortcut
    #[case("2.0.0", "1.0.0", 1, 0, true)] // scheme bump ignores ordering
    #[case("1.0.0", "1.0.0", 1, 0, false)] // scheme bump but identical
    #[case("2021a", "2021b", 0, 0, true)] // unparseable fallback
    #[case("2021a", "2021a", 0, 0, false)]
    #[case("2.0.0", "1.0.0", 0, 1, false)] // scheme went down: numeric compare
    #[case("2024.07.01", "2024.07.16", 0, 0, true)]
    #[case("2024.07.16", "2024.07.01", 0, 0, false)] // zero-padded downgrade
    #[case("2024.07.16", "2024.7.16", 0, 0, false)] // padding only
    fn test_is_outdated(
        #[case] installed: &str,
        #[case] latest: &str,
        #[case] scheme: i64,
        #[case] prev_scheme: i64,
        #[case] expected: bool,
    ) {
        assert_eq!(is_outdated(installed, latest, scheme, prev_scheme), expected);
    }
}
