//! Names for exported photos and archives.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::kst;

/// Longest allowed component, in characters.
const MAX_COMPONENT_CHARS: usize = 80;

/// Characters that are illegal in filenames on at least one platform.
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile whitespace regex"));

/// Clean up a free-text component for use in a filename.
pub fn sanitize_component(raw: &str) -> String {
    let stripped = raw.replace(FORBIDDEN, "");
    let collapsed = WHITESPACE_RE.replace_all(stripped.trim(), " ");
    let truncated = collapsed
        .chars()
        .take(MAX_COMPONENT_CHARS)
        .collect::<String>();
    let truncated = truncated.trim();
    if truncated.is_empty() {
        "unknown".to_owned()
    } else {
        truncated.to_owned()
    }
}

/// Normalize a date to `YYYYMMDD`.
fn sanitize_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() == 8 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed.to_owned();
    }
    let digits = trimmed
        .chars()
        .filter(char::is_ascii_digit)
        .take(8)
        .collect::<String>();
    if digits.len() == 8 {
        digits
    } else {
        "00000000".to_owned()
    }
}

/// The components of a photo filename.
#[derive(Clone, Debug, Default)]
pub struct NameParts<'a> {
    /// Advertiser display name.
    pub advertiser: &'a str,
    /// Subway line. `None` for visits that skipped the location step.
    pub line: Option<&'a str>,
    /// Station name. `None` for visits that skipped the location step.
    pub station: Option<&'a str>,
    /// Optional label typed by the user.
    pub user_label: Option<&'a str>,
    /// Capture date, `YYYYMMDD`.
    pub date_str: &'a str,
}

/// Build the filename for the `index`th (1-based) photo.
///
/// `advertiser_line_station[_label]_YYYYMMDD_NN.jpg`, or
/// `advertiser[_label]_YYYYMMDD_NN.jpg` when the location was skipped.
pub fn build_name(parts: &NameParts<'_>, index: usize) -> String {
    let mut components = vec![sanitize_component(parts.advertiser)];
    if let (Some(line), Some(station)) = (parts.line, parts.station) {
        components.push(sanitize_component(line));
        components.push(sanitize_component(station));
    }
    if let Some(label) = parts.user_label.filter(|l| !l.trim().is_empty()) {
        components.push(sanitize_component(label));
    }
    components.push(sanitize_date(parts.date_str));
    components.push(format!("{:02}", index.clamp(1, 99)));
    format!("{}.jpg", components.join("_"))
}

/// Name for the photo archive sent with a report.
pub fn zip_name(advertiser: &str, at: DateTime<Utc>) -> String {
    let local = at.with_timezone(&kst());
    format!(
        "{}_촬영_{}.zip",
        sanitize_component(advertiser),
        local.format("%Y%m%d_%H%M")
    )
}

/// Folder grouping one visit's photos inside a multi-visit archive.
pub fn visit_folder(station: &str, line: &str) -> String {
    format!("{}_{}", sanitize_component(station), sanitize_component(line))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn test_build_name() {
        let parts = NameParts {
            advertiser: "SSG.COM",
            line: Some("5호선"),
            station: Some("공덕"),
            user_label: Some("  출구 3  "),
            date_str: "20240305",
        };
        assert_eq!(build_name(&parts, 1), "SSG.COM_5호선_공덕_출구 3_20240305_01.jpg");
        // Same inputs, same output.
        assert_eq!(build_name(&parts, 1), build_name(&parts, 1));
        assert_eq!(build_name(&parts, 0), build_name(&parts, 1));
        assert!(build_name(&parts, 250).ends_with("_99.jpg"));
    }

    #[test]
    fn test_skipped_location_omits_line_and_station() {
        let parts = NameParts {
            advertiser: "이마트",
            line: None,
            station: None,
            user_label: None,
            date_str: "2024-03-05",
        };
        assert_eq!(build_name(&parts, 3), "이마트_20240305_03.jpg");
    }

    #[test]
    fn test_sanitization() {
        let parts = NameParts {
            advertiser: r#"a/b\c:d*e?f"g<h>i|j"#,
            line: Some("***"),
            station: Some("강  남"),
            user_label: None,
            date_str: "bad",
        };
        let name = build_name(&parts, 2);
        assert_eq!(name, "abcdefghij_unknown_강 남_00000000_02.jpg");
        assert!(!name.contains(FORBIDDEN));
        assert_eq!(sanitize_component(&"가".repeat(100)).chars().count(), 80);
    }

    #[test]
    fn test_zip_name() {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 23, 7, 0).unwrap();
        assert_eq!(zip_name("SSG", at), "SSG_촬영_20240305_0807.zip");
        assert_eq!(visit_folder("공덕", "5호선"), "공덕_5호선");
    }
}
