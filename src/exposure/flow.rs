//! Station foot-traffic data, its normalization, and the mock dataset.

use std::{collections::BTreeMap, sync::LazyLock};

use chrono::Utc;
use regex::Regex;
use schemars::JsonSchema;

use crate::{capture::kst, prelude::*};

/// Where flow data came from.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowSourceKind {
    /// The public data API.
    Api,
    /// Built-in estimates, used when the API is unavailable.
    Mock,
}

/// Average daily foot traffic in one time band.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBandFlow {
    /// Time band label, such as `07-09`.
    pub band: String,
    /// Riders in this band.
    pub flow: u64,
}

/// Foot traffic for one station on one line.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationFlowData {
    /// Normalized station name.
    pub station_name: String,
    /// Line label, such as `5호선`.
    pub line_name: String,
    /// Average daily riders across all bands.
    pub daily_total: u64,
    /// Per-band breakdown, in time order.
    #[serde(default)]
    pub time_bands: Vec<TimeBandFlow>,
    /// The day the data describes, `YYYY-MM-DD`.
    #[serde(default)]
    pub data_date: Option<String>,
    /// Where this came from.
    pub source: FlowSourceKind,
}

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile whitespace regex"));

static PARENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*").expect("failed to compile parens regex"));

static NUMBERED_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)호선$").expect("failed to compile line regex"));

/// Collapse whitespace and drop parenthesized suffixes: `"공덕 (마포)"` → `"공덕"`.
pub fn normalize_station_name(name: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(name, " ");
    PARENS_RE.replace_all(&collapsed, "").trim().to_owned()
}

/// `"5호선"` → `"5"`. Named lines are kept as-is.
pub fn normalize_line_name(line: &str) -> String {
    let trimmed = line.trim();
    match NUMBERED_LINE_RE.captures(trimmed) {
        Some(caps) => caps[1].to_owned(),
        None => trimmed.to_owned(),
    }
}

/// A display label for a line: `"5"` → `"5호선"`.
pub fn line_label(line: &str) -> String {
    if line.contains("호선") {
        line.trim().to_owned()
    } else {
        format!("{}호선", normalize_line_name(line))
    }
}

/// Cache key for a station and line.
pub fn cache_key(station: &str, line: &str) -> String {
    format!(
        "{}|{}",
        normalize_station_name(station),
        normalize_line_name(line)
    )
}

/// Bucket an hour string (`"07"`, `"0730"`) into a 3-hour band (`"06-09"`).
pub fn time_to_band(time: &str) -> String {
    let hour = time
        .trim()
        .get(..2)
        .or(Some(time.trim()))
        .and_then(|h| h.parse::<u32>().ok());
    match hour {
        Some(hour) if hour < 24 => {
            let start = hour / 3 * 3;
            format!("{:02}-{:02}", start, (start + 3).min(24))
        }
        _ => "00-24".to_owned(),
    }
}

/// Parse a count that may be a number or a string with thousands separators.
fn count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or_default(),
        Some(Value::String(s)) => s.replace(',', "").trim().parse().unwrap_or_default(),
        _ => 0,
    }
}

/// The first present field among `keys`.
fn field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| item.get(*key).filter(|v| !v.is_null()))
}

/// Aggregate raw API records into daily totals and 3-hour bands.
///
/// Each record contributes its combined riders if given, otherwise
/// boarding plus alighting.
pub fn aggregate(items: &[Value], station: &str, line: &str, data_date: &str) -> StationFlowData {
    let mut bands = BTreeMap::<String, u64>::new();
    let mut total = 0u64;
    for item in items {
        let boarding = count(field(item, &["승차인원", "brdngNmpr"]));
        let alighting = count(field(item, &["하차인원", "lndngNmpr"]));
        let combined = count(field(item, &["승하차인원"]));
        let flow = if combined > 0 {
            combined
        } else {
            boarding + alighting
        };
        let time = match field(item, &["통행시간", "trnsTm"]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "00".to_owned(),
        };
        *bands.entry(time_to_band(&time)).or_default() += flow;
        total += flow;
    }
    StationFlowData {
        station_name: normalize_station_name(station),
        line_name: line_label(line),
        daily_total: total.max(1),
        time_bands: bands
            .into_iter()
            .map(|(band, flow)| TimeBandFlow { band, flow })
            .collect(),
        data_date: Some(data_date.to_owned()),
        source: FlowSourceKind::Api,
    }
}

/// Baseline daily riders, in units of 10,000, by normalized line.
fn mock_base(line: &str) -> u64 {
    match line {
        "1" => 12,
        "2" => 18,
        "3" => 8,
        "4" => 10,
        "5" => 9,
        "6" => 6,
        "7" => 8,
        "8" => 4,
        "9" => 3,
        "경의중앙" => 5,
        "공항" => 4,
        _ => 8,
    }
}

/// Share of daily riders in each band, skewed toward commute hours.
const MOCK_BANDS: [(&str, f64); 6] = [
    ("07-09", 0.25),
    ("09-12", 0.20),
    ("12-14", 0.15),
    ("14-17", 0.15),
    ("17-20", 0.20),
    ("20-23", 0.05),
];

/// Deterministic stand-in data, so reports never block on the API.
pub fn mock_flow(station: &str, line: &str) -> StationFlowData {
    let line = normalize_line_name(line);
    let daily_total = mock_base(&line) * 10_000;
    StationFlowData {
        station_name: normalize_station_name(station),
        line_name: format!("{line}호선"),
        daily_total,
        time_bands: MOCK_BANDS
            .iter()
            .map(|(band, share)| TimeBandFlow {
                band: (*band).to_owned(),
                flow: (daily_total as f64 * share).round() as u64,
            })
            .collect(),
        data_date: Some(Utc::now().with_timezone(&kst()).format("%Y-%m-%d").to_string()),
        source: FlowSourceKind::Mock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_station_name("  공덕 (마포구청)  "), "공덕");
        assert_eq!(normalize_station_name("서울  역"), "서울 역");
        assert_eq!(normalize_line_name(" 5호선 "), "5");
        assert_eq!(normalize_line_name("경의중앙"), "경의중앙");
        assert_eq!(line_label("5"), "5호선");
        assert_eq!(line_label("2호선"), "2호선");
        assert_eq!(cache_key("공덕(마포)", "5호선"), "공덕|5");
    }

    #[test]
    fn test_time_to_band() {
        assert_eq!(time_to_band("07"), "06-09");
        assert_eq!(time_to_band("0730"), "06-09");
        assert_eq!(time_to_band("23"), "21-24");
        assert_eq!(time_to_band("5"), "03-06");
        assert_eq!(time_to_band("xx"), "00-24");
    }

    #[test]
    fn test_aggregate() {
        let items = vec![
            json!({ "역명": "공덕", "통행시간": "07", "승차인원": "1,200", "하차인원": 800 }),
            json!({ "stnNm": "공덕", "trnsTm": "08", "brdngNmpr": 500, "lndngNmpr": "500" }),
            json!({ "역명": "공덕", "통행시간": "18", "승하차인원": 3000, "승차인원": 1 }),
        ];
        let flow = aggregate(&items, "공덕 (마포)", "5", "2024-03-04");
        assert_eq!(flow.station_name, "공덕");
        assert_eq!(flow.line_name, "5호선");
        assert_eq!(flow.daily_total, 6000);
        assert_eq!(
            flow.time_bands,
            vec![
                TimeBandFlow { band: "06-09".to_owned(), flow: 3000 },
                TimeBandFlow { band: "18-21".to_owned(), flow: 3000 },
            ]
        );
        assert_eq!(flow.source, FlowSourceKind::Api);
    }

    #[test]
    fn test_mock_flow() {
        let flow = mock_flow("강남", "2호선");
        assert_eq!(flow.daily_total, 180_000);
        assert_eq!(flow.line_name, "2호선");
        assert_eq!(flow.time_bands.len(), 6);
        assert_eq!(flow.time_bands[0].flow, 45_000);
        assert_eq!(mock_flow("어딘가", "신분당").daily_total, 80_000);
        // Deterministic apart from the date.
        assert_eq!(mock_flow("a", "1").time_bands, mock_flow("a", "1").time_bands);
    }
}
