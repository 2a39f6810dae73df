//! Reading the station name and line from the text on a station sign.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;

use crate::{capture::FALLBACK_LABEL, prelude::*};

/// Station numbers are three digits. The hundreds digit is the line.
///
/// Rust's `\b` is Unicode-aware, so `529공덕` would have no boundary between
/// the digits and the Hangul. We only require that no other ASCII
/// alphanumerics touch the number.
static STATION_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9A-Za-z_])([1-9][0-9]{2})(?:[^0-9A-Za-z_]|$)")
        .expect("failed to compile station number regex")
});

static HANGUL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[가-힣]+").expect("failed to compile Hangul regex"));

/// What we could work out about a station.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationGuess {
    /// Three-digit station number, if we saw one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_number: Option<u16>,
    /// Station name, without a trailing `역`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
    /// Line label, such as `5호선`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subway_line: Option<String>,
}

/// Find the first plausible station number.
fn station_number(text: &str) -> Option<(u16, usize)> {
    let caps = STATION_NUMBER_RE.captures(text)?;
    let m = caps.get(1)?;
    let number = m.as_str().parse::<u16>().ok()?;
    (100..=999).contains(&number).then_some((number, m.end()))
}

/// `529` → `5호선`.
pub fn line_from_number(number: u16) -> Option<String> {
    if !(100..=999).contains(&number) {
        return None;
    }
    Some(format!("{}호선", number / 100))
}

fn strip_station_suffix(name: &str) -> String {
    match name.strip_suffix('역') {
        Some(stripped) if stripped.chars().count() >= 2 => stripped.to_owned(),
        _ => name.to_owned(),
    }
}

/// Pick a Korean station name out of the text.
///
/// Hangul directly after the station number wins, joined together because
/// OCR often splits short names ("군 자"). Otherwise we take the first token
/// of 2 to 4 characters, or failing that the first of 2 to 5.
fn station_name(text: &str, number_end: Option<usize>) -> Option<String> {
    if let Some(end) = number_end {
        let joined = HANGUL_RE
            .find_iter(&text[end..])
            .take(3)
            .map(|m| m.as_str())
            .collect::<String>();
        let trimmed = joined.chars().take(6).collect::<String>();
        let cleaned = strip_station_suffix(&trimmed);
        let len = cleaned.chars().count();
        if (2..=5).contains(&len) {
            return Some(cleaned);
        }
    }

    let candidates = HANGUL_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|token| (2..=5).contains(&token.chars().count()))
        .collect::<Vec<_>>();
    let best = candidates
        .iter()
        .find(|token| token.chars().count() <= 4)
        .or_else(|| candidates.first())?;
    Some(strip_station_suffix(best))
}

/// Infer the station from sign text using the station number.
pub fn infer_station(text: &str) -> StationGuess {
    let text = text.trim();
    let number = station_number(text);
    StationGuess {
        station_number: number.map(|(n, _)| n),
        station_name: station_name(text, number.map(|(_, end)| end)),
        subway_line: number.and_then(|(n, _)| line_from_number(n)),
    }
}

/// Combine the text heuristic with the color heuristic.
///
/// A line from the station number is authoritative. The color line is only
/// a fallback. Anything still unknown becomes [`FALLBACK_LABEL`], and the
/// returned flag says the user should correct it.
pub fn resolve_station(
    from_text: &StationGuess,
    line_from_color: Option<&str>,
) -> (String, String, bool) {
    let line = from_text
        .subway_line
        .clone()
        .or_else(|| line_from_color.map(str::to_owned));
    let needs_correction = from_text.station_name.is_none() || line.is_none();
    (
        from_text
            .station_name
            .clone()
            .unwrap_or_else(|| FALLBACK_LABEL.to_owned()),
        line.unwrap_or_else(|| FALLBACK_LABEL.to_owned()),
        needs_correction,
    )
}
