//! Report documents: an exposure slide deck and a one-page analysis PDF.
//!
//! Both renderers take a [`ReportInput`] and tolerate missing pieces. No
//! analysis, no exposure or no photos just means fewer sections.

use schemars::JsonSchema;

use crate::{data_url::ImagePayload, exposure::ExposureResult, prelude::*};

pub mod deck;
pub mod pdf;

/// One point of the intraday traffic chart.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ChartPoint {
    /// Axis label, such as `08시`.
    pub label: String,
    /// Relative traffic. Only the ratio to the largest value matters.
    pub value: f64,
}

/// Headline numbers of an analysis.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetrics {
    /// Average daily riders at the station.
    pub daily_traffic: u64,
    /// Estimated viewers over the display period.
    pub total_exposure: u64,
    /// Who passes by, in a few words.
    pub demographic: String,
    /// The busiest time of day, such as `07:00 - 09:00`.
    pub peak_time: String,
    /// Overall placement score from 0 to 100.
    pub score: u32,
}

/// An AI-written (or derived) performance analysis.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    /// A few paragraphs of Korean prose.
    pub analysis_text: String,
    /// Headline numbers.
    pub metrics: AnalysisMetrics,
    /// Intraday traffic chart.
    #[serde(default)]
    pub chart_data: Vec<ChartPoint>,
}

/// Everything the renderers need.
#[derive(Clone, Debug, Default)]
pub struct ReportInput {
    /// Advertiser display name.
    pub advertiser_name: String,
    /// Station name.
    pub station: String,
    /// Line label.
    pub line: String,
    /// Report date, `YYYYMMDD`.
    pub date_str: String,
    /// Extra title text, usually the user-entered label.
    pub subtitle: Option<String>,
    /// Exposure estimate, if one was computed.
    pub exposure: Option<ExposureResult>,
    /// Analysis, if one was generated.
    pub analysis: Option<AiAnalysis>,
    /// Captured photos, in order.
    pub images: Vec<ImagePayload>,
    /// Contact shown on the closing slide.
    pub campaign_manager_name: Option<String>,
    /// Contact shown on the closing slide.
    pub campaign_manager_email: Option<String>,
}

/// Format a count the way Korean reports do: `1.2백만`, `3.4만`, `9,999`.
pub fn format_count(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}백만", n as f64 / 1_000_000.0)
    } else if n >= 10_000 {
        format!("{:.1}만", n as f64 / 10_000.0)
    } else {
        with_thousands_separators(n)
    }
}

fn with_thousands_separators(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `20240305` → `2024{sep}03{sep}05`. Anything else is returned unchanged.
pub fn format_date(date_str: &str, sep: &str) -> String {
    if date_str.len() == 8 && date_str.chars().all(|c| c.is_ascii_digit()) {
        format!(
            "{}{sep}{}{sep}{}",
            &date_str[..4],
            &date_str[4..6],
            &date_str[6..]
        )
    } else {
        date_str.to_owned()
    }
}

/// Escape text for XML content and attribute values.
pub(crate) fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters other than tab and newline are invalid XML.
            c if c.is_control() && c != '\t' && c != '\n' => {}
            c => out.push(c),
        }
    }
    out
}
