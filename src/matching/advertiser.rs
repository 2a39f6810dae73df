//! Matching OCR text against registered advertisers' search terms.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;

use crate::{advertisers::AdvertiserRecord, prelude::*};

/// Matches below this confidence are treated as noise.
const MIN_CONFIDENCE: f64 = 0.3;

/// Lets one full-length term reach confidence 1.
const HEADROOM: f64 = 1.2;

/// Confidence floor once a term of at least two characters matched.
const MULTI_CHAR_FLOOR: f64 = 0.5;

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile whitespace regex"));

/// Collapse whitespace, trim and lowercase.
pub fn normalize(raw: &str) -> String {
    WHITESPACE_RE
        .replace_all(raw, " ")
        .trim()
        .to_lowercase()
}

/// Lowercase with all whitespace removed.
fn compact(raw: &str) -> String {
    WHITESPACE_RE.replace_all(raw, "").to_lowercase()
}

/// A successful advertiser match.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiserMatch {
    /// Matched advertiser ID.
    pub advertiser_id: String,
    /// Matched advertiser's display name.
    pub advertiser_name: String,
    /// Between 0.3 and 1.
    pub confidence: f64,
    /// Another advertiser scored exactly as well. Worth a manual check.
    #[serde(default)]
    pub ambiguous: bool,
}

/// One search term in both normalized forms.
struct Term {
    normalized: String,
    compact: String,
}

impl Term {
    fn new(raw: &str) -> Option<Self> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return None;
        }
        Some(Self {
            compact: compact(raw),
            normalized,
        })
    }

    fn len(&self) -> usize {
        self.normalized.chars().count()
    }
}

/// An advertiser's search terms, plus its display name if not already listed.
fn terms_for(advertiser: &AdvertiserRecord) -> Vec<Term> {
    let mut terms: Vec<Term> = vec![];
    let candidates = advertiser
        .search_terms
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(advertiser.name.as_str()));
    for raw in candidates {
        if let Some(term) = Term::new(raw)
            && !terms.iter().any(|t| t.normalized == term.normalized)
        {
            terms.push(term);
        }
    }
    terms
}

/// Per-advertiser scoring.
#[derive(Debug)]
struct Score<'a> {
    advertiser: &'a AdvertiserRecord,
    /// Sum of matched term lengths.
    total: usize,
    /// Longest matched term.
    longest_matched: usize,
    /// Longest term this advertiser has, matched or not.
    longest_term: usize,
}

impl Score<'_> {
    /// Does this score beat `other`? Higher totals win, then longer matched
    /// terms. Otherwise the earlier advertiser keeps its place.
    fn beats(&self, other: &Score<'_>) -> bool {
        (self.total, self.longest_matched) > (other.total, other.longest_matched)
    }

    fn ties(&self, other: &Score<'_>) -> bool {
        (self.total, self.longest_matched) == (other.total, other.longest_matched)
    }

    fn confidence(&self) -> f64 {
        let ratio = self.total as f64 / self.longest_term.max(1) as f64;
        let mut confidence = (ratio * HEADROOM).min(1.0);
        if self.longest_matched >= 2 {
            confidence = confidence.max(MULTI_CHAR_FLOOR);
        }
        confidence
    }
}

/// Find the registered advertiser whose search terms best explain `ocr_text`.
///
/// Returns `None` for empty text or when the best match is too weak. We never
/// fall back to a default advertiser.
pub fn match_advertiser(
    ocr_text: &str,
    advertisers: &[AdvertiserRecord],
) -> Option<AdvertiserMatch> {
    let text = normalize(ocr_text);
    if text.is_empty() {
        return None;
    }
    let text_compact = compact(ocr_text);

    let mut best: Option<Score<'_>> = None;
    let mut ambiguous = false;
    for advertiser in advertisers {
        let terms = terms_for(advertiser);
        let mut score = Score {
            advertiser,
            total: 0,
            longest_matched: 0,
            longest_term: terms
                .iter()
                .map(|t| t.len().max(t.compact.chars().count()))
                .max()
                .unwrap_or(1),
        };
        for term in &terms {
            if text.contains(&term.normalized) || text_compact.contains(&term.compact) {
                score.total += term.len();
                score.longest_matched = score.longest_matched.max(term.len());
            }
        }
        if score.total == 0 {
            continue;
        }
        match &best {
            Some(current) if score.beats(current) => {
                ambiguous = false;
                best = Some(score);
            }
            Some(current) if score.ties(current) => ambiguous = true,
            Some(_) => {}
            None => best = Some(score),
        }
    }

    let best = best?;
    let confidence = best.confidence();
    trace!(
        advertiser = %best.advertiser.id,
        total = best.total,
        confidence,
        "Best advertiser candidate"
    );
    if confidence < MIN_CONFIDENCE {
        return None;
    }
    if ambiguous {
        warn!(advertiser = %best.advertiser.id, "Ambiguous advertiser match");
    }
    Some(AdvertiserMatch {
        advertiser_id: best.advertiser.id.clone(),
        advertiser_name: best.advertiser.name.clone(),
        confidence,
        ambiguous,
    })
}
