//! Estimating how many people saw an advertisement.

use schemars::JsonSchema;

use crate::prelude::*;

pub mod cache;
pub mod flow;
pub mod public_data;

pub use flow::{StationFlowData, TimeBandFlow};
pub use public_data::StationFlowService;

/// Display period used when the caller doesn't give one.
pub const DEFAULT_DISPLAY_DAYS: u32 = 7;

/// Exposure within one time band.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandExposure {
    /// Time band label, such as `07-09`.
    pub band: String,
    /// Estimated viewers in this band over the display period.
    pub exposure: u64,
}

/// Estimated viewers over a display period.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureResult {
    /// `round(daily_flow × display_days × weight)`.
    pub total_exposure: u64,
    /// Average daily foot traffic.
    pub daily_flow: u64,
    /// How long the ad is displayed.
    pub display_days: u32,
    /// The multiplier used.
    pub weight: f64,
    /// Exposure per time band, in time order. Empty if the flow data had no
    /// breakdown.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_time_band: Vec<BandExposure>,
}

impl ExposureResult {
    /// Bands with the most exposure first, so the peak is always first.
    pub fn bands_by_exposure(&self) -> Vec<BandExposure> {
        let mut bands = self.by_time_band.clone();
        bands.sort_by(|a, b| b.exposure.cmp(&a.exposure));
        bands
    }

    /// The band with the most exposure.
    pub fn peak_band(&self) -> Option<&BandExposure> {
        // `max_by_key` returns the last maximum; we want the earliest band.
        self.by_time_band
            .iter()
            .rev()
            .max_by_key(|band| band.exposure)
    }
}

fn scaled(value: u64, display_days: u32, weight: f64) -> u64 {
    (value as f64 * f64::from(display_days) * weight).round().max(0.0) as u64
}

/// Project exposure from daily flow.
///
/// `weight` is a tunable multiplier, not a probability. Values above 1 are
/// allowed and amplify the estimate.
pub fn estimate(flow: &StationFlowData, display_days: u32, weight: f64) -> ExposureResult {
    ExposureResult {
        total_exposure: scaled(flow.daily_total, display_days, weight),
        daily_flow: flow.daily_total,
        display_days,
        weight,
        by_time_band: flow
            .time_bands
            .iter()
            .map(|band| BandExposure {
                band: band.band.clone(),
                exposure: scaled(band.flow, display_days, weight),
            })
            .collect(),
    }
}

/// Treat a missing or zero display period as the default.
pub fn display_days_or_default(display_days: Option<u32>) -> u32 {
    match display_days {
        Some(days) if days > 0 => days,
        _ => DEFAULT_DISPLAY_DAYS,
    }
}
