//! Field capture: station visits, their photos, and the session that
//! accumulates them before a report is sent.

use chrono::{DateTime, FixedOffset, Utc};
use schemars::JsonSchema;
use thiserror::Error;
use uuid::Uuid;

use crate::prelude::*;

pub mod archive;
pub mod filename;
pub mod resolve;
pub mod session;

pub use session::{CaptureAction, CaptureSession};

/// The most ad photos a single visit may hold.
pub const MAX_AD_IMAGES: usize = 10;

/// The most visits (completed plus current) a session may hold.
pub const MAX_VISITS: usize = 10;

/// GPS fixes older than this are not trusted.
pub const GPS_MAX_AGE_SECS: i64 = 30;

/// Label used for a station or line we could not recognize.
pub const FALLBACK_LABEL: &str = "미인식";

/// Korea Standard Time. Dates in filenames and reports use local time.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("UTC+9 is a valid offset")
}

/// Format a timestamp as `YYYYMMDD` in local time.
pub fn date_str(at: DateTime<Utc>) -> String {
    at.with_timezone(&kst()).format("%Y%m%d").to_string()
}

/// Errors from the capture session reducer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// A visit already holds [`MAX_AD_IMAGES`] photos.
    #[error("a visit can hold at most {MAX_AD_IMAGES} ad photos")]
    TooManyAdImages,

    /// The session already holds [`MAX_VISITS`] visits.
    #[error("a session can hold at most {MAX_VISITS} station visits")]
    TooManyVisits,

    /// The current visit needs a location photo (or skip) and an ad photo.
    #[error("the current visit needs a location photo (or skip) and at least one ad photo")]
    IncompleteVisit,

    /// No visit with this ID exists.
    #[error("no visit with ID {0:?}")]
    UnknownVisit(String),

    /// No ad photo at this index.
    #[error("no ad photo at index {index} in visit {visit_id:?}")]
    UnknownAdImage {
        /// The visit we looked in.
        visit_id: String,
        /// The missing index.
        index: usize,
    },

    /// The GPS fix was too old to use.
    #[error("GPS fix is {age_secs}s old (limit {GPS_MAX_AGE_SECS}s)")]
    StaleGps {
        /// How old the fix was.
        age_secs: i64,
    },
}

/// One advertisement photo.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdCaptureItem {
    /// The photo, as a `data:` URL.
    pub image: String,
    /// When the photo was taken.
    pub captured_at: DateTime<Utc>,
}

/// A GPS position.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsFix {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Accuracy radius in meters, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// When the position was measured.
    pub taken_at: DateTime<Utc>,
}

impl GpsFix {
    /// Can we still trust this fix at `now`?
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.taken_at).num_seconds() <= GPS_MAX_AGE_SECS
    }
}

/// An advertiser recognized from an ad photo.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizedAdvertiser {
    /// Advertiser ID.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Everything captured at one station.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationVisit {
    /// Opaque ID, generated when the visit is created.
    pub visit_id: String,
    /// Photo of the station sign, as a `data:` URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_image: Option<String>,
    /// When the location photo was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_captured_at: Option<DateTime<Utc>>,
    /// The location step was deliberately skipped.
    #[serde(default)]
    pub skip_location: bool,
    /// Ad photos, in capture order.
    #[serde(default)]
    pub ad_images: Vec<AdCaptureItem>,
    /// Where the visit happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsFix>,
    /// Resolved or user-corrected station name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
    /// Resolved or user-corrected line, such as `5호선`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subway_line: Option<String>,
    /// Advertiser recognized from the ad photos.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognized_advertiser: Option<RecognizedAdvertiser>,
}

impl StationVisit {
    /// Start a new, empty visit.
    pub fn new() -> Self {
        Self {
            visit_id: Uuid::new_v4().to_string(),
            location_image: None,
            location_captured_at: None,
            skip_location: false,
            ad_images: vec![],
            gps: None,
            station_name: None,
            subway_line: None,
            recognized_advertiser: None,
        }
    }

    /// A visit is complete once it has a location (or an explicit skip) and
    /// at least one ad photo.
    pub fn is_complete(&self) -> bool {
        (self.location_image.is_some() || self.skip_location) && !self.ad_images.is_empty()
    }

    /// Has anything been captured yet?
    pub fn has_data(&self) -> bool {
        self.location_image.is_some() || self.skip_location || !self.ad_images.is_empty()
    }

    /// The time of the first photo in this visit, used to date the report.
    pub fn first_captured_at(&self) -> Option<DateTime<Utc>> {
        self.ad_images
            .first()
            .map(|item| item.captured_at)
            .or(self.location_captured_at)
    }
}

impl Default for StationVisit {
    fn default() -> Self {
        Self::new()
    }
}
