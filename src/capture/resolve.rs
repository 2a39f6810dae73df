//! Resolving a visit's photos into station, line, advertiser and filenames.

use chrono::Utc;
use schemars::JsonSchema;

use crate::{
    advertisers::AdvertiserRecord,
    data_url::ImagePayload,
    matching::{infer_station, line_from_image, match_advertiser, station::resolve_station},
    ocr::{OcrEngine, OcrError, OcrText},
    prelude::*,
};

use super::{
    FALLBACK_LABEL, RecognizedAdvertiser, StationVisit, date_str,
    filename::{NameParts, build_name},
};

/// Everything we need to name and report one visit. Derived, never stored.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitMeta {
    /// The visit this describes.
    pub visit_id: String,
    /// Station name, or [`FALLBACK_LABEL`].
    pub station_name: String,
    /// Line label, or [`FALLBACK_LABEL`].
    pub subway_line: String,
    /// Advertiser name, or [`FALLBACK_LABEL`].
    pub advertiser_name: String,
    /// Advertiser ID, if one was recognized.
    pub advertiser_id: Option<String>,
    /// Capture date, `YYYYMMDD`.
    pub date_str: String,
    /// One filename per ad photo.
    pub filenames: Vec<String>,
    /// The location step was skipped, so names omit station and line.
    pub skip_location: bool,
    /// Station or line could not be recognized and should be corrected.
    pub needs_correction: bool,
}

impl VisitMeta {
    /// Regenerate filenames from the current fields.
    pub fn rename(&mut self, photo_count: usize, user_label: Option<&str>) {
        let parts = NameParts {
            advertiser: &self.advertiser_name,
            line: (!self.skip_location).then_some(self.subway_line.as_str()),
            station: (!self.skip_location).then_some(self.station_name.as_str()),
            user_label,
            date_str: &self.date_str,
        };
        self.filenames = (1..=photo_count).map(|i| build_name(&parts, i)).collect();
    }

    /// Is the advertiser known?
    pub fn has_advertiser(&self) -> bool {
        self.advertiser_id.is_some()
    }
}

/// Run OCR, treating anything but a rate limit as "no text".
async fn ocr_or_empty(ocr: &dyn OcrEngine, data_url: &str) -> Result<OcrText, OcrError> {
    let image = match ImagePayload::from_data_url(data_url) {
        Ok(image) => image,
        Err(err) => {
            warn!("Skipping undecodable photo: {err:#}");
            return Ok(OcrText::empty());
        }
    };
    match ocr.recognize(&image).await {
        Ok(text) => Ok(text),
        Err(err @ OcrError::RateLimited { .. }) => Err(err),
        Err(err) => {
            warn!(engine = ocr.name(), "OCR failed: {err}");
            Ok(OcrText::empty())
        }
    }
}

/// Work out the station and line for a visit.
async fn resolve_location(
    visit: &StationVisit,
    ocr: &dyn OcrEngine,
) -> Result<(String, String, bool), OcrError> {
    // User corrections always win.
    if let (Some(station), Some(line)) = (&visit.station_name, &visit.subway_line) {
        return Ok((station.clone(), line.clone(), false));
    }
    let Some(location_image) = &visit.location_image else {
        let corrected = visit.station_name.is_some() || visit.subway_line.is_some();
        return Ok((
            visit
                .station_name
                .clone()
                .unwrap_or_else(|| FALLBACK_LABEL.to_owned()),
            visit
                .subway_line
                .clone()
                .unwrap_or_else(|| FALLBACK_LABEL.to_owned()),
            !visit.skip_location && !corrected,
        ));
    };

    let text = ocr_or_empty(ocr, location_image).await?;
    let guess = infer_station(text.station_text());
    let color_line = ImagePayload::from_data_url(location_image)
        .ok()
        .and_then(|image| line_from_image(&image.data));
    let (station, line, needs_correction) = resolve_station(&guess, color_line);
    Ok((
        visit.station_name.clone().unwrap_or(station),
        visit.subway_line.clone().unwrap_or(line),
        needs_correction,
    ))
}

/// Work out the advertiser for a visit from its ad photos.
async fn resolve_advertiser(
    visit: &StationVisit,
    ocr: &dyn OcrEngine,
    advertisers: &[AdvertiserRecord],
) -> Result<Option<RecognizedAdvertiser>, OcrError> {
    if let Some(advertiser) = &visit.recognized_advertiser {
        return Ok(Some(advertiser.clone()));
    }
    for item in &visit.ad_images {
        let text = ocr_or_empty(ocr, &item.image).await?;
        if let Some(found) = match_advertiser(&text.text, advertisers) {
            debug!(
                advertiser = %found.advertiser_id,
                confidence = found.confidence,
                "Recognized advertiser"
            );
            return Ok(Some(RecognizedAdvertiser {
                id: found.advertiser_id,
                name: found.advertiser_name,
            }));
        }
    }
    Ok(None)
}

/// Resolve one visit into [`VisitMeta`].
#[instrument(level = "debug", skip_all, fields(visit_id = %visit.visit_id))]
pub async fn resolve_visit(
    visit: &StationVisit,
    ocr: &dyn OcrEngine,
    advertisers: &[AdvertiserRecord],
    user_label: Option<&str>,
) -> Result<VisitMeta, OcrError> {
    let (station_name, subway_line, needs_correction) = resolve_location(visit, ocr).await?;
    let advertiser = resolve_advertiser(visit, ocr, advertisers).await?;
    let mut meta = VisitMeta {
        visit_id: visit.visit_id.clone(),
        station_name,
        subway_line,
        advertiser_name: advertiser
            .as_ref()
            .map_or_else(|| FALLBACK_LABEL.to_owned(), |a| a.name.clone()),
        advertiser_id: advertiser.map(|a| a.id),
        date_str: date_str(visit.first_captured_at().unwrap_or_else(Utc::now)),
        filenames: vec![],
        skip_location: visit.skip_location,
        needs_correction,
    };
    meta.rename(visit.ad_images.len(), user_label);
    Ok(meta)
}
