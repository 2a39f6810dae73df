//! The capture session, as an explicit state object driven by a reducer.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::prelude::*;

use super::{
    AdCaptureItem, CaptureError, GpsFix, MAX_AD_IMAGES, MAX_VISITS, RecognizedAdvertiser,
    StationVisit,
};

/// One current visit plus the visits already finished.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    /// The visit being captured right now.
    pub current_visit: StationVisit,
    /// Visits finished by starting the next station.
    #[serde(default)]
    pub completed_visits: Vec<StationVisit>,
}

/// A state transition for [`CaptureSession`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CaptureAction {
    /// Set (or replace) the current visit's location photo.
    #[serde(rename_all = "camelCase")]
    SetLocationImage {
        image: String,
        captured_at: DateTime<Utc>,
    },
    /// Mark the current visit's location step as skipped (or not).
    SetSkipLocation { skip: bool },
    /// Append an ad photo to the current visit.
    AddAdImage { item: AdCaptureItem },
    /// Remove an ad photo from any visit.
    #[serde(rename_all = "camelCase")]
    RemoveAdImage { visit_id: String, index: usize },
    /// Record the advertiser recognized for the current visit.
    SetRecognizedAdvertiser {
        advertiser: Option<RecognizedAdvertiser>,
    },
    /// Attach a GPS fix to the current visit.
    SetGps { fix: GpsFix },
    /// User-corrected station and line for any visit.
    #[serde(rename_all = "camelCase")]
    SetStationOverride {
        visit_id: String,
        station: Option<String>,
        line: Option<String>,
    },
    /// Finish the current visit and start the next station.
    PushVisit,
    /// Drop a visit entirely.
    #[serde(rename_all = "camelCase")]
    RemoveVisit { visit_id: String },
    /// Clear everything.
    Reset,
}

impl CaptureSession {
    /// Start an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an action using the current time.
    pub fn apply(&mut self, action: CaptureAction) -> Result<(), CaptureError> {
        self.apply_at(action, Utc::now())
    }

    /// Apply an action. On error, the session is left unchanged.
    pub fn apply_at(
        &mut self,
        action: CaptureAction,
        now: DateTime<Utc>,
    ) -> Result<(), CaptureError> {
        match action {
            CaptureAction::SetLocationImage { image, captured_at } => {
                self.current_visit.location_image = Some(image);
                self.current_visit.location_captured_at = Some(captured_at);
                self.current_visit.skip_location = false;
            }
            CaptureAction::SetSkipLocation { skip } => {
                self.current_visit.skip_location = skip;
                if skip {
                    self.current_visit.location_image = None;
                    self.current_visit.location_captured_at = None;
                }
            }
            CaptureAction::AddAdImage { item } => {
                if self.current_visit.ad_images.len() >= MAX_AD_IMAGES {
                    return Err(CaptureError::TooManyAdImages);
                }
                self.current_visit.ad_images.push(item);
            }
            CaptureAction::RemoveAdImage { visit_id, index } => {
                let visit = self.visit_mut(&visit_id)?;
                if index >= visit.ad_images.len() {
                    return Err(CaptureError::UnknownAdImage { visit_id, index });
                }
                visit.ad_images.remove(index);
            }
            CaptureAction::SetRecognizedAdvertiser { advertiser } => {
                self.current_visit.recognized_advertiser = advertiser;
            }
            CaptureAction::SetGps { fix } => {
                if !fix.is_fresh(now) {
                    return Err(CaptureError::StaleGps {
                        age_secs: (now - fix.taken_at).num_seconds(),
                    });
                }
                self.current_visit.gps = Some(fix);
            }
            CaptureAction::SetStationOverride {
                visit_id,
                station,
                line,
            } => {
                let visit = self.visit_mut(&visit_id)?;
                visit.station_name = station;
                visit.subway_line = line;
            }
            CaptureAction::PushVisit => {
                if !self.current_visit.is_complete() {
                    return Err(CaptureError::IncompleteVisit);
                }
                // The new current visit counts toward the limit too.
                if self.completed_visits.len() + 2 > MAX_VISITS {
                    return Err(CaptureError::TooManyVisits);
                }
                let finished = std::mem::take(&mut self.current_visit);
                self.completed_visits.push(finished);
            }
            CaptureAction::RemoveVisit { visit_id } => {
                if self.current_visit.visit_id == visit_id {
                    self.current_visit = StationVisit::new();
                } else {
                    let before = self.completed_visits.len();
                    self.completed_visits.retain(|v| v.visit_id != visit_id);
                    if self.completed_visits.len() == before {
                        return Err(CaptureError::UnknownVisit(visit_id));
                    }
                }
            }
            CaptureAction::Reset => {
                *self = Self::new();
            }
        }
        Ok(())
    }

    fn visit_mut(&mut self, visit_id: &str) -> Result<&mut StationVisit, CaptureError> {
        if self.current_visit.visit_id == visit_id {
            return Ok(&mut self.current_visit);
        }
        self.completed_visits
            .iter_mut()
            .find(|v| v.visit_id == visit_id)
            .ok_or_else(|| CaptureError::UnknownVisit(visit_id.to_owned()))
    }

    /// Completed visits, plus the current one if anything was captured.
    pub fn all_visits(&self) -> Vec<&StationVisit> {
        let mut visits = self.completed_visits.iter().collect::<Vec<_>>();
        if self.current_visit.has_data() {
            visits.push(&self.current_visit);
        }
        visits
    }

    /// How many stations this session covers.
    pub fn total_station_count(&self) -> usize {
        self.all_visits().len()
    }

    /// How many ad photos across all visits.
    pub fn total_ad_image_count(&self) -> usize {
        self.all_visits().iter().map(|v| v.ad_images.len()).sum()
    }

    /// Is every visit ready to be sent?
    pub fn is_ready(&self) -> bool {
        let visits = self.all_visits();
        !visits.is_empty() && visits.iter().all(|v| v.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn ad(n: u8) -> CaptureAction {
        CaptureAction::AddAdImage {
            item: AdCaptureItem {
                image: format!("data:image/jpeg;base64,{n:02}"),
                captured_at: Utc::now(),
            },
        }
    }

    fn complete_current(session: &mut CaptureSession) {
        session
            .apply(CaptureAction::SetSkipLocation { skip: true })
            .unwrap();
        session.apply(ad(1)).unwrap();
    }

    #[test]
    fn test_eleventh_ad_image_is_rejected() {
        let mut session = CaptureSession::new();
        for n in 0..10 {
            session.apply(ad(n)).unwrap();
        }
        assert_eq!(session.apply(ad(10)), Err(CaptureError::TooManyAdImages));
        assert_eq!(session.current_visit.ad_images.len(), 10);
    }

    #[test]
    fn test_push_requires_complete_visit() {
        let mut session = CaptureSession::new();
        session.apply(ad(1)).unwrap();
        assert_eq!(
            session.apply(CaptureAction::PushVisit),
            Err(CaptureError::IncompleteVisit)
        );

        session
            .apply(CaptureAction::SetLocationImage {
                image: "data:image/jpeg;base64,AA==".to_owned(),
                captured_at: Utc::now(),
            })
            .unwrap();
        session.apply(CaptureAction::PushVisit).unwrap();
        assert_eq!(session.completed_visits.len(), 1);
        assert!(!session.current_visit.has_data());
        assert_eq!(session.total_station_count(), 1);
        assert_eq!(session.total_ad_image_count(), 1);
    }

    #[test]
    fn test_visit_limit() {
        let mut session = CaptureSession::new();
        for _ in 0..9 {
            complete_current(&mut session);
            session.apply(CaptureAction::PushVisit).unwrap();
        }
        complete_current(&mut session);
        assert_eq!(session.total_station_count(), 10);
        assert_eq!(
            session.apply(CaptureAction::PushVisit),
            Err(CaptureError::TooManyVisits)
        );
        assert_eq!(session.total_station_count(), 10);
    }

    #[test]
    fn test_remove_ad_image_and_visit() {
        let mut session = CaptureSession::new();
        complete_current(&mut session);
        session.apply(ad(2)).unwrap();
        let first_id = session.current_visit.visit_id.clone();
        session.apply(CaptureAction::PushVisit).unwrap();

        session
            .apply(CaptureAction::RemoveAdImage {
                visit_id: first_id.clone(),
                index: 0,
            })
            .unwrap();
        assert_eq!(session.completed_visits[0].ad_images.len(), 1);
        assert!(matches!(
            session.apply(CaptureAction::RemoveAdImage {
                visit_id: first_id.clone(),
                index: 5,
            }),
            Err(CaptureError::UnknownAdImage { .. })
        ));

        session
            .apply(CaptureAction::RemoveVisit { visit_id: first_id.clone() })
            .unwrap();
        assert!(session.completed_visits.is_empty());
        assert_eq!(
            session.apply(CaptureAction::RemoveVisit {
                visit_id: first_id.clone()
            }),
            Err(CaptureError::UnknownVisit(first_id))
        );
    }

    #[test]
    fn test_stale_gps_is_rejected() {
        let mut session = CaptureSession::new();
        let now = Utc::now();
        let stale = GpsFix {
            lat: 37.54,
            lng: 126.95,
            accuracy: Some(12.0),
            taken_at: now - Duration::seconds(31),
        };
        assert!(matches!(
            session.apply_at(CaptureAction::SetGps { fix: stale }, now),
            Err(CaptureError::StaleGps { age_secs: 31 })
        ));

        let fresh = GpsFix {
            lat: 37.54,
            lng: 126.95,
            accuracy: None,
            taken_at: now - Duration::seconds(5),
        };
        session
            .apply_at(CaptureAction::SetGps { fix: fresh.clone() }, now)
            .unwrap();
        assert_eq!(session.current_visit.gps, Some(fresh));
    }

    #[test]
    fn test_station_override_and_reset() {
        let mut session = CaptureSession::new();
        complete_current(&mut session);
        let id = session.current_visit.visit_id.clone();
        session
            .apply(CaptureAction::SetStationOverride {
                visit_id: id,
                station: Some("공덕".to_owned()),
                line: Some("5호선".to_owned()),
            })
            .unwrap();
        assert_eq!(session.current_visit.station_name.as_deref(), Some("공덕"));

        session.apply(CaptureAction::Reset).unwrap();
        assert_eq!(session.total_station_count(), 0);
    }

    #[test]
    fn test_session_json_round_trip() {
        let mut session = CaptureSession::new();
        complete_current(&mut session);
        let json = serde_json::to_string(&session).unwrap();
        let parsed: CaptureSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, session);

        let action: CaptureAction =
            serde_json::from_value(json!({ "type": "setSkipLocation", "skip": true }))
                .unwrap();
        assert_eq!(action, CaptureAction::SetSkipLocation { skip: true });
    }
}
