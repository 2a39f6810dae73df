//! The `session` subcommand.
//!
//! Each invocation loads the session file, applies one reducer action and
//! saves it again. Reducer rejections leave the file untouched.

use chrono::Utc;
use clap::{Args, Subcommand};

use crate::{
    capture::{
        AdCaptureItem, GpsFix,
        session::{CaptureAction, CaptureSession},
    },
    data_url::ImagePayload,
    io::{read_json_or_toml, write_json, write_json_file},
    prelude::*,
};

/// Default session file.
pub const DEFAULT_SESSION_PATH: &str = "capture-session.json";

/// Options shared by commands that read a session file.
#[derive(Args, Clone, Debug)]
pub struct SessionFileOpts {
    /// The capture session file. Created on first use.
    #[clap(long = "session", env = "ADMATE_SESSION", default_value = DEFAULT_SESSION_PATH)]
    pub session_path: PathBuf,
}

impl SessionFileOpts {
    /// Load the session, or start a new one if the file does not exist.
    pub async fn load(&self) -> Result<CaptureSession> {
        if tokio::fs::try_exists(&self.session_path)
            .await
            .with_context(|| format!("Cannot check {:?}", self.session_path))?
        {
            read_json_or_toml(&self.session_path).await
        } else {
            Ok(CaptureSession::new())
        }
    }

    /// Save the session.
    pub async fn save(&self, session: &CaptureSession) -> Result<()> {
        write_json_file(&self.session_path, session).await
    }
}

/// Session command line arguments.
#[derive(Args, Debug)]
pub struct SessionOpts {
    #[command(flatten)]
    pub file: SessionFileOpts,

    #[command(subcommand)]
    pub action: SessionCmd,
}

/// Session actions.
#[derive(Debug, Subcommand)]
pub enum SessionCmd {
    /// Set the location photo of the current visit.
    AddLocation {
        /// The photo of the station sign.
        image: PathBuf,
    },
    /// Skip the location photo for the current visit.
    SkipLocation {
        /// Undo a previous skip.
        #[clap(long)]
        undo: bool,
    },
    /// Add ad photos to the current visit.
    AddAd {
        /// One or more photos.
        #[clap(required = true)]
        images: Vec<PathBuf>,
    },
    /// Remove one ad photo from a visit.
    RemoveAd {
        visit_id: String,
        /// Zero-based photo index.
        index: usize,
    },
    /// Record a GPS fix for the current visit.
    Gps {
        #[clap(long, allow_hyphen_values = true)]
        lat: f64,
        #[clap(long, allow_hyphen_values = true)]
        lng: f64,
        /// Accuracy radius in meters.
        #[clap(long)]
        accuracy: Option<f64>,
    },
    /// Finish the current visit and move to the next station.
    Next,
    /// Drop a visit.
    RemoveVisit { visit_id: String },
    /// Correct the station and line of a visit.
    Override {
        visit_id: String,
        #[clap(long)]
        station: Option<String>,
        #[clap(long)]
        line: Option<String>,
    },
    /// Print a summary of the session.
    Status,
    /// Discard everything.
    Reset,
}

/// What `status` prints for each visit.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VisitStatus<'a> {
    visit_id: &'a str,
    has_location_image: bool,
    skip_location: bool,
    ad_images: usize,
    station_name: Option<&'a str>,
    subway_line: Option<&'a str>,
    complete: bool,
}

/// What `status` prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus<'a> {
    current_visit_id: &'a str,
    station_count: usize,
    ad_image_count: usize,
    ready: bool,
    visits: Vec<VisitStatus<'a>>,
}

fn status(session: &CaptureSession) -> SessionStatus<'_> {
    SessionStatus {
        current_visit_id: &session.current_visit.visit_id,
        station_count: session.total_station_count(),
        ad_image_count: session.total_ad_image_count(),
        ready: session.is_ready(),
        visits: session
            .all_visits()
            .into_iter()
            .map(|visit| VisitStatus {
                visit_id: &visit.visit_id,
                has_location_image: visit.location_image.is_some(),
                skip_location: visit.skip_location,
                ad_images: visit.ad_images.len(),
                station_name: visit.station_name.as_deref(),
                subway_line: visit.subway_line.as_deref(),
                complete: visit.is_complete(),
            })
            .collect(),
    }
}

/// Turn a command into reducer actions, loading any photos it names.
async fn actions_for(cmd: &SessionCmd) -> Result<Vec<CaptureAction>> {
    let now = Utc::now();
    Ok(match cmd {
        SessionCmd::AddLocation { image } => vec![CaptureAction::SetLocationImage {
            image: ImagePayload::from_path(image).await?.to_data_url(),
            captured_at: now,
        }],
        SessionCmd::SkipLocation { undo } => {
            vec![CaptureAction::SetSkipLocation { skip: !undo }]
        }
        SessionCmd::AddAd { images } => {
            let mut actions = Vec::with_capacity(images.len());
            for path in images {
                actions.push(CaptureAction::AddAdImage {
                    item: AdCaptureItem {
                        image: ImagePayload::from_path(path).await?.to_data_url(),
                        captured_at: now,
                    },
                });
            }
            actions
        }
        SessionCmd::RemoveAd { visit_id, index } => vec![CaptureAction::RemoveAdImage {
            visit_id: visit_id.clone(),
            index: *index,
        }],
        SessionCmd::Gps { lat, lng, accuracy } => vec![CaptureAction::SetGps {
            fix: GpsFix {
                lat: *lat,
                lng: *lng,
                accuracy: *accuracy,
                taken_at: now,
            },
        }],
        SessionCmd::Next => vec![CaptureAction::PushVisit],
        SessionCmd::RemoveVisit { visit_id } => vec![CaptureAction::RemoveVisit {
            visit_id: visit_id.clone(),
        }],
        SessionCmd::Override {
            visit_id,
            station,
            line,
        } => vec![CaptureAction::SetStationOverride {
            visit_id: visit_id.clone(),
            station: station.clone(),
            line: line.clone(),
        }],
        SessionCmd::Reset => vec![CaptureAction::Reset],
        SessionCmd::Status => vec![],
    })
}

/// The `session` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_session(opts: &SessionOpts) -> Result<()> {
    let mut session = opts.file.load().await?;
    let actions = actions_for(&opts.action).await?;
    if !actions.is_empty() {
        // Apply to a copy so a rejected photo in a batch changes nothing.
        let mut updated = session.clone();
        for action in actions {
            updated.apply(action)?;
        }
        session = updated;
        opts.file.save(&session).await?;
        debug!(path = ?opts.file.session_path, "Saved session");
    }
    write_json(None, &status(&session)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;

    fn opts(dir: &tempfile::TempDir) -> SessionFileOpts {
        SessionFileOpts {
            session_path: dir.path().join("session.json"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = opts(&dir);
        let mut session = file.load().await.unwrap();
        assert_eq!(session.total_station_count(), 0);

        session
            .apply(CaptureAction::SetSkipLocation { skip: true })
            .unwrap();
        file.save(&session).await.unwrap();
        assert_eq!(file.load().await.unwrap(), session);
    }

    #[tokio::test]
    async fn test_status_summary() {
        let mut session = CaptureSession::new();
        session
            .apply(CaptureAction::SetSkipLocation { skip: true })
            .unwrap();
        for action in actions_for(&SessionCmd::Gps {
            lat: 37.54,
            lng: 126.95,
            accuracy: None,
        })
        .await
        .unwrap()
        {
            session.apply(action).unwrap();
        }
        // Only a skip and a GPS fix: incomplete.
        assert_eq!(
            session.apply(CaptureAction::PushVisit),
            Err(CaptureError::IncompleteVisit)
        );
        let summary = serde_json::to_value(status(&session)).unwrap();
        assert_eq!(summary["stationCount"], 1);
        assert_eq!(summary["ready"], false);
        assert_eq!(summary["visits"][0]["skipLocation"], true);
    }

    #[tokio::test]
    async fn test_add_ad_reads_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ad.png");
        let mut png = Vec::new();
        image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        tokio::fs::write(&path, png).await.unwrap();

        let actions = actions_for(&SessionCmd::AddAd {
            images: vec![path.clone(), path],
        })
        .await
        .unwrap();
        assert_eq!(actions.len(), 2);
        match &actions[0] {
            CaptureAction::AddAdImage { item } => {
                assert!(item.image.starts_with("data:image/png;base64,"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
