//! Report dispatch: exposure, documents, narrative, persistence and email.
//!
//! Stages run in order, and each one degrades on its own. A missing deck or
//! a failed narrative still sends the photos. Only advertiser validation,
//! persistence and the narrative timeout stop a dispatch, and the timeout
//! parks the upload so the caller can retry without re-sending photos.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use chrono::Utc;
use dashmap::DashMap;
use schemars::JsonSchema;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    advertisers::{AdvertiserDirectory, AdvertiserRecord},
    capture::{
        FALLBACK_LABEL,
        archive::extract_images,
        date_str,
        filename::{sanitize_component, zip_name},
    },
    exposure::{StationFlowService, display_days_or_default, estimate},
    prelude::*,
    report::{
        AiAnalysis, ReportInput,
        deck::{DeckRenderer, DeckTemplate},
        pdf::render_pdf,
    },
};

use self::{
    email::{
        Attachment, BodyDetails, DEFAULT_FROM_EMAIL, EmailEnvelope, Mailer, PrimaryRecipient,
        SenderNameOption, body, recipients, subject,
    },
    narrative::{NarrativeGenerator, NarrativeRequest, OfflineNarrative},
    store::{DeliveryAttempt, ReportRecord, ReportStore},
};

pub mod email;
pub mod narrative;
pub mod store;

/// Default AI narrative timeout.
pub const DEFAULT_NARRATIVE_TIMEOUT: Duration = Duration::from_secs(180);

/// How long a timed-out upload stays available for a retry.
pub const RETRY_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// A request to send a report.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReportRequest {
    /// Required. Requests without it are rejected.
    pub advertiser_id: Option<String>,
    /// Display name override.
    pub advertiser_name: Option<String>,
    pub primary_recipient: PrimaryRecipient,
    pub sender_name_option: SenderNameOption,
    pub station: Option<String>,
    pub line: Option<String>,
    /// Free-text label for this report, such as a panel number.
    pub user_entered_name: Option<String>,
    /// Number of photos, if the caller counted them.
    pub image_count: Option<u32>,
    /// Report date, `YYYYMMDD`. Defaults to today.
    pub date_str: Option<String>,
    /// The photo archive. Required unless `retry_token` is given.
    pub zip_base64: Option<String>,
    pub zip_filename: Option<String>,
    /// Attach an exposure slide deck.
    pub include_ppt: bool,
    /// Display period for exposure estimates, in days.
    pub display_days: Option<u32>,
    /// Send without an AI analysis (and so without the analysis PDF).
    pub skip_ai_analysis: bool,
    /// Name of the logged-in user, for the email greeting.
    pub login_user_name: Option<String>,
    /// Reuse the archive from a request that hit the narrative timeout.
    pub retry_token: Option<String>,
}

/// The result of a dispatch.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The report was saved, even if sending failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_to_history: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    /// Send this back to retry after `AI_ANALYSIS_TIMEOUT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_token: Option<String>,
}

/// Reasons a dispatch stops.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("an advertiser is required to send a report")]
    MissingAdvertiser,

    #[error("unknown advertiser {0:?}")]
    UnknownAdvertiser(String),

    #[error("advertiser {0:?} has no address for the selected recipient")]
    NoRecipient(String),

    #[error("invalid photo archive: {0}")]
    InvalidArchive(String),

    #[error("retry token is unknown or expired")]
    UnknownRetryToken,

    #[error("AI analysis timed out")]
    NarrativeTimeout {
        /// Resubmit with this to reuse the uploaded photos.
        retry_token: String,
    },

    #[error("no report with ID {0:?}")]
    UnknownReport(String),

    #[error("could not save report: {0:#}")]
    Persistence(anyhow::Error),
}

impl DispatchError {
    /// Stable error code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::MissingAdvertiser => "ADVERTISER_REQUIRED",
            DispatchError::UnknownAdvertiser(_) => "ADVERTISER_NOT_FOUND",
            DispatchError::NoRecipient(_) => "NO_RECIPIENT",
            DispatchError::InvalidArchive(_) => "INVALID_ZIP",
            DispatchError::UnknownRetryToken => "RETRY_TOKEN_EXPIRED",
            DispatchError::NarrativeTimeout { .. } => "AI_ANALYSIS_TIMEOUT",
            DispatchError::UnknownReport(_) => "REPORT_NOT_FOUND",
            DispatchError::Persistence(_) => "PERSISTENCE_FAILED",
        }
    }
}

/// An upload kept around after a narrative timeout.
struct ParkedUpload {
    zip: Vec<u8>,
    zip_filename: Option<String>,
    expires_at: Instant,
}

/// Runs report dispatches.
pub struct Dispatcher {
    advertisers: Arc<AdvertiserDirectory>,
    flow: Arc<StationFlowService>,
    narrative: Arc<dyn NarrativeGenerator>,
    narrative_timeout: Duration,
    store: Arc<dyn ReportStore>,
    mailer: Arc<dyn Mailer>,
    from_email: String,
    deck: Arc<dyn DeckRenderer>,
    parked: DashMap<String, ParkedUpload>,
}

impl Dispatcher {
    /// Create a dispatcher with the default timeout, sender and no deck
    /// template.
    pub fn new(
        advertisers: Arc<AdvertiserDirectory>,
        flow: Arc<StationFlowService>,
        narrative: Arc<dyn NarrativeGenerator>,
        store: Arc<dyn ReportStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            advertisers,
            flow,
            narrative,
            narrative_timeout: DEFAULT_NARRATIVE_TIMEOUT,
            store,
            mailer,
            from_email: DEFAULT_FROM_EMAIL.to_owned(),
            deck: Arc::new(DeckTemplate::default()),
            parked: DashMap::new(),
        }
    }

    pub fn with_narrative_timeout(mut self, timeout: Duration) -> Self {
        self.narrative_timeout = timeout;
        self
    }

    pub fn with_from_email(mut self, from_email: String) -> Self {
        self.from_email = from_email;
        self
    }

    pub fn with_deck_renderer(mut self, deck: impl DeckRenderer) -> Self {
        self.deck = Arc::new(deck);
        self
    }

    /// The report store, for history queries.
    pub fn store(&self) -> &dyn ReportStore {
        self.store.as_ref()
    }

    /// Look up and check the advertiser. No side effects.
    fn validate_advertiser(
        &self,
        request: &ReportRequest,
    ) -> Result<(AdvertiserRecord, Vec<String>, Vec<String>), DispatchError> {
        let id = request
            .advertiser_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(DispatchError::MissingAdvertiser)?;
        let advertiser = self
            .advertisers
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownAdvertiser(id.to_owned()))?;
        let (to, cc) = recipients(&advertiser, request.primary_recipient)
            .ok_or_else(|| DispatchError::NoRecipient(id.to_owned()))?;
        Ok((advertiser, to, cc))
    }

    /// Decode the uploaded archive, or reclaim a parked one.
    fn take_upload(
        &self,
        request: &ReportRequest,
    ) -> Result<(Vec<u8>, Option<String>), DispatchError> {
        if let Some(token) = &request.retry_token {
            let (_, parked) = self
                .parked
                .remove(token)
                .ok_or(DispatchError::UnknownRetryToken)?;
            if parked.expires_at <= Instant::now() {
                return Err(DispatchError::UnknownRetryToken);
            }
            debug!("Reusing parked upload");
            return Ok((parked.zip, parked.zip_filename));
        }
        let encoded = request
            .zip_base64
            .as_deref()
            .filter(|z| !z.trim().is_empty())
            .ok_or_else(|| DispatchError::InvalidArchive("zipBase64 is required".to_owned()))?;
        // Tolerate a `data:` URL prefix.
        let encoded = encoded.rsplit_once(',').map_or(encoded, |(_, data)| data);
        let zip = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|err| DispatchError::InvalidArchive(err.to_string()))?;
        Ok((zip, request.zip_filename.clone()))
    }

    /// Keep an upload for a later retry and return its token.
    fn park_upload(&self, zip: Vec<u8>, zip_filename: Option<String>) -> String {
        let now = Instant::now();
        self.parked.retain(|_, parked| parked.expires_at > now);
        let token = Uuid::new_v4().to_string();
        self.parked.insert(
            token.clone(),
            ParkedUpload {
                zip,
                zip_filename,
                expires_at: now + RETRY_TOKEN_TTL,
            },
        );
        token
    }

    /// Generate the narrative, falling back to the offline one on errors.
    /// `Err(())` means the timeout fired.
    async fn narrate(&self, request: &NarrativeRequest) -> Result<AiAnalysis, ()> {
        match tokio::time::timeout(self.narrative_timeout, self.narrative.generate(request)).await
        {
            Ok(Ok(analysis)) => Ok(analysis),
            Ok(Err(err)) => {
                warn!(
                    generator = self.narrative.name(),
                    "AI narrative failed, using offline analysis: {err:#}"
                );
                Ok(OfflineNarrative::analyze(request))
            }
            Err(_) => Err(()),
        }
    }

    /// Run a dispatch.
    #[instrument(
        level = "info",
        skip_all,
        fields(advertiser_id = ?request.advertiser_id, station = ?request.station)
    )]
    pub async fn dispatch(&self, request: ReportRequest) -> Result<ReportResponse, DispatchError> {
        // Collecting metadata.
        let (advertiser, to, cc) = self.validate_advertiser(&request)?;
        let (zip, zip_filename) = self.take_upload(&request)?;
        let images = match extract_images(&zip) {
            Ok(images) => images,
            Err(err) => {
                // A bad archive can't be fixed by retrying with it.
                return Err(DispatchError::InvalidArchive(format!("{err:#}")));
            }
        };
        let now = Utc::now();
        let advertiser_name = request
            .advertiser_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| advertiser.name.clone());
        let station = label_or_fallback(request.station.as_deref());
        let line = label_or_fallback(request.line.as_deref());
        let report_date = request
            .date_str
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| date_str(now));
        let user_label = request
            .user_entered_name
            .clone()
            .filter(|l| !l.trim().is_empty());
        let image_count = request.image_count.unwrap_or(images.len() as u32);

        let mut input = ReportInput {
            advertiser_name: advertiser_name.clone(),
            station: station.clone(),
            line: line.clone(),
            date_str: report_date.clone(),
            subtitle: user_label.clone(),
            exposure: None,
            analysis: None,
            images: images.into_iter().map(|(_, image)| image).collect(),
            campaign_manager_name: advertiser.campaign_manager_name.clone(),
            campaign_manager_email: advertiser.campaign_manager_email.clone(),
        };

        // Computing exposure.
        let wants_exposure = request.include_ppt || !request.skip_ai_analysis;
        let mut flow_and_exposure = None;
        if wants_exposure {
            let flow = self.flow.fetch_station_flow(&station, &line).await;
            let exposure = estimate(&flow, display_days_or_default(request.display_days), 1.0);
            input.exposure = Some(exposure.clone());
            flow_and_exposure = Some((flow, exposure));
        }

        // Generating the deck.
        let deck = if request.include_ppt {
            match self.deck.render(&input) {
                Ok(deck) => Some(deck),
                Err(err) => {
                    warn!("Slide deck failed, sending without it: {err:#}");
                    None
                }
            }
        } else {
            None
        };

        // Requesting the AI narrative.
        let flow_and_exposure = flow_and_exposure.filter(|_| !request.skip_ai_analysis);
        if let Some((flow, exposure)) = flow_and_exposure {
            let narrative_request = NarrativeRequest {
                advertiser_name: advertiser_name.clone(),
                station: station.clone(),
                line: line.clone(),
                date_str: report_date.clone(),
                flow,
                exposure,
            };
            match self.narrate(&narrative_request).await {
                Ok(analysis) => input.analysis = Some(analysis),
                Err(()) => {
                    let retry_token = self.park_upload(zip, zip_filename);
                    warn!(
                        timeout = ?self.narrative_timeout,
                        "AI narrative timed out, parked upload for retry"
                    );
                    return Err(DispatchError::NarrativeTimeout { retry_token });
                }
            }
        }
        let pdf = match &input.analysis {
            Some(_) => match render_pdf(&input) {
                Ok(pdf) => Some(pdf),
                Err(err) => {
                    warn!("Analysis PDF failed, sending without it: {err:#}");
                    None
                }
            },
            None => None,
        };

        // Persisting.
        let report_id = Uuid::new_v4().to_string();
        let file_stem = format!(
            "{}_{}_{}",
            sanitize_component(&advertiser_name),
            sanitize_component(&station),
            report_date
        );
        let mut attachments = vec![Attachment {
            filename: zip_filename.unwrap_or_else(|| zip_name(&advertiser_name, now)),
            content: zip,
        }];
        if let Some(deck) = &deck {
            attachments.push(Attachment {
                filename: format!("{file_stem}_노출분석.pptx"),
                content: deck.clone(),
            });
        }
        if let Some(pdf) = &pdf {
            attachments.push(Attachment {
                filename: format!("{file_stem}_성과분석.pdf"),
                content: pdf.clone(),
            });
        }
        let envelope = EmailEnvelope {
            from: self.from_email.clone(),
            to: to.clone(),
            cc,
            subject: subject(
                &advertiser_name,
                &line,
                &station,
                user_label.as_deref(),
                &report_date,
            ),
            text: body(
                &advertiser,
                request.sender_name_option,
                request.login_user_name.as_deref(),
                &BodyDetails {
                    station: &station,
                    line: &line,
                    date_str: &report_date,
                    image_count: image_count as usize,
                    has_deck: deck.is_some(),
                    has_analysis: pdf.is_some(),
                },
            ),
            attachments,
        };
        let record = ReportRecord {
            id: report_id.clone(),
            created_at: now,
            advertiser_id: advertiser.id.clone(),
            advertiser_name,
            station,
            line,
            image_count,
            sent_to: to.join(", "),
            ai_analysis: input.analysis,
        };
        if let Err(err) = self.store.insert(&record, &envelope).await {
            error!(%report_id, "Could not save report: {err:#}");
            return Err(DispatchError::Persistence(err));
        }
        info!(%report_id, "Saved report");

        // Sending.
        Ok(self.deliver(&report_id, &envelope).await)
    }

    /// Re-send a saved report's email.
    #[instrument(level = "info", skip(self))]
    pub async fn resend(&self, report_id: &str) -> Result<ReportResponse, DispatchError> {
        let envelope = self
            .store
            .envelope(report_id)
            .await
            .map_err(DispatchError::Persistence)?
            .ok_or_else(|| DispatchError::UnknownReport(report_id.to_owned()))?;
        Ok(self.deliver(report_id, &envelope).await)
    }

    /// Send the email and log the attempt. The report is already saved, so
    /// failures here are reported rather than returned.
    async fn deliver(&self, report_id: &str, envelope: &EmailEnvelope) -> ReportResponse {
        let result = self.mailer.send(envelope, report_id).await;
        let attempt = DeliveryAttempt {
            attempted_at: Utc::now(),
            ok: result.is_ok(),
            message_id: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|err| err.to_string()),
        };
        if let Err(err) = self.store.record_delivery(report_id, &attempt).await {
            warn!(%report_id, "Could not record delivery attempt: {err:#}");
        }
        match result {
            Ok(_) => ReportResponse {
                ok: true,
                message: Some("보고서를 발송했습니다.".to_owned()),
                saved_to_history: Some(true),
                report_id: Some(report_id.to_owned()),
                ..ReportResponse::default()
            },
            Err(err) => {
                warn!(%report_id, "Report saved but email failed: {err}");
                ReportResponse {
                    ok: false,
                    message: Some(
                        "보고서는 저장되었지만 이메일 발송에 실패했습니다. 기록에서 다시 보낼 수 있습니다."
                            .to_owned(),
                    ),
                    error: Some("EMAIL_FAILED".to_owned()),
                    saved_to_history: Some(true),
                    report_id: Some(report_id.to_owned()),
                    ..ReportResponse::default()
                }
            }
        }
    }
}

fn label_or_fallback(label: Option<&str>) -> String {
    label
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(FALLBACK_LABEL)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        capture::archive::build_zip,
        dispatch::{
            email::tests::{RecordingMailer, advertiser},
            narrative::tests::request as narrative_request,
            store::SqliteReportStore,
        },
        exposure::cache::FlowCache,
    };

    /// Never finishes in time.
    struct SlowNarrative;

    #[async_trait]
    impl NarrativeGenerator for SlowNarrative {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn generate(&self, _request: &NarrativeRequest) -> Result<AiAnalysis> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            bail!("unreachable in tests")
        }
    }

    /// Always fails immediately.
    struct BrokenNarrative(AtomicUsize);

    #[async_trait]
    impl NarrativeGenerator for BrokenNarrative {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn generate(&self, _request: &NarrativeRequest) -> Result<AiAnalysis> {
            self.0.fetch_add(1, Ordering::SeqCst);
            bail!("model unavailable")
        }
    }

    /// A store whose inserts always fail.
    struct FailingStore;

    #[async_trait]
    impl ReportStore for FailingStore {
        async fn insert(&self, _: &ReportRecord, _: &EmailEnvelope) -> Result<()> {
            bail!("disk full")
        }
        async fn record_delivery(&self, _: &str, _: &DeliveryAttempt) -> Result<()> {
            bail!("disk full")
        }
        async fn list(&self, _: usize) -> Result<Vec<store::ReportSummary>> {
            Ok(vec![])
        }
        async fn get(&self, _: &str) -> Result<Option<store::ReportDetail>> {
            Ok(None)
        }
        async fn envelope(&self, _: &str) -> Result<Option<EmailEnvelope>> {
            Ok(None)
        }
    }

    /// A deck renderer that always fails.
    struct BrokenDeck;

    impl DeckRenderer for BrokenDeck {
        fn render(&self, _input: &ReportInput) -> Result<Vec<u8>> {
            bail!("template is corrupt")
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<SqliteReportStore>,
        mailer: Arc<RecordingMailer>,
    }

    fn harness(narrative: Arc<dyn NarrativeGenerator>, fail_email: bool) -> Harness {
        let store = Arc::new(SqliteReportStore::in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer {
            fail: fail_email,
            ..RecordingMailer::default()
        });
        let dispatcher = Dispatcher::new(
            Arc::new(AdvertiserDirectory::new(vec![advertiser()])),
            Arc::new(StationFlowService::new(None, FlowCache::default())),
            narrative,
            store.clone(),
            mailer.clone(),
        );
        Harness {
            dispatcher,
            store,
            mailer,
        }
    }

    fn png() -> Vec<u8> {
        let mut png = Vec::new();
        image::RgbImage::from_pixel(8, 8, image::Rgb([0, 160, 80]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        png
    }

    fn request() -> ReportRequest {
        let zip = build_zip(&[
            ("SSG_5호선_공덕_20240305_01.png".to_owned(), png()),
            ("SSG_5호선_공덕_20240305_02.png".to_owned(), png()),
        ])
        .unwrap();
        ReportRequest {
            advertiser_id: Some("ssg".to_owned()),
            station: Some("공덕".to_owned()),
            line: Some("5호선".to_owned()),
            user_entered_name: Some("A면".to_owned()),
            date_str: Some("20240305".to_owned()),
            zip_base64: Some(BASE64_STANDARD.encode(zip)),
            include_ppt: true,
            ..ReportRequest::default()
        }
    }

    fn attachment_names(envelope: &EmailEnvelope) -> Vec<&str> {
        envelope
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_full_dispatch() {
        let h = harness(Arc::new(OfflineNarrative), false);
        let response = h.dispatcher.dispatch(request()).await.unwrap();
        assert!(response.ok);
        assert_eq!(response.saved_to_history, Some(true));
        let report_id = response.report_id.unwrap();

        let sent = h.mailer.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let (envelope, key) = &sent[0];
        assert_eq!(key, &report_id);
        assert_eq!(envelope.to, ["ad@ssg.example"]);
        assert_eq!(envelope.cc, ["pm@agency.example"]);
        assert_eq!(envelope.subject, "SSG_5호선_공덕_A면_20240305 게첨 보고서의 건");
        let names = attachment_names(envelope);
        assert_eq!(names.len(), 3);
        assert!(names[0].starts_with("SSG_촬영_"));
        assert_eq!(names[1], "SSG_공덕_20240305_노출분석.pptx");
        assert_eq!(names[2], "SSG_공덕_20240305_성과분석.pdf");

        let detail = h.store.get(&report_id).await.unwrap().unwrap();
        assert!(detail.delivered);
        assert_eq!(detail.record.image_count, 2);
        assert_eq!(detail.record.ai_analysis.unwrap().metrics.daily_traffic, 90_000);
    }

    #[tokio::test]
    async fn test_deck_failure_sends_without_deck() {
        let Harness {
            dispatcher,
            store,
            mailer,
        } = harness(Arc::new(OfflineNarrative), false);
        let dispatcher = dispatcher.with_deck_renderer(BrokenDeck);
        let response = dispatcher.dispatch(request()).await.unwrap();
        assert!(response.ok);
        assert_eq!(response.saved_to_history, Some(true));
        let report_id = response.report_id.unwrap();

        let sent = mailer.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let names = attachment_names(&sent[0].0);
        assert!(names[0].starts_with("SSG_촬영_"));
        assert!(!names.iter().any(|n| n.ends_with(".pptx")));
        assert!(names.iter().any(|n| n.ends_with(".pdf")));

        let detail = store.get(&report_id).await.unwrap().unwrap();
        assert!(detail.delivered);
        assert_eq!(store.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_or_unknown_advertiser_has_no_side_effects() {
        let h = harness(Arc::new(OfflineNarrative), false);
        let err = h
            .dispatcher
            .dispatch(ReportRequest {
                advertiser_id: Some("  ".to_owned()),
                ..request()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingAdvertiser));

        let err = h
            .dispatcher
            .dispatch(ReportRequest {
                advertiser_id: Some("nobody".to_owned()),
                ..request()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ADVERTISER_NOT_FOUND");

        assert!(h.store.list(10).await.unwrap().is_empty());
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_archive() {
        let h = harness(Arc::new(OfflineNarrative), false);
        for zip in [None, Some("%%%".to_owned()), Some(BASE64_STANDARD.encode("nope"))] {
            let err = h
                .dispatcher
                .dispatch(ReportRequest {
                    zip_base64: zip,
                    ..request()
                })
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::InvalidArchive(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn test_email_failure_keeps_record() {
        let h = harness(Arc::new(OfflineNarrative), true);
        let response = h.dispatcher.dispatch(request()).await.unwrap();
        assert!(!response.ok);
        assert_eq!(response.saved_to_history, Some(true));
        let report_id = response.report_id.unwrap();

        let detail = h.store.get(&report_id).await.unwrap().unwrap();
        assert!(!detail.delivered);
        assert_eq!(detail.deliveries.len(), 1);
        assert_eq!(detail.attachments.len(), 3);
    }

    #[tokio::test]
    async fn test_resend_uses_stored_envelope() {
        let failing = harness(Arc::new(OfflineNarrative), true);
        let response = failing.dispatcher.dispatch(request()).await.unwrap();
        let report_id = response.report_id.unwrap();

        // Same store, working mailer.
        let mailer = Arc::new(RecordingMailer::default());
        let dispatcher = Dispatcher::new(
            Arc::new(AdvertiserDirectory::new(vec![advertiser()])),
            Arc::new(StationFlowService::new(None, FlowCache::default())),
            Arc::new(OfflineNarrative),
            failing.store.clone(),
            mailer.clone(),
        );
        let response = dispatcher.resend(&report_id).await.unwrap();
        assert!(response.ok);
        let sent = mailer.sent.lock().unwrap().clone();
        assert_eq!(sent[0].1, report_id);
        assert_eq!(sent[0].0.attachments.len(), 3);
        assert!(failing.store.get(&report_id).await.unwrap().unwrap().delivered);

        assert!(matches!(
            dispatcher.resend("missing").await,
            Err(DispatchError::UnknownReport(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_narrative_timeout_parks_upload() {
        let h = harness(Arc::new(SlowNarrative), false);
        let err = h.dispatcher.dispatch(request()).await.unwrap_err();
        let DispatchError::NarrativeTimeout { retry_token } = err else {
            panic!("expected a narrative timeout");
        };
        // Nothing saved or sent for the timed-out attempt.
        assert!(h.store.list(10).await.unwrap().is_empty());
        assert!(h.mailer.sent.lock().unwrap().is_empty());

        // Retry without re-uploading, skipping the analysis this time.
        let retry = ReportRequest {
            zip_base64: None,
            retry_token: Some(retry_token.clone()),
            skip_ai_analysis: true,
            ..request()
        };
        let response = h.dispatcher.dispatch(retry.clone()).await.unwrap();
        assert!(response.ok);
        let sent = h.mailer.sent.lock().unwrap().clone();
        // Photos and deck, but no analysis PDF.
        assert_eq!(attachment_names(&sent[0].0).len(), 2);
        let detail = h
            .store
            .get(response.report_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(detail.record.ai_analysis.is_none());

        // Tokens are single-use.
        assert!(matches!(
            h.dispatcher.dispatch(retry).await,
            Err(DispatchError::UnknownRetryToken)
        ));
    }

    #[tokio::test]
    async fn test_narrative_error_uses_offline_analysis() {
        let broken = Arc::new(BrokenNarrative(AtomicUsize::new(0)));
        let h = harness(broken.clone(), false);
        let response = h.dispatcher.dispatch(request()).await.unwrap();
        assert!(response.ok);
        assert_eq!(broken.0.load(Ordering::SeqCst), 1);
        let detail = h
            .store
            .get(response.report_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            detail.record.ai_analysis,
            Some(OfflineNarrative::analyze(&narrative_request()))
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_terminal() {
        let mailer = Arc::new(RecordingMailer::default());
        let dispatcher = Dispatcher::new(
            Arc::new(AdvertiserDirectory::new(vec![advertiser()])),
            Arc::new(StationFlowService::new(None, FlowCache::default())),
            Arc::new(OfflineNarrative),
            Arc::new(FailingStore),
            mailer.clone(),
        );
        let err = dispatcher.dispatch(request()).await.unwrap_err();
        assert_eq!(err.code(), "PERSISTENCE_FAILED");
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_campaign_recipient_without_ppt() {
        let h = harness(Arc::new(OfflineNarrative), false);
        let response = h
            .dispatcher
            .dispatch(ReportRequest {
                primary_recipient: PrimaryRecipient::Campaign,
                include_ppt: false,
                skip_ai_analysis: true,
                ..request()
            })
            .await
            .unwrap();
        assert!(response.ok);
        let sent = h.mailer.sent.lock().unwrap().clone();
        assert_eq!(sent[0].0.to, ["pm@agency.example"]);
        assert!(sent[0].0.cc.is_empty());
        assert_eq!(attachment_names(&sent[0].0).len(), 1);
    }
}
