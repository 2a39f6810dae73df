//! The `send` subcommand: turn a capture session into a report request.

use std::sync::Arc;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use chrono::Utc;
use clap::Args;

use crate::{
    advertisers::{AdvertiserDirectory, AdvertiserRecord},
    capture::{
        StationVisit,
        archive::bundle_visits,
        filename::zip_name,
        resolve::{VisitMeta, resolve_visit},
        session::CaptureAction,
    },
    dispatch::{
        ReportRequest, ReportResponse,
        email::{PrimaryRecipient, SenderNameOption},
    },
    io::write_json,
    ocr::{
        OcrEngine, fallback::FallbackOcr, gateway::GatewayOcrClient, tesseract::TesseractEngine,
    },
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::session::SessionFileOpts;

/// Send command line arguments.
#[derive(Args, Debug)]
pub struct SendOpts {
    #[command(flatten)]
    pub file: SessionFileOpts,

    /// Advertiser directory (JSON or TOML).
    #[clap(long, env = "ADMATE_ADVERTISERS")]
    pub advertisers: PathBuf,

    /// Base URL of the report server.
    #[clap(long, env = "ADMATE_SERVER", default_value = "http://127.0.0.1:8080")]
    pub server: String,

    /// Use this advertiser instead of the recognized one.
    #[clap(long)]
    pub advertiser_id: Option<String>,

    /// A label for this report, such as a panel number.
    #[clap(long)]
    pub user_label: Option<String>,

    /// Who receives the email.
    #[clap(long, value_enum, default_value_t)]
    pub primary_recipient: PrimaryRecipient,

    /// Whose name the email is sent under.
    #[clap(long, value_enum, default_value_t)]
    pub sender_name_option: SenderNameOption,

    /// Your name, for the email greeting.
    #[clap(long, env = "ADMATE_USER_NAME")]
    pub login_user_name: Option<String>,

    /// Attach an exposure slide deck.
    #[clap(long)]
    pub include_ppt: bool,

    /// Display period in days for exposure estimates.
    #[clap(long)]
    pub display_days: Option<u32>,

    /// Do not request an AI analysis.
    #[clap(long)]
    pub skip_ai_analysis: bool,

    /// If the AI analysis times out, send again at once without it.
    #[clap(long)]
    pub skip_ai_on_timeout: bool,

    /// Languages for the on-device OCR fallback.
    #[clap(long, default_value = "kor+eng")]
    pub tesseract_langs: String,

    /// Write the server's response here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Describe the stations of a multi-visit report.
fn station_summary(metas: &[VisitMeta]) -> String {
    let Some(first) = metas.first() else {
        return String::new();
    };
    let others = metas
        .iter()
        .filter(|m| m.station_name != first.station_name)
        .count();
    if others == 0 {
        first.station_name.clone()
    } else {
        format!("{} 외 {}곳", first.station_name, metas.len() - 1)
    }
}

/// Pick the advertiser: an explicit choice, else the first one recognized.
fn choose_advertiser<'a>(
    directory: &'a AdvertiserDirectory,
    explicit: Option<&str>,
    metas: &[VisitMeta],
) -> Result<&'a AdvertiserRecord> {
    if let Some(id) = explicit {
        return directory
            .get(id)
            .ok_or_else(|| anyhow!("unknown advertiser {id:?}"));
    }
    let recognized = metas
        .iter()
        .find_map(|m| m.advertiser_id.as_deref())
        .ok_or_else(|| {
            anyhow!("no advertiser was recognized in the photos; pass --advertiser-id")
        })?;
    directory
        .get(recognized)
        .ok_or_else(|| anyhow!("recognized advertiser {recognized:?} is not in the directory"))
}

/// Build the request body for `/capture/report`.
fn build_request(
    opts: &SendOpts,
    advertiser: &AdvertiserRecord,
    metas: &[VisitMeta],
    image_count: usize,
    zip: &[u8],
) -> ReportRequest {
    let first = metas.first();
    ReportRequest {
        advertiser_id: Some(advertiser.id.clone()),
        advertiser_name: Some(advertiser.name.clone()),
        primary_recipient: opts.primary_recipient,
        sender_name_option: opts.sender_name_option,
        station: Some(station_summary(metas)),
        line: first.map(|m| m.subway_line.clone()),
        user_entered_name: opts.user_label.clone(),
        image_count: u32::try_from(image_count).ok(),
        date_str: first.map(|m| m.date_str.clone()),
        zip_base64: Some(BASE64_STANDARD.encode(zip)),
        zip_filename: Some(zip_name(&advertiser.name, Utc::now())),
        include_ppt: opts.include_ppt,
        display_days: opts.display_days,
        skip_ai_analysis: opts.skip_ai_analysis,
        login_user_name: opts.login_user_name.clone(),
        retry_token: None,
    }
}

/// POST a report request and decode the answer, whatever the status.
async fn post_report(
    client: &reqwest::Client,
    server: &str,
    request: &ReportRequest,
) -> Result<ReportResponse> {
    let url = format!("{}/capture/report", server.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(request)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read response from {url}"))?;
    debug!(%status, "Report server answered");
    serde_json::from_str::<ReportResponse>(&body)
        .with_context(|| format!("Unexpected response from {url} ({status}): {body}"))
}

/// The `send` subcommand.
#[instrument(level = "debug", skip_all, fields(server = %opts.server))]
pub async fn cmd_send(ui: Ui, opts: &SendOpts) -> Result<()> {
    let mut session = opts.file.load().await?;
    if !session.is_ready() {
        bail!(
            "The session is not ready: every visit needs a location photo (or skip) and at least one ad photo"
        );
    }
    let directory = AdvertiserDirectory::load(&opts.advertisers).await?;
    let ocr: Arc<dyn OcrEngine> = Arc::new(FallbackOcr::new(
        Arc::new(GatewayOcrClient::new(&opts.server)),
        Arc::new(TesseractEngine::new(opts.tesseract_langs.clone())),
    ));

    // Resolve each visit.
    let visits: Vec<&StationVisit> = session.all_visits();
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔎",
            msg: "Recognizing photos",
            done_msg: "Recognized photos",
        },
        visits.len() as u64,
    );
    let mut metas = Vec::with_capacity(visits.len());
    for visit in &visits {
        let meta = resolve_visit(
            visit,
            ocr.as_ref(),
            directory.all(),
            opts.user_label.as_deref(),
        )
        .await?;
        if meta.needs_correction {
            warn!(
                visit_id = %meta.visit_id,
                "Station or line not recognized; fix with `session override`"
            );
        }
        metas.push(meta);
        pb.inc(1);
    }
    pb.finish_using_style();

    let advertiser = choose_advertiser(&directory, opts.advertiser_id.as_deref(), &metas)?;
    for (meta, visit) in metas.iter_mut().zip(&visits) {
        if meta.advertiser_id.as_deref() != Some(advertiser.id.as_str()) {
            meta.advertiser_id = Some(advertiser.id.clone());
            meta.advertiser_name = advertiser.name.clone();
            meta.rename(visit.ad_images.len(), opts.user_label.as_deref());
        }
    }

    let pairs = visits.iter().copied().zip(metas.iter()).collect::<Vec<_>>();
    let zip = bundle_visits(&pairs)?;
    let mut request = build_request(
        opts,
        advertiser,
        &metas,
        session.total_ad_image_count(),
        &zip,
    );
    info!(
        advertiser = %advertiser.id,
        station = request.station.as_deref().unwrap_or_default(),
        zip_bytes = zip.len(),
        "Sending report"
    );

    let client = reqwest::Client::new();
    let mut response = post_report(&client, &opts.server, &request).await?;
    if opts.skip_ai_on_timeout
        && response.error.as_deref() == Some("AI_ANALYSIS_TIMEOUT")
        && let Some(token) = response.retry_token.take()
    {
        warn!("AI analysis timed out; sending again without it");
        request.zip_base64 = None;
        request.retry_token = Some(token);
        request.skip_ai_analysis = true;
        response = post_report(&client, &opts.server, &request).await?;
    }

    write_json(opts.output_path.as_deref(), &response).await?;

    let saved = response.ok || response.saved_to_history == Some(true);
    if saved {
        // The server has the photos now, so a retry must not send them twice.
        session.apply(CaptureAction::Reset)?;
        opts.file.save(&session).await?;
    }
    if response.ok {
        info!(report_id = ?response.report_id, "Report sent");
        Ok(())
    } else if saved {
        warn!(
            report_id = ?response.report_id,
            "Report saved but the email failed; resend it from the report history"
        );
        Ok(())
    } else {
        bail!(
            "Report was not sent: {} {}",
            response.error.as_deref().unwrap_or("UNKNOWN"),
            response.message.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(station: &str, advertiser_id: Option<&str>) -> VisitMeta {
        VisitMeta {
            visit_id: station.to_owned(),
            station_name: station.to_owned(),
            subway_line: "5호선".to_owned(),
            advertiser_name: "SSG".to_owned(),
            advertiser_id: advertiser_id.map(str::to_owned),
            date_str: "20240305".to_owned(),
            filenames: vec![],
            skip_location: false,
            needs_correction: false,
        }
    }

    fn directory() -> AdvertiserDirectory {
        AdvertiserDirectory::new(vec![
            AdvertiserRecord {
                id: "ssg".to_owned(),
                name: "SSG".to_owned(),
                email: None,
                campaign_manager_name: None,
                campaign_manager_email: None,
                search_terms: vec![],
            },
            AdvertiserRecord {
                id: "kb".to_owned(),
                name: "KB".to_owned(),
                email: None,
                campaign_manager_name: None,
                campaign_manager_email: None,
                search_terms: vec![],
            },
        ])
    }

    #[test]
    fn test_station_summary() {
        assert_eq!(station_summary(&[]), "");
        assert_eq!(station_summary(&[meta("공덕", None)]), "공덕");
        assert_eq!(
            station_summary(&[meta("공덕", None), meta("공덕", None)]),
            "공덕"
        );
        assert_eq!(
            station_summary(&[meta("공덕", None), meta("군자", None), meta("광화문", None)]),
            "공덕 외 2곳"
        );
    }

    #[test]
    fn test_choose_advertiser() {
        let directory = directory();
        let metas = [meta("공덕", None), meta("군자", Some("kb"))];
        assert_eq!(choose_advertiser(&directory, None, &metas).unwrap().id, "kb");
        assert_eq!(
            choose_advertiser(&directory, Some("ssg"), &metas).unwrap().id,
            "ssg"
        );
        assert!(choose_advertiser(&directory, Some("nope"), &metas).is_err());
        assert!(choose_advertiser(&directory, None, &[meta("공덕", None)]).is_err());
    }
}
