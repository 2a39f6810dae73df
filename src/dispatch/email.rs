//! Composing and delivering report emails.

use std::time::Duration;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use clap::{Args, ValueEnum};
use schemars::JsonSchema;
use thiserror::Error;

use crate::{
    advertisers::AdvertiserRecord,
    prelude::*,
    report::format_date,
    retry::{
        IsKnownTransient as _, UpstreamRetryResult, default_jitter, resolved_into_result,
        retry_result_fatal, retry_result_ok, retry_result_transient, try_fatal,
        try_potentially_transient,
    },
};

/// Sender name when nobody more specific is known.
pub const DEFAULT_SENDER_NAME: &str = "나스미디어";

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// Sender used when none is configured.
pub const DEFAULT_FROM_EMAIL: &str = "나스미디어 보고 <onboarding@resend.dev>";

/// Email settings.
#[derive(Args, Clone, Debug)]
pub struct MailOpts {
    /// API key for Resend. Without it, reports are saved but not sent.
    #[clap(long, env = "RESEND_API_KEY", hide_env_values = true)]
    pub resend_api_key: Option<String>,

    /// The `From` address for report emails.
    #[clap(long, env = "RESEND_FROM_EMAIL", default_value = DEFAULT_FROM_EMAIL)]
    pub from_email: String,
}

impl MailOpts {
    /// Build a [`ResendMailer`] from these options.
    pub fn into_mailer(self) -> ResendMailer {
        if self.resend_api_key.is_none() {
            warn!("RESEND_API_KEY is not set, reports will be saved but not emailed");
        }
        ResendMailer::new(self.resend_api_key)
    }
}

/// Errors delivering email.
#[derive(Debug, Error)]
pub enum MailError {
    /// No API key.
    #[error("email is not configured")]
    NotConfigured,

    /// The provider refused or never answered.
    #[error("email delivery failed: {0:#}")]
    Delivery(anyhow::Error),
}

/// Who the report is addressed to.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "camelCase")]
pub enum PrimaryRecipient {
    /// The advertiser, with the campaign manager in Cc.
    #[default]
    Advertiser,
    /// The campaign manager only.
    Campaign,
}

/// Whose name the email is sent under.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "camelCase")]
pub enum SenderNameOption {
    /// The logged-in user.
    #[default]
    User,
    /// The advertiser's campaign manager.
    Campaign,
}

/// A file attached to an email.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// A complete outgoing message.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct EmailEnvelope {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub text: String,
    /// Stored separately from the rest of the envelope.
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

/// Work out `To` and `Cc`. Returns `None` if the primary recipient has no
/// address.
pub fn recipients(
    advertiser: &AdvertiserRecord,
    primary: PrimaryRecipient,
) -> Option<(Vec<String>, Vec<String>)> {
    let advertiser_email = non_empty(advertiser.email.as_deref());
    let manager_email = non_empty(advertiser.campaign_manager_email.as_deref());
    match primary {
        PrimaryRecipient::Advertiser => {
            let to = advertiser_email?;
            let cc = manager_email
                .filter(|cc| !cc.eq_ignore_ascii_case(&to))
                .into_iter()
                .collect();
            Some((vec![to], cc))
        }
        PrimaryRecipient::Campaign => Some((vec![manager_email?], vec![])),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// `{advertiser}_{line}_{station}_{label}_{YYYYMMDD} 게첨 보고서의 건`.
pub fn subject(
    advertiser_name: &str,
    line: &str,
    station: &str,
    user_label: Option<&str>,
    date_str: &str,
) -> String {
    let mut parts = vec![advertiser_name, line, station];
    if let Some(label) = user_label.map(str::trim).filter(|l| !l.is_empty()) {
        parts.push(label);
    }
    parts.push(date_str);
    format!("{} 게첨 보고서의 건", parts.join("_"))
}

/// What to mention in the body.
#[derive(Clone, Debug, Default)]
pub struct BodyDetails<'a> {
    pub station: &'a str,
    pub line: &'a str,
    pub date_str: &'a str,
    pub image_count: usize,
    pub has_deck: bool,
    pub has_analysis: bool,
}

/// The plain-text body.
pub fn body(
    advertiser: &AdvertiserRecord,
    sender_option: SenderNameOption,
    login_user_name: Option<&str>,
    details: &BodyDetails<'_>,
) -> String {
    let sender = match sender_option {
        SenderNameOption::User => non_empty(login_user_name),
        SenderNameOption::Campaign => non_empty(advertiser.campaign_manager_name.as_deref()),
    }
    .unwrap_or_else(|| DEFAULT_SENDER_NAME.to_owned());

    let mut attached = vec!["사진 ZIP"];
    if details.has_deck {
        attached.push("노출 분석 PPT");
    }
    if details.has_analysis {
        attached.push("성과 분석 PDF");
    }

    let mut text = format!(
        "안녕하세요, {sender}입니다.\n\n\
         {advertiser}의 {station}역({line}) 광고 게첨 보고서를 보내드립니다.\n\n\
         - 게첨일: {date}\n\
         - 촬영 사진: {count}장\n\
         - 첨부: {attached}\n",
        advertiser = advertiser.name,
        station = details.station,
        line = details.line,
        date = format_date(details.date_str, "."),
        count = details.image_count,
        attached = attached.join(", "),
    );
    let manager_name = non_empty(advertiser.campaign_manager_name.as_deref());
    let manager_email = non_empty(advertiser.campaign_manager_email.as_deref());
    match (manager_name, manager_email) {
        (Some(name), Some(email)) => text.push_str(&format!(
            "\n문의 사항은 담당자 {name}({email})에게 회신 부탁드립니다.\n"
        )),
        (None, Some(email)) => {
            text.push_str(&format!("\n문의 사항은 {email}로 회신 부탁드립니다.\n"))
        }
        _ => {}
    }
    text.push_str(&format!("\n감사합니다.\n{sender} 드림\n"));
    text
}

/// Something that can deliver an email.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Send a message. `idempotency_key` must be the same for retries of the
    /// same report, so the provider can drop duplicates. Returns the
    /// provider's message ID.
    async fn send(
        &self,
        envelope: &EmailEnvelope,
        idempotency_key: &str,
    ) -> Result<String, MailError>;
}

/// Sends email through the Resend HTTP API.
pub struct ResendMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

impl ResendMailer {
    /// Create a mailer. With no key, every send fails with
    /// [`MailError::NotConfigured`].
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: RESEND_ENDPOINT.to_owned(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    /// The JSON request body.
    fn request_body(envelope: &EmailEnvelope) -> Value {
        let attachments = envelope
            .attachments
            .iter()
            .map(|a| json!({ "filename": a.filename, "content": BASE64_STANDARD.encode(&a.content) }))
            .collect::<Vec<_>>();
        let mut body = json!({
            "from": envelope.from,
            "to": envelope.to,
            "subject": envelope.subject,
            "text": envelope.text,
            "attachments": attachments,
        });
        if !envelope.cc.is_empty() {
            body["cc"] = json!(envelope.cc);
        }
        body
    }

    /// A single attempt.
    async fn send_once(
        &self,
        api_key: &str,
        body: &Value,
        idempotency_key: &str,
    ) -> UpstreamRetryResult<String> {
        let response = try_potentially_transient!(
            self.client
                .post(&self.endpoint)
                .bearer_auth(api_key)
                .header("Idempotency-Key", idempotency_key)
                .json(body)
                .timeout(Duration::from_secs(60))
                .send()
                .await
        );
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = anyhow!("Resend returned {status}: {text}");
            return if status.is_known_transient() {
                retry_result_transient(err)
            } else {
                retry_result_fatal(err)
            };
        }
        let parsed = try_fatal!(
            response
                .json::<ResendResponse>()
                .await
                .context("Could not parse Resend response")
        );
        retry_result_ok(parsed.id)
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    #[instrument(level = "debug", skip_all, fields(to = ?envelope.to))]
    async fn send(
        &self,
        envelope: &EmailEnvelope,
        idempotency_key: &str,
    ) -> Result<String, MailError> {
        let api_key = self.api_key.as_deref().ok_or(MailError::NotConfigured)?;
        let body = Self::request_body(envelope);
        let resolved = self
            .send_once(api_key, &body, idempotency_key)
            .await
            .retry_with_async(|_| async {
                self.send_once(api_key, &body, idempotency_key).await
            })
            .with_exponential_jitter(default_jitter)
            .await;
        let id = resolved_into_result("report email", resolved).map_err(MailError::Delivery)?;
        info!(message_id = %id, "Sent report email");
        Ok(id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records messages, or fails every time.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub fail: bool,
        pub sent: Mutex<Vec<(EmailEnvelope, String)>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(
            &self,
            envelope: &EmailEnvelope,
            idempotency_key: &str,
        ) -> Result<String, MailError> {
            if self.fail {
                return Err(MailError::Delivery(anyhow!("mailbox full")));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((envelope.clone(), idempotency_key.to_owned()));
            Ok(format!("msg-{}", sent.len()))
        }
    }

    pub(crate) fn advertiser() -> AdvertiserRecord {
        AdvertiserRecord {
            id: "ssg".to_owned(),
            name: "SSG".to_owned(),
            email: Some("ad@ssg.example".to_owned()),
            campaign_manager_name: Some("김담당".to_owned()),
            campaign_manager_email: Some("pm@agency.example".to_owned()),
            search_terms: vec!["SSG.COM".to_owned()],
        }
    }

    #[test]
    fn test_recipients() {
        let ad = advertiser();
        assert_eq!(
            recipients(&ad, PrimaryRecipient::Advertiser),
            Some((
                vec!["ad@ssg.example".to_owned()],
                vec!["pm@agency.example".to_owned()]
            ))
        );
        assert_eq!(
            recipients(&ad, PrimaryRecipient::Campaign),
            Some((vec!["pm@agency.example".to_owned()], vec![]))
        );

        let no_email = AdvertiserRecord {
            email: Some(" ".to_owned()),
            ..advertiser()
        };
        assert_eq!(recipients(&no_email, PrimaryRecipient::Advertiser), None);
    }

    #[test]
    fn test_subject() {
        assert_eq!(
            subject("SSG", "5호선", "공덕", Some("A면"), "20240305"),
            "SSG_5호선_공덕_A면_20240305 게첨 보고서의 건"
        );
        assert_eq!(
            subject("SSG", "5호선", "공덕", Some(" "), "20240305"),
            "SSG_5호선_공덕_20240305 게첨 보고서의 건"
        );
    }

    #[test]
    fn test_body_sender() {
        let details = BodyDetails {
            station: "공덕",
            line: "5호선",
            date_str: "20240305",
            image_count: 3,
            has_deck: true,
            has_analysis: false,
        };
        let ad = advertiser();

        let text = body(&ad, SenderNameOption::User, Some("이현장"), &details);
        assert!(text.starts_with("안녕하세요, 이현장입니다."));
        assert!(text.contains("- 게첨일: 2024.03.05"));
        assert!(text.contains("- 첨부: 사진 ZIP, 노출 분석 PPT\n"));
        assert!(text.contains("담당자 김담당(pm@agency.example)"));

        let text = body(&ad, SenderNameOption::User, None, &details);
        assert!(text.starts_with("안녕하세요, 나스미디어입니다."));

        let text = body(&ad, SenderNameOption::Campaign, Some("이현장"), &details);
        assert!(text.ends_with("김담당 드림\n"));
    }

    #[test]
    fn test_request_body() {
        let envelope = EmailEnvelope {
            from: "a <a@example.com>".to_owned(),
            to: vec!["b@example.com".to_owned()],
            cc: vec![],
            subject: "s".to_owned(),
            text: "t".to_owned(),
            attachments: vec![Attachment {
                filename: "photos.zip".to_owned(),
                content: b"zip".to_vec(),
            }],
        };
        let body = ResendMailer::request_body(&envelope);
        assert_eq!(body["attachments"][0]["content"], "emlw");
        assert!(body.get("cc").is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_mailer_fails() {
        let envelope = EmailEnvelope {
            from: String::new(),
            to: vec![],
            cc: vec![],
            subject: String::new(),
            text: String::new(),
            attachments: vec![],
        };
        let err = ResendMailer::new(None)
            .send(&envelope, "id")
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::NotConfigured));
    }
}
