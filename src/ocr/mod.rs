//! OCR engines.
//!
//! The server wraps a cloud provider (Google Vision or Textract). Clients
//! call the server first and fall back to a local `tesseract` run.

use std::sync::Arc;

use clap::{Args, ValueEnum};
use schemars::JsonSchema;
use thiserror::Error;

use crate::{data_url::ImagePayload, prelude::*, rate_limit::RateLimit};

pub mod fallback;
pub mod gateway;
pub mod google_vision;
pub mod tesseract;
pub mod textract;

/// Text recognized in one image.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrText {
    /// All recognized text, in reading order.
    pub text: String,
    /// Between 0 and 1.
    pub confidence: f64,
    /// The same words ordered largest first, which puts the station name
    /// and number ahead of small print on a station sign.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_for_station: Option<String>,
}

impl OcrText {
    /// No text was found.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Did we find anything?
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// The best text to search for a station name.
    pub fn station_text(&self) -> &str {
        self.text_for_station
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.text)
    }
}

/// A word or line with its on-image size, used to build
/// [`OcrText::text_for_station`].
#[derive(Debug)]
pub(crate) struct SizedText {
    pub text: String,
    pub area: f64,
}

/// Join words largest first. `None` if there's nothing to join.
pub(crate) fn largest_first(mut items: Vec<SizedText>) -> Option<String> {
    // Stable sort, so equal areas keep reading order.
    items.sort_by(|a, b| b.area.total_cmp(&a.area));
    let joined = items
        .iter()
        .map(|item| item.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

/// Why OCR failed.
///
/// Callers treat these differently: a rate limit is shown to the user,
/// while an unavailable provider triggers the local fallback.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum OcrError {
    /// Too many requests from this client.
    #[error("too many OCR requests; try again in {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the client may retry.
        retry_after_secs: u64,
    },

    /// The provider is not configured or could not be reached.
    #[error("OCR provider unavailable: {0}")]
    Unavailable(String),

    /// The provider was reached but the request failed.
    #[error("OCR failed: {0}")]
    Failed(String),
}

/// Interface for OCR engines.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Recognize the text in an image. An image without text is a success
    /// with empty text, not an error.
    async fn recognize(&self, image: &ImagePayload) -> Result<OcrText, OcrError>;
}

/// Which cloud provider the server uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OcrProvider {
    /// Google Cloud Vision `TEXT_DETECTION`.
    #[default]
    GoogleVision,
    /// AWS Textract.
    Textract,
    /// No server OCR. Clients always use their local engine.
    None,
}

/// Server-side OCR options.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// The OCR provider behind `/capture/ocr`.
    #[clap(long, env = "ADMATE_OCR_PROVIDER", value_enum, default_value_t = OcrProvider::default())]
    pub ocr_provider: OcrProvider,

    /// Google Cloud Vision API key. Without one, the Google provider reports
    /// itself unavailable.
    #[clap(long, env = "GOOGLE_CLOUD_VISION_API_KEY", hide_env_values = true)]
    pub google_vision_api_key: Option<String>,

    /// Throttle our own calls to the provider, of the form "10/s" or "600/m".
    #[clap(long)]
    pub provider_rate_limit: Option<RateLimit>,
}

impl OcrOpts {
    /// Instantiate the configured provider.
    pub async fn create_engine(&self) -> Result<Arc<dyn OcrEngine>> {
        let rate_limiter = self
            .provider_rate_limit
            .as_ref()
            .map(RateLimit::to_rate_limiter);
        let engine: Arc<dyn OcrEngine> = match self.ocr_provider {
            OcrProvider::GoogleVision => Arc::new(google_vision::GoogleVisionEngine::new(
                self.google_vision_api_key.clone(),
                rate_limiter,
            )),
            OcrProvider::Textract => {
                Arc::new(textract::TextractEngine::new(rate_limiter).await)
            }
            OcrProvider::None => Arc::new(DisabledEngine),
        };
        info!(engine = engine.name(), "Server OCR engine ready");
        Ok(engine)
    }
}

/// An engine that is never available.
#[derive(Debug)]
pub struct DisabledEngine;

#[async_trait]
impl OcrEngine for DisabledEngine {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn recognize(&self, _image: &ImagePayload) -> Result<OcrText, OcrError> {
        Err(OcrError::Unavailable("no OCR provider configured".to_owned()))
    }
}
