//! Calling our own server's `/capture/ocr` endpoint from a client.

use reqwest::StatusCode;

use crate::{data_url::ImagePayload, prelude::*};

use super::{OcrEngine, OcrError, OcrText};

/// Default retry hint when the server omits one.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// An [`OcrEngine`] backed by the server's OCR gateway.
#[derive(Debug, Clone)]
pub struct GatewayOcrClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayOcrClient {
    /// Create a client for the server at `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

/// Error bodies returned by the gateway.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retry_after_secs: Option<u64>,
}

/// Map a gateway response status and body to our error taxonomy.
fn classify(status: StatusCode, body: &str) -> OcrError {
    let parsed = serde_json::from_str::<GatewayError>(body).unwrap_or_default();
    let message = parsed.message.unwrap_or_else(|| body.to_owned());
    match status {
        StatusCode::TOO_MANY_REQUESTS => OcrError::RateLimited {
            retry_after_secs: parsed.retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        StatusCode::SERVICE_UNAVAILABLE => OcrError::Unavailable(message),
        _ => OcrError::Failed(format!("server returned {status}: {message}")),
    }
}

#[async_trait]
impl OcrEngine for GatewayOcrClient {
    fn name(&self) -> &'static str {
        "server"
    }

    #[instrument(level = "debug", skip_all, fields(base_url = %self.base_url))]
    async fn recognize(&self, image: &ImagePayload) -> Result<OcrText, OcrError> {
        let response = self
            .client
            .post(format!("{}/capture/ocr", self.base_url))
            .json(&json!({ "imageDataUrl": image.to_data_url() }))
            .send()
            .await
            .map_err(|err| OcrError::Unavailable(format!("cannot reach server: {err}")))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<OcrText>()
                .await
                .map_err(|err| OcrError::Failed(format!("bad OCR response: {err}")));
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(
                StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":"RATE_LIMITED","message":"slow down","retryAfterSecs":12}"#
            ),
            OcrError::RateLimited { retry_after_secs: 12 }
        );
        assert_eq!(
            classify(
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":"SERVER_OCR_UNAVAILABLE","message":"not configured"}"#
            ),
            OcrError::Unavailable("not configured".to_owned())
        );
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "oops"),
            OcrError::Failed(msg) if msg.contains("oops")
        ));
    }
}
