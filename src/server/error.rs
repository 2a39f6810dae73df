//! Mapping failures onto HTTP responses.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{dispatch::DispatchError, ocr::OcrError, prelude::*};

/// Anything a handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// The status code and JSON body for this error.
    pub fn status_and_body(&self) -> (StatusCode, Value) {
        match self {
            ApiError::InvalidBody(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "INVALID_BODY", "message": message }),
            ),
            ApiError::Ocr(OcrError::RateLimited { retry_after_secs }) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "RATE_LIMITED",
                    "message": format!(
                        "요청이 너무 많습니다. {retry_after_secs}초 후 다시 시도해 주세요."
                    ),
                    "retryAfterSecs": retry_after_secs,
                }),
            ),
            ApiError::Ocr(OcrError::Unavailable(message)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "SERVER_OCR_UNAVAILABLE", "message": message }),
            ),
            ApiError::Ocr(OcrError::Failed(message)) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": "SERVER_OCR_FAILED", "message": message }),
            ),
            ApiError::Dispatch(err) => {
                let status = match err {
                    DispatchError::MissingAdvertiser
                    | DispatchError::NoRecipient(_)
                    | DispatchError::InvalidArchive(_)
                    | DispatchError::UnknownRetryToken => StatusCode::BAD_REQUEST,
                    DispatchError::UnknownAdvertiser(_) | DispatchError::UnknownReport(_) => {
                        StatusCode::NOT_FOUND
                    }
                    DispatchError::NarrativeTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
                    DispatchError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let mut body = json!({
                    "ok": false,
                    "error": err.code(),
                    "message": err.to_string(),
                });
                if let DispatchError::NarrativeTimeout { retry_token } = err {
                    body["retryToken"] = json!(retry_token);
                }
                (status, body)
            }
            ApiError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "INTERNAL", "message": format!("{err:#}") }),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        if status.is_server_error() {
            error!(%status, "Request failed: {self:#}");
        } else {
            debug!(%status, "Request rejected: {self}");
        }
        let mut response = (status, Json(body)).into_response();
        if let ApiError::Ocr(OcrError::RateLimited { retry_after_secs }) = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_body() {
        let err = ApiError::from(OcrError::RateLimited { retry_after_secs: 42 });
        let (status, body) = err.status_and_body();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "RATE_LIMITED");
        assert_eq!(body["retryAfterSecs"], 42);
        assert!(body["message"].as_str().unwrap().contains("42초"));

        let response = err.into_response();
        assert_eq!(response.headers()[RETRY_AFTER], "42");
    }

    #[test]
    fn test_dispatch_statuses() {
        let cases = [
            (DispatchError::MissingAdvertiser, StatusCode::BAD_REQUEST),
            (
                DispatchError::UnknownAdvertiser("x".to_owned()),
                StatusCode::NOT_FOUND,
            ),
            (DispatchError::UnknownRetryToken, StatusCode::BAD_REQUEST),
            (
                DispatchError::Persistence(anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let code = err.code();
            let (status, body) = ApiError::from(err).status_and_body();
            assert_eq!(status, expected);
            assert_eq!(body["ok"], false);
            assert_eq!(body["error"], code);
        }
    }

    #[test]
    fn test_timeout_carries_retry_token() {
        let err = DispatchError::NarrativeTimeout {
            retry_token: "tok".to_owned(),
        };
        let (status, body) = ApiError::from(err).status_and_body();
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["error"], "AI_ANALYSIS_TIMEOUT");
        assert_eq!(body["retryToken"], "tok");
    }

    #[test]
    fn test_ocr_unavailable_is_distinct_from_failure() {
        let (status, body) =
            ApiError::from(OcrError::Unavailable("no key".to_owned())).status_and_body();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "SERVER_OCR_UNAVAILABLE");
        let (status, _) =
            ApiError::from(OcrError::Failed("bad".to_owned())).status_and_body();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
