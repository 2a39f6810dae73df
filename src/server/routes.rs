//! Request handlers.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json,
    extract::{ConnectInfo, Path as UrlPath, Query, State, rejection::JsonRejection},
    http::HeaderMap,
};
use schemars::JsonSchema;

use crate::{
    data_url::ImagePayload,
    dispatch::{
        DispatchError, ReportRequest, ReportResponse,
        store::{ReportDetail, ReportSummary},
    },
    ocr::{OcrError, OcrText},
    prelude::*,
    rate_limit::RateDecision,
};

use super::{AppState, error::ApiError};

/// Default page size for `GET /reports`.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Largest page size for `GET /reports`.
const MAX_LIST_LIMIT: usize = 500;

/// Body of `POST /capture/ocr`.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRequest {
    /// The photo, as a `data:` URL.
    pub image_data_url: String,
}

/// Query string of `GET /reports`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    limit: Option<usize>,
}

/// Identify the caller for rate limiting.
///
/// The first `X-Forwarded-For` hop wins, then `X-Real-IP`, then the socket
/// peer.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    if let Some(forwarded) = header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return forwarded.to_owned();
    }
    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_owned();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_owned(),
    }
}

/// `POST /capture/ocr`
#[instrument(level = "debug", skip_all)]
pub async fn capture_ocr(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<OcrRequest>, JsonRejection>,
) -> Result<Json<OcrText>, ApiError> {
    let client = client_key(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    if let RateDecision::Limited { retry_after } = state.rate_limiter.check(&client) {
        let retry_after_secs = (retry_after.as_secs_f64().ceil() as u64).max(1);
        return Err(OcrError::RateLimited { retry_after_secs }.into());
    }

    let Json(request) = body.map_err(|err| ApiError::InvalidBody(err.body_text()))?;
    let image = ImagePayload::from_data_url(&request.image_data_url)
        .map_err(|err| ApiError::InvalidBody(format!("{err:#}")))?;
    let text = state.ocr.recognize(&image).await?;
    debug!(
        engine = state.ocr.name(),
        chars = text.text.chars().count(),
        "OCR complete"
    );
    Ok(Json(text))
}

/// `POST /capture/report`
#[instrument(level = "debug", skip_all)]
pub async fn capture_report(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ReportRequest>, JsonRejection>,
) -> Result<Json<ReportResponse>, ApiError> {
    let Json(request) = body.map_err(|err| ApiError::InvalidBody(err.body_text()))?;
    Ok(Json(state.dispatcher.dispatch(request).await?))
}

/// `GET /reports`
pub async fn list_reports(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ReportSummary>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.dispatcher.store().list(limit).await?))
}

/// `GET /reports/:id`
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ReportDetail>, ApiError> {
    match state.dispatcher.store().get(&id).await? {
        Some(detail) => Ok(Json(detail)),
        None => Err(DispatchError::UnknownReport(id).into()),
    }
}

/// `POST /reports/:id/resend`
pub async fn resend_report(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ReportResponse>, ApiError> {
    Ok(Json(state.dispatcher.resend(&id).await?))
}
