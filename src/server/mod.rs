//! The HTTP server: OCR gateway, report dispatch and report history.

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tokio::net::TcpListener;

use crate::{
    dispatch::Dispatcher, ocr::OcrEngine, prelude::*, rate_limit::ClientRateLimiter,
};

pub mod error;
pub mod routes;

/// Largest request body we accept. Report uploads carry a base64 ZIP of up
/// to a hundred photos.
pub const MAX_BODY_BYTES: usize = 200 * 1024 * 1024;

/// Shared state for all handlers.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub ocr: Arc<dyn OcrEngine>,
    pub rate_limiter: Arc<dyn ClientRateLimiter>,
}

/// Build our router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/capture/ocr", post(routes::capture_ocr))
        .route("/capture/report", post(routes::capture_report))
        .route("/reports", get(routes::list_reports))
        .route("/reports/:id", get(routes::get_report))
        .route("/reports/:id/resend", post(routes::resend_report))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(%addr, "Listening");
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server failed")
}
