//! The `serve` subcommand.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Args;
use tokio::net::TcpListener;

use crate::{
    advertisers::AdvertiserDirectory,
    dispatch::{
        Dispatcher,
        email::MailOpts,
        narrative::NarrativeOpts,
        store::SqliteReportStore,
    },
    exposure::public_data::FlowOpts,
    ocr::OcrOpts,
    prelude::*,
    rate_limit::{InMemoryRateLimiter, RateLimit},
    report::deck::DeckTemplate,
    server::{AppState, serve},
};

/// Server command line arguments.
#[derive(Args, Debug)]
pub struct ServeOpts {
    /// Address to listen on.
    #[clap(long, env = "ADMATE_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Advertiser directory (JSON or TOML).
    #[clap(long, env = "ADMATE_ADVERTISERS")]
    pub advertisers: PathBuf,

    /// SQLite database for the report history.
    #[clap(long, env = "ADMATE_DATABASE", default_value = "admate-reports.sqlite3")]
    pub database: PathBuf,

    /// Per-client limit for `/capture/ocr`, of the form "30/m".
    #[clap(long, env = "ADMATE_OCR_RATE_LIMIT", default_value = "30/m")]
    pub ocr_rate_limit: RateLimit,

    /// Directory with deck template images (`title.png`, `map.png`, ...).
    #[clap(long)]
    pub deck_template_dir: Option<PathBuf>,

    #[command(flatten)]
    pub ocr: OcrOpts,

    #[command(flatten)]
    pub flow: FlowOpts,

    #[command(flatten)]
    pub narrative: NarrativeOpts,

    #[command(flatten)]
    pub mail: MailOpts,
}

/// Wait for Ctrl-C.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all, fields(listen = %opts.listen))]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    let advertisers = AdvertiserDirectory::load(&opts.advertisers).await?;
    let store = SqliteReportStore::open(&opts.database)?;

    let deck_template = match &opts.deck_template_dir {
        Some(dir) => DeckTemplate::load(dir).await,
        None => DeckTemplate::default(),
    };
    let dispatcher = Dispatcher::new(
        Arc::new(advertisers),
        Arc::new(opts.flow.clone().into_service()),
        opts.narrative.create_generator().await?,
        Arc::new(store),
        Arc::new(opts.mail.clone().into_mailer()),
    )
    .with_narrative_timeout(Duration::from_secs(opts.narrative.narrative_timeout))
    .with_from_email(opts.mail.from_email.clone())
    .with_deck_renderer(deck_template);

    let state = Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
        ocr: opts.ocr.create_engine().await?,
        rate_limiter: Arc::new(InMemoryRateLimiter::new(opts.ocr_rate_limit.clone())),
    });

    let listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", opts.listen))?;
    serve(listener, state, shutdown_signal()).await
}
