use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod advertisers;
mod capture;
mod cmd;
mod data_url;
mod dispatch;
mod drivers;
mod exposure;
mod io;
mod llm_client;
mod matching;
mod ocr;
mod prelude;
mod prompt;
mod rate_limit;
mod report;
mod retry;
mod schema;
mod server;
mod ui;

/// Photograph subway station ads and send exposure reports to advertisers.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - ADMATE_ADVERTISERS: Advertiser directory (JSON or TOML).
  - ADMATE_SERVER (optional): Report server URL for `send` and `ocr`.
  - GOOGLE_CLOUD_VISION_API_KEY (optional): Enables server-side OCR.
  - OPENAI_API_KEY (optional): Enables AI narratives. Without it, reports
    use a narrative derived from the traffic data.
  - OPENAI_API_BASE (optional): Override the OpenAI-compatible server URL.
  - DATA_GO_KR_SERVICE_KEY, DATA_GO_KR_STATION_FLOW_ENDPOINT (optional):
    Real station ridership. Without them, built-in estimates are used.
  - RESEND_API_KEY (optional): Email delivery. Without it, reports are
    saved to the history but not sent.

  Standard AWS environment variables and credential files
  are used for `--ocr-provider textract`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
#[allow(clippy::large_enum_variant)]
enum Cmd {
    /// Run the report server.
    Serve(cmd::serve::ServeOpts),
    /// Record station visits and photos in a capture session file.
    Session(cmd::session::SessionOpts),
    /// Recognize a capture session and send it as a report.
    Send(cmd::send::SendOpts),
    /// Recognize stations and advertisers in image files.
    Ocr(cmd::ocr::OcrCmdOpts),
    /// Estimate ad exposure for a station.
    Estimate(cmd::estimate::EstimateOpts),
    /// Print schemas for request and response formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Serve(_) => false,
            Cmd::Session(_) => true,
            Cmd::Send(opts) => opts.output_path.is_none(),
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Estimate(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Options hold API keys, so we don't log them.
    let opts = Opts::parse();

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Serve(opts) => cmd::serve::cmd_serve(opts).await,
        Cmd::Session(opts) => cmd::session::cmd_session(opts).await,
        Cmd::Send(opts) => cmd::send::cmd_send(ui, opts).await,
        Cmd::Ocr(opts) => cmd::ocr::cmd_ocr(ui, opts).await,
        Cmd::Estimate(opts) => cmd::estimate::cmd_estimate(opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
