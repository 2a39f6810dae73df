//! The `estimate` subcommand.

use clap::Args;
use schemars::JsonSchema;

use crate::{
    exposure::{
        ExposureResult, display_days_or_default, estimate, flow::StationFlowData,
        public_data::FlowOpts,
    },
    io::write_json,
    prelude::*,
};

/// Estimate command line arguments.
#[derive(Args, Debug)]
pub struct EstimateOpts {
    /// Station name, such as `공덕`.
    #[clap(long)]
    pub station: String,

    /// Line, such as `5호선`.
    #[clap(long)]
    pub line: String,

    /// Display period in days.
    #[clap(long)]
    pub display_days: Option<u32>,

    /// Multiplier for the estimate. Values above 1 amplify it.
    #[clap(long, default_value = "1.0")]
    pub weight: f64,

    #[command(flatten)]
    pub flow: FlowOpts,

    /// Output path. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// What `estimate` prints.
#[derive(Debug, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateOutput {
    pub flow: StationFlowData,
    pub exposure: ExposureResult,
}

/// The `estimate` subcommand.
#[instrument(level = "debug", skip_all, fields(station = %opts.station, line = %opts.line))]
pub async fn cmd_estimate(opts: &EstimateOpts) -> Result<()> {
    if !opts.weight.is_finite() || opts.weight < 0.0 {
        bail!("--weight must be a non-negative number, got {}", opts.weight);
    }
    let service = opts.flow.clone().into_service();
    let flow = service.fetch_station_flow(&opts.station, &opts.line).await;
    let exposure = estimate(&flow, display_days_or_default(opts.display_days), opts.weight);
    write_json(opts.output_path.as_deref(), &EstimateOutput { flow, exposure }).await
}
