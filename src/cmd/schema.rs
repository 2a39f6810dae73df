//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    capture::{resolve::VisitMeta, session::CaptureSession},
    dispatch::{
        ReportRequest, ReportResponse,
        store::{ReportDetail, ReportSummary},
    },
    exposure::ExposureResult,
    io::write_json,
    ocr::OcrText,
    prelude::*,
    report::AiAnalysis,
    server::routes::OcrRequest,
};

use super::{estimate::EstimateOutput, ocr::OcrRecord};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// Body of `POST /capture/ocr`.
    OcrRequest,
    /// Successful response of `POST /capture/ocr`.
    OcrText,
    /// Body of `POST /capture/report`.
    ReportRequest,
    /// Response of `POST /capture/report`.
    ReportResponse,
    /// An item of `GET /reports`.
    ReportSummary,
    /// Response of `GET /reports/:id`.
    ReportDetail,
    /// The AI analysis object.
    AiAnalysis,
    /// Exposure estimate.
    ExposureResult,
    /// A capture session file.
    CaptureSession,
    /// A resolved visit.
    VisitMeta,
    /// Output of `ocr`.
    OcrRecord,
    /// Output of `estimate`.
    EstimateOutput,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::OcrRequest => schema_for!(OcrRequest),
        SchemaType::OcrText => schema_for!(OcrText),
        SchemaType::ReportRequest => schema_for!(ReportRequest),
        SchemaType::ReportResponse => schema_for!(ReportResponse),
        SchemaType::ReportSummary => schema_for!(ReportSummary),
        SchemaType::ReportDetail => schema_for!(ReportDetail),
        SchemaType::AiAnalysis => schema_for!(AiAnalysis),
        SchemaType::ExposureResult => schema_for!(ExposureResult),
        SchemaType::CaptureSession => schema_for!(CaptureSession),
        SchemaType::VisitMeta => schema_for!(VisitMeta),
        SchemaType::OcrRecord => schema_for!(OcrRecord),
        SchemaType::EstimateOutput => schema_for!(EstimateOutput),
    };
    write_json(schema_opts.output_path.as_deref(), &schema).await
}
