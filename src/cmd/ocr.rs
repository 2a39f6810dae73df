//! The `ocr` subcommand.

use std::sync::Arc;

use clap::{Args, ValueEnum};
use futures::{StreamExt as _, stream};
use schemars::JsonSchema;

use crate::{
    advertisers::AdvertiserDirectory,
    data_url::ImagePayload,
    io::write_jsonl,
    matching::{
        advertiser::{AdvertiserMatch, match_advertiser},
        line_color::line_from_image,
        station::{StationGuess, infer_station},
    },
    ocr::{
        OcrEngine, OcrOpts, fallback::FallbackOcr, gateway::GatewayOcrClient,
        tesseract::TesseractEngine,
    },
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Where OCR runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OcrSource {
    /// The report server, falling back to local `tesseract`.
    #[default]
    Server,
    /// Local `tesseract` only.
    Local,
    /// Call the configured cloud provider directly.
    Provider,
}

/// OCR command line arguments.
#[derive(Args, Debug)]
pub struct OcrCmdOpts {
    /// Images to recognize.
    #[clap(required = true)]
    pub images: Vec<PathBuf>,

    /// Advertiser directory, to also match advertisers.
    #[clap(long, env = "ADMATE_ADVERTISERS")]
    pub advertisers: Option<PathBuf>,

    /// Which OCR engine to use.
    #[clap(long, value_enum, default_value_t)]
    pub source: OcrSource,

    /// Base URL of the report server.
    #[clap(long, env = "ADMATE_SERVER", default_value = "http://127.0.0.1:8080")]
    pub server: String,

    /// Languages for local OCR.
    #[clap(long, default_value = "kor+eng")]
    pub tesseract_langs: String,

    #[command(flatten)]
    pub ocr: OcrOpts,

    /// Max number of images to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// Output path for JSONL. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

impl OcrCmdOpts {
    async fn engine(&self) -> Result<Arc<dyn OcrEngine>> {
        let local = Arc::new(TesseractEngine::new(self.tesseract_langs.clone()));
        Ok(match self.source {
            OcrSource::Server => Arc::new(FallbackOcr::new(
                Arc::new(GatewayOcrClient::new(&self.server)),
                local,
            )),
            OcrSource::Local => local,
            OcrSource::Provider => self.ocr.create_engine().await?,
        })
    }
}

/// One line of `ocr` output.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRecord {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub station: StationGuess,
    /// Line guessed from the sign's color.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_from_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertiser: Option<AdvertiserMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OcrRecord {
    fn failed(path: &Path, err: impl std::fmt::Display) -> Self {
        Self {
            path: path.to_owned(),
            text: None,
            confidence: None,
            station: StationGuess::default(),
            line_from_color: None,
            advertiser: None,
            error: Some(err.to_string()),
        }
    }
}

/// Recognize one image.
async fn recognize_file(
    engine: &dyn OcrEngine,
    directory: Option<&AdvertiserDirectory>,
    path: &Path,
) -> OcrRecord {
    let image = match ImagePayload::from_path(path).await {
        Ok(image) => image,
        Err(err) => return OcrRecord::failed(path, format!("{err:#}")),
    };
    match engine.recognize(&image).await {
        Ok(ocr) => OcrRecord {
            path: path.to_owned(),
            station: infer_station(ocr.station_text()),
            line_from_color: line_from_image(&image.data).map(str::to_owned),
            advertiser: directory.and_then(|d| match_advertiser(&ocr.text, d.all())),
            confidence: Some(ocr.confidence),
            text: Some(ocr.text),
            error: None,
        },
        Err(err) => OcrRecord::failed(path, err),
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrCmdOpts) -> Result<()> {
    let engine = opts.engine().await?;
    let directory = match &opts.advertisers {
        Some(path) => Some(AdvertiserDirectory::load(path).await?),
        None => None,
    };

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📷",
            msg: "Recognizing images",
            done_msg: "Recognized images",
        },
        opts.images.len() as u64,
    );
    let records = pb
        .wrap_stream(
            stream::iter(&opts.images)
                .map(|path| recognize_file(engine.as_ref(), directory.as_ref(), path))
                .buffered(opts.job_count.max(1)),
        )
        .collect::<Vec<_>>()
        .await;

    let failed = records.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        warn!(failed, total = records.len(), "Some images could not be recognized");
    }
    write_jsonl(opts.output_path.as_deref(), &records).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{OcrError, fallback::tests::FixedEngine};

    #[tokio::test]
    async fn test_recognize_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sign.png");
        let mut png = Vec::new();
        image::RgbImage::from_pixel(4, 4, image::Rgb([255, 255, 255]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        tokio::fs::write(&path, png).await.unwrap();

        let engine = FixedEngine::text("529 공덕역");
        let record = recognize_file(engine.as_ref(), None, &path).await;
        assert_eq!(record.error, None);
        assert_eq!(record.station.station_name.as_deref(), Some("공덕"));
        assert_eq!(record.station.subway_line.as_deref(), Some("5호선"));

        let broken = FixedEngine::new(Err(OcrError::Failed("boom".to_owned())));
        let record = recognize_file(broken.as_ref(), None, &path).await;
        assert!(record.error.unwrap().contains("boom"));

        let missing = recognize_file(engine.as_ref(), None, &dir.path().join("nope.png")).await;
        assert!(missing.error.is_some());
    }
}
