//! On-device OCR using the `tesseract` CLI tool.

use std::{collections::BTreeMap, io::Cursor, process::Output};

use image::{DynamicImage, ImageFormat, imageops::FilterType};
use tokio::{fs, process::Command};

use crate::{data_url::ImagePayload, prelude::*};

use super::{OcrEngine, OcrError, OcrText, SizedText, largest_first};

/// Upscale factor before recognition.
const PREPROCESS_SCALE: u32 = 2;

/// Largest side we'll upscale to.
const PREPROCESS_MAX_SIDE: u32 = 4096;

/// Contrast stretch around mid-gray.
const PREPROCESS_CONTRAST: f32 = 1.25;

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    /// Tesseract language list, such as `kor+eng`.
    languages: String,
}

impl TesseractEngine {
    /// Create a new `tesseract` engine.
    pub fn new(languages: impl Into<String>) -> Self {
        Self {
            languages: languages.into(),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new("kor+eng")
    }
}

/// Upscale and boost contrast, which helps with small station signs.
pub fn preprocess(image: &DynamicImage) -> DynamicImage {
    let width = (image.width() * PREPROCESS_SCALE).min(PREPROCESS_MAX_SIDE);
    let height = (image.height() * PREPROCESS_SCALE).min(PREPROCESS_MAX_SIDE);
    let mut resized = image
        .resize_exact(width, height, FilterType::CatmullRom)
        .to_rgb8();
    for pixel in resized.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            let v = f32::from(*channel) / 255.0;
            let out = ((v - 0.5) * PREPROCESS_CONTRAST + 0.5) * 255.0;
            *channel = out.round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgb8(resized)
}

/// Make sure a command succeeded, logging its output.
fn check_for_command_failure(command_name: &str, output: &Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stderr, "Standard error from command");
    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!("{} failed with error output:\n{}", command_name, stderr))
    }
}

/// Parse tesseract's TSV output into text, confidence and sized words.
fn parse_tsv(tsv: &str) -> OcrText {
    // Words grouped by (block, paragraph, line), in reading order.
    let mut lines: BTreeMap<(u32, u32, u32), Vec<String>> = BTreeMap::new();
    let mut words = vec![];
    let mut confidences = vec![];
    for row in tsv.lines().skip(1) {
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }
        let num = |i: usize| cols[i].parse::<u32>().unwrap_or_default();
        let conf = cols[10].parse::<f64>().unwrap_or(-1.0);
        if conf >= 0.0 {
            confidences.push(conf);
        }
        lines
            .entry((num(2), num(3), num(4)))
            .or_default()
            .push(text.to_owned());
        words.push(SizedText {
            text: text.to_owned(),
            area: f64::from(num(8)) * f64::from(num(9)),
        });
    }
    if words.is_empty() {
        return OcrText::empty();
    }
    let text = lines
        .values()
        .map(|words| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        (confidences.iter().sum::<f64>() / confidences.len() as f64 / 100.0).clamp(0.0, 1.0)
    };
    OcrText {
        text,
        confidence,
        text_for_station: largest_first(words),
    }
}

impl TesseractEngine {
    async fn run(&self, image: &ImagePayload) -> Result<OcrText> {
        let decoded =
            image::load_from_memory(&image.data).context("cannot decode image for tesseract")?;
        let prepared = preprocess(&decoded);
        let mut png = Cursor::new(Vec::new());
        prepared
            .write_to(&mut png, ImageFormat::Png)
            .context("cannot encode tesseract input")?;

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_base = tmpdir.path().join("output");
        fs::write(&input_path, png.into_inner())
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file.
        let output = Command::new("tesseract")
            .arg(&input_path)
            .arg(&output_base)
            .arg("-l")
            .arg(&self.languages)
            .arg("tsv")
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output)?;

        let tsv = fs::read_to_string(output_base.with_extension("tsv"))
            .await
            .context("cannot read tesseract output file")?;
        Ok(parse_tsv(&tsv))
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all, fields(mime_type = %image.mime_type))]
    async fn recognize(&self, image: &ImagePayload) -> Result<OcrText, OcrError> {
        self.run(image)
            .await
            .map_err(|err| OcrError::Failed(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn test_preprocess_scales_and_stretches() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 3000, Rgb([100, 128, 200])));
        let out = preprocess(&image).to_rgb8();
        assert_eq!(out.dimensions(), (20, 4096));
        // 100 moves away from mid-gray, 200 toward white.
        let Rgb([r, _, b]) = *out.get_pixel(5, 5);
        assert!(r < 100);
        assert!(b > 200);
    }

    #[test]
    fn test_parse_tsv() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
            1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t\n\
            5\t1\t1\t1\t1\t1\t10\t10\t40\t20\t91.5\t출구\n\
            5\t1\t1\t1\t1\t2\t60\t10\t30\t20\t88.5\t2\n\
            5\t1\t2\t1\t1\t1\t10\t100\t300\t150\t96\t공덕\n";
        let ocr = parse_tsv(tsv);
        assert_eq!(ocr.text, "출구 2\n공덕");
        assert_eq!(ocr.text_for_station.as_deref(), Some("공덕 출구 2"));
        assert!((ocr.confidence - 0.92).abs() < 1e-9);
        assert_eq!(parse_tsv("level\n"), OcrText::empty());
    }

    #[tokio::test]
    #[ignore = "requires the tesseract CLI with Korean language data"]
    async fn test_tesseract_runs() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 50, Rgb([255, 255, 255])));
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png).unwrap();
        let payload = ImagePayload::from_bytes(png.into_inner());
        let ocr = TesseractEngine::default().recognize(&payload).await.unwrap();
        assert!(ocr.is_empty());
    }
}
