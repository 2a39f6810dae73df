//! OCR using AWS Textract.

use aws_config::BehaviorVersion;
use aws_sdk_textract::{
    primitives::Blob,
    types::{Block, BlockType, Document},
};
use leaky_bucket::RateLimiter;

use crate::{data_url::ImagePayload, prelude::*};

use super::{OcrEngine, OcrError, OcrText, SizedText, largest_first};

/// OCR engine wrapping the AWS Textract API.
pub struct TextractEngine {
    /// AWS Textract client.
    client: aws_sdk_textract::Client,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: Option<RateLimiter>,
}

impl TextractEngine {
    /// Create an engine from the standard AWS environment and credential
    /// files.
    pub async fn new(rate_limiter: Option<RateLimiter>) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await;
        Self {
            client: aws_sdk_textract::Client::new(&config),
            rate_limiter,
        }
    }
}

/// Build [`OcrText`] from Textract's `LINE` blocks.
fn lines_to_text(blocks: &[Block]) -> OcrText {
    let lines = blocks
        .iter()
        .filter(|block| block.block_type() == Some(&BlockType::Line))
        .filter_map(|block| {
            let text = block.text()?.trim();
            if text.is_empty() {
                return None;
            }
            let area = block
                .geometry()
                .and_then(|g| g.bounding_box())
                .map(|b| f64::from(b.width()) * f64::from(b.height()))
                .unwrap_or_default();
            let confidence = block.confidence().map(f64::from);
            Some((text.to_owned(), area, confidence))
        })
        .collect::<Vec<_>>();
    if lines.is_empty() {
        return OcrText::empty();
    }

    let text = lines
        .iter()
        .map(|(text, _, _)| text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let confidences = lines.iter().filter_map(|(_, _, c)| *c).collect::<Vec<_>>();
    // Textract reports percentages.
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64 / 100.0
    };
    let sized = lines
        .into_iter()
        .map(|(text, area, _)| SizedText { text, area })
        .collect();
    OcrText {
        text,
        confidence,
        text_for_station: largest_first(sized),
    }
}

#[async_trait]
impl OcrEngine for TextractEngine {
    fn name(&self) -> &'static str {
        "textract"
    }

    #[instrument(level = "debug", skip_all, fields(mime_type = %image.mime_type))]
    async fn recognize(&self, image: &ImagePayload) -> Result<OcrText, OcrError> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        // TODO: Textract only takes JPEG and PNG, so WEBP photos should be
        // re-encoded first.
        let document = Document::builder()
            .bytes(Blob::new(image.data.clone()))
            .build();
        let response = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await
            .map_err(|e| {
                error!("AWS Textract error: {e:?}");
                OcrError::Unavailable(format!("AWS Textract error: {e}"))
            })?;
        trace!("Document response: {response:#?}");
        let ocr = lines_to_text(response.blocks());
        debug!(chars = ocr.text.len(), "Textract recognized text");
        Ok(ocr)
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_textract::types::{BoundingBox, Geometry};

    use super::*;

    fn line(text: &str, width: f32, height: f32, confidence: f32) -> Block {
        Block::builder()
            .block_type(BlockType::Line)
            .text(text)
            .confidence(confidence)
            .geometry(
                Geometry::builder()
                    .bounding_box(BoundingBox::builder().width(width).height(height).build())
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_lines_to_text() {
        let blocks = vec![
            line("출구 2", 0.1, 0.05, 90.0),
            line("공덕", 0.5, 0.3, 99.0),
            Block::builder().block_type(BlockType::Word).text("공덕").build(),
            line("Gongdeok", 0.3, 0.1, 96.0),
        ];
        let ocr = lines_to_text(&blocks);
        assert_eq!(ocr.text, "출구 2\n공덕\nGongdeok");
        assert_eq!(ocr.text_for_station.as_deref(), Some("공덕 Gongdeok 출구 2"));
        assert!((ocr.confidence - 0.95).abs() < 1e-6);
        assert_eq!(lines_to_text(&[]), OcrText::empty());
    }
}
