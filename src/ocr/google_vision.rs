//! OCR using Google Cloud Vision `TEXT_DETECTION`.

use leaky_bucket::RateLimiter;

use crate::{data_url::ImagePayload, prelude::*};

use super::{OcrEngine, OcrError, OcrText, SizedText, largest_first};

/// The annotate endpoint.
const VISION_API_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Vision doesn't report a confidence for plain text detection.
const VISION_CONFIDENCE: f64 = 0.95;

/// OCR engine wrapping the Google Vision REST API.
pub struct GoogleVisionEngine {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
    rate_limiter: Option<RateLimiter>,
}

impl GoogleVisionEngine {
    /// Create a new engine. Without an API key, every call reports the
    /// provider as unavailable.
    pub fn new(api_key: Option<String>, rate_limiter: Option<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            endpoint: VISION_API_URL.to_owned(),
            rate_limiter,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<FullText>,
    #[serde(default)]
    text_annotations: Vec<TextAnnotation>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FullText {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextAnnotation {
    description: Option<String>,
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

impl TextAnnotation {
    /// Area of the axis-aligned bounding box.
    fn area(&self) -> f64 {
        let vertices = match &self.bounding_poly {
            Some(poly) if poly.vertices.len() >= 2 => &poly.vertices,
            _ => return 0.0,
        };
        let (mut min_x, mut max_x) = (f64::MAX, 0.0f64);
        let (mut min_y, mut max_y) = (f64::MAX, 0.0f64);
        for v in vertices {
            min_x = min_x.min(v.x);
            max_x = max_x.max(v.x);
            min_y = min_y.min(v.y);
            max_y = max_y.max(v.y);
        }
        (max_x - min_x).max(0.0) * (max_y - min_y).max(0.0)
    }
}

/// Turn the first image response into [`OcrText`].
fn parse_response(response: AnnotateResponse) -> Result<OcrText, OcrError> {
    let Some(first) = response.responses.into_iter().next() else {
        return Ok(OcrText::empty());
    };
    if let Some(error) = first.error {
        return Err(OcrError::Failed(format!("Vision error: {error}")));
    }

    // The first text annotation is the whole text. The rest are words.
    let full_text = first
        .full_text_annotation
        .and_then(|f| f.text)
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());
    let fallback_text = first
        .text_annotations
        .first()
        .and_then(|a| a.description.as_deref())
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());
    let Some(text) = full_text.or(fallback_text) else {
        return Ok(OcrText::empty());
    };

    let words = first
        .text_annotations
        .iter()
        .skip(1)
        .map(|a| SizedText {
            text: a.description.clone().unwrap_or_default(),
            area: a.area(),
        })
        .collect::<Vec<_>>();
    Ok(OcrText {
        text,
        confidence: VISION_CONFIDENCE,
        text_for_station: largest_first(words),
    })
}

#[async_trait]
impl OcrEngine for GoogleVisionEngine {
    fn name(&self) -> &'static str {
        "google-vision"
    }

    #[instrument(level = "debug", skip_all, fields(mime_type = %image.mime_type))]
    async fn recognize(&self, image: &ImagePayload) -> Result<OcrText, OcrError> {
        let Some(api_key) = &self.api_key else {
            return Err(OcrError::Unavailable(
                "GOOGLE_CLOUD_VISION_API_KEY is not set".to_owned(),
            ));
        };
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let body = json!({
            "requests": [{
                "image": { "content": image.to_base64() },
                "features": [{ "type": "TEXT_DETECTION", "maxResults": 1 }],
            }],
        });
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|err| OcrError::Unavailable(format!("cannot reach Vision: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(%status, %detail, "Vision request failed");
            // Bad keys, quota and outages all mean "use something else".
            return Err(OcrError::Unavailable(format!("Vision returned {status}")));
        }
        let parsed = response
            .json::<AnnotateResponse>()
            .await
            .map_err(|err| OcrError::Failed(format!("bad Vision response: {err}")))?;
        let ocr = parse_response(parsed)?;
        debug!(chars = ocr.text.len(), "Vision recognized text");
        Ok(ocr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_words_by_area() {
        let response: AnnotateResponse = serde_json::from_value(json!({
            "responses": [{
                "fullTextAnnotation": { "text": "출구\n529 공덕\n" },
                "textAnnotations": [
                    { "description": "출구\n529 공덕" },
                    {
                        "description": "출구",
                        "boundingPoly": { "vertices": [
                            {"x": 0, "y": 0}, {"x": 10, "y": 0},
                            {"x": 10, "y": 5}, {"x": 0, "y": 5}
                        ]}
                    },
                    {
                        "description": "529",
                        "boundingPoly": { "vertices": [
                            {"x": 0, "y": 10}, {"x": 30, "y": 10},
                            {"x": 30, "y": 30}, {"x": 0, "y": 30}
                        ]}
                    },
                    {
                        "description": "공덕",
                        "boundingPoly": { "vertices": [
                            {"x": 40, "y": 10}, {"x": 140, "y": 10},
                            {"x": 140, "y": 60}, {"y": 60}
                        ]}
                    }
                ]
            }]
        }))
        .unwrap();
        let ocr = parse_response(response).unwrap();
        assert_eq!(ocr.text, "출구\n529 공덕");
        assert_eq!(ocr.confidence, VISION_CONFIDENCE);
        assert_eq!(ocr.text_for_station.as_deref(), Some("공덕 529 출구"));
    }

    #[test]
    fn test_parse_no_text() {
        let response: AnnotateResponse =
            serde_json::from_value(json!({ "responses": [{}] })).unwrap();
        assert_eq!(parse_response(response).unwrap(), OcrText::empty());

        let response: AnnotateResponse = serde_json::from_value(json!({
            "responses": [{ "error": { "code": 3, "message": "Bad image data." } }]
        }))
        .unwrap();
        assert!(matches!(parse_response(response), Err(OcrError::Failed(_))));
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let engine = GoogleVisionEngine::new(Some("  ".to_owned()), None);
        let image = ImagePayload::from_bytes(vec![1, 2, 3]);
        assert!(matches!(
            engine.recognize(&image).await,
            Err(OcrError::Unavailable(_))
        ));
    }
}
