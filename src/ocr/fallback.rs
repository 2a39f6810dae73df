//! Try one engine, then another.

use std::sync::Arc;

use crate::{data_url::ImagePayload, prelude::*};

use super::{OcrEngine, OcrError, OcrText};

/// Uses `primary`, switching to `secondary` on any failure except a rate
/// limit. Rate limits go back to the user so we don't hammer the limiter.
pub struct FallbackOcr {
    primary: Arc<dyn OcrEngine>,
    secondary: Arc<dyn OcrEngine>,
}

impl FallbackOcr {
    /// Create a fallback chain.
    pub fn new(primary: Arc<dyn OcrEngine>, secondary: Arc<dyn OcrEngine>) -> Self {
        Self { primary, secondary }
    }
}

/// Should this primary failure go to the secondary engine?
pub fn should_fall_back(err: &OcrError) -> bool {
    !matches!(err, OcrError::RateLimited { .. })
}

#[async_trait]
impl OcrEngine for FallbackOcr {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn recognize(&self, image: &ImagePayload) -> Result<OcrText, OcrError> {
        match self.primary.recognize(image).await {
            Ok(ocr) => Ok(ocr),
            Err(err) if should_fall_back(&err) => {
                warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    "Primary OCR failed, falling back: {err}"
                );
                self.secondary.recognize(image).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// An engine that always returns the same result and counts calls.
    pub(crate) struct FixedEngine {
        pub result: Result<OcrText, OcrError>,
        pub calls: AtomicUsize,
    }

    impl FixedEngine {
        pub(crate) fn new(result: Result<OcrText, OcrError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn text(text: &str) -> Arc<Self> {
            Self::new(Ok(OcrText {
                text: text.to_owned(),
                confidence: 0.9,
                text_for_station: None,
            }))
        }
    }

    #[async_trait]
    impl OcrEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn recognize(&self, _image: &ImagePayload) -> Result<OcrText, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn image() -> ImagePayload {
        ImagePayload::from_bytes(vec![0xff, 0xd8, 0xff])
    }

    #[tokio::test]
    async fn test_primary_success_skips_secondary() {
        let primary = FixedEngine::text("server");
        let secondary = FixedEngine::text("local");
        let chain = FallbackOcr::new(primary.clone(), secondary.clone());
        assert_eq!(chain.recognize(&image()).await.unwrap().text, "server");
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unavailable_falls_back() {
        for err in [
            OcrError::Unavailable("down".to_owned()),
            OcrError::Failed("bad".to_owned()),
        ] {
            let secondary = FixedEngine::text("local");
            let chain = FallbackOcr::new(FixedEngine::new(Err(err)), secondary.clone());
            assert_eq!(chain.recognize(&image()).await.unwrap().text, "local");
            assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_rate_limit_is_surfaced() {
        let secondary = FixedEngine::text("local");
        let chain = FallbackOcr::new(
            FixedEngine::new(Err(OcrError::RateLimited { retry_after_secs: 30 })),
            secondary.clone(),
        );
        assert_eq!(
            chain.recognize(&image()).await,
            Err(OcrError::RateLimited { retry_after_secs: 30 })
        );
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }
}
