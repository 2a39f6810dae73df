//! Converting binary image data to and from `data:` URLs.

use std::sync::LazyLock;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use regex::Regex;

use crate::prelude::*;

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    let base64_data = BASE64_STANDARD.encode(data);
    // Some sources indicate that the Base64 data should be percent-encoded, but
    // in practice browsers and OCR providers accept it as-is.
    format!("data:{};base64,{}", mime_type, base64_data)
}

/// Regex for parsing a `data:` URL.
static DATA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^data:(?P<mime_type>[^;,]+);base64,(?P<data>.+)$")
        .expect("failed to compile data URL regex")
});

/// Parse a `data:` URL into a MIME type and Base64-encoded data.
pub fn parse_data_url(data_url: &str) -> Option<(String, &str)> {
    let caps = DATA_URL_RE.captures(data_url.trim())?;
    let mime_type = caps.name("mime_type")?.as_str().to_string();
    let data = caps.name("data")?.as_str().trim();
    Some((mime_type, data))
}

/// An image held in memory, along with its MIME type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePayload {
    /// The MIME type of our data, such as `image/jpeg`.
    pub mime_type: String,
    /// The encoded image bytes.
    pub data: Vec<u8>,
}

impl ImagePayload {
    /// Wrap raw bytes, sniffing the MIME type from the content.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mime_type = infer::get(&data)
            .map(|kind| kind.mime_type().to_owned())
            .unwrap_or_else(|| "image/jpeg".to_owned());
        Self { mime_type, data }
    }

    /// Decode a `data:image/...;base64,...` URL.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let (mime_type, base64_data) =
            parse_data_url(url).ok_or_else(|| anyhow!("not a base64 data URL"))?;
        if !mime_type.starts_with("image/") {
            bail!("data URL does not contain an image: {mime_type}");
        }
        let data = BASE64_STANDARD
            .decode(base64_data)
            .context("invalid base64 in data URL")?;
        Ok(Self { mime_type, data })
    }

    /// Load an image from disk.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read image {:?}", path))?;
        let mut payload = Self::from_bytes(data);
        if infer::get(&payload.data).is_none()
            && let Some(guess) = mime_guess::from_path(path).first()
        {
            payload.mime_type = guess.essence_str().to_owned();
        }
        Ok(payload)
    }

    /// Convert to a data URL.
    pub fn to_data_url(&self) -> String {
        data_url(&self.mime_type, &self.data)
    }

    /// The Base64 payload, without the `data:` prefix.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }

    /// A file extension for this image, sniffed from the bytes when
    /// possible and otherwise taken from the MIME type.
    pub fn extension(&self) -> &'static str {
        if let Some(kind) = infer::get(&self.data)
            && kind.matcher_type() == infer::MatcherType::Image
        {
            return kind.extension();
        }
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/gif" => "gif",
            "image/webp" => "webp",
            _ => "jpg",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_url() {
        let (mime, data) = parse_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "aGVsbG8=");
        assert!(parse_data_url("image/png;base64,aGVsbG8=").is_none());
    }

    #[test]
    fn test_payload_from_data_url() {
        let payload = ImagePayload::from_data_url("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(payload.data, b"hello");
        assert_eq!(payload.to_data_url(), "data:image/jpeg;base64,aGVsbG8=");
        assert!(ImagePayload::from_data_url("data:text/plain;base64,aGVsbG8=").is_err());
        assert!(ImagePayload::from_data_url("data:image/jpeg;base64,@@@").is_err());
    }

    #[test]
    fn test_extension_prefers_content() {
        // PNG signature, labelled as JPEG.
        let png = ImagePayload {
            mime_type: "image/jpeg".to_owned(),
            data: b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec(),
        };
        assert_eq!(png.extension(), "png");

        let unknown = ImagePayload {
            mime_type: "image/webp".to_owned(),
            data: b"????".to_vec(),
        };
        assert_eq!(unknown.extension(), "webp");
    }
}
