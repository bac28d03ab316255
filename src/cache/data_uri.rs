//! `data:` URI payloads for cached preview images

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// A base64 `data:<mime>;base64,<payload>` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri(String);

impl DataUri {
    /// Encode image bytes with their MIME type
    pub fn encode(mime: &str, bytes: &[u8]) -> Self {
        Self(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
    }

    /// Accept a stored string if it has the `data:<mime>;base64,` shape
    pub fn parse(value: String) -> Option<Self> {
        let rest = value.strip_prefix("data:")?;
        let (mime, _) = rest.split_once(";base64,")?;
        if mime.is_empty() {
            return None;
        }
        Some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// MIME type part of the URI
    pub fn mime(&self) -> &str {
        self.0
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .map(|(mime, _)| mime)
            .unwrap_or_default()
    }

    /// Decode the payload back to image bytes
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let payload = self
            .0
            .split_once(";base64,")
            .map(|(_, payload)| payload)
            .unwrap_or_default();
        STANDARD.decode(payload)
    }
}

impl fmt::Display for DataUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
