use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const DEFAULT_FALLBACK_MEDIA_TYPE: &str = "image/png";

/// Lenient codec for `data:<media-type>;base64,<payload>` strings.
///
/// Malformed headers never fail decoding: the media type falls back to
/// `fallback_media_type`. A string without a comma is treated as a bare
/// base64 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrlPolicy {
    pub fallback_media_type: String,
}

impl Default for DataUrlPolicy {
    fn default() -> Self {
        Self {
            fallback_media_type: DEFAULT_FALLBACK_MEDIA_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDataUrl {
    pub media_type: String,
    pub payload: String,
}

impl DataUrlPolicy {
    pub fn new(fallback_media_type: impl Into<String>) -> Self {
        let fallback = fallback_media_type.into();
        if fallback.trim().is_empty() {
            return Self::default();
        }
        Self {
            fallback_media_type: fallback.trim().to_string(),
        }
    }

    pub fn decode(&self, data_url: &str) -> DecodedDataUrl {
        let trimmed = data_url.trim();
        let Some((header, payload)) = trimmed.split_once(',') else {
            return DecodedDataUrl {
                media_type: self.fallback_media_type.clone(),
                payload: trimmed.to_string(),
            };
        };
        DecodedDataUrl {
            media_type: header_media_type(header)
                .unwrap_or(self.fallback_media_type.as_str())
                .to_string(),
            payload: payload.trim().to_string(),
        }
    }

    pub fn decode_bytes(&self, data_url: &str) -> Result<(String, Vec<u8>)> {
        let decoded = self.decode(data_url);
        let bytes = BASE64
            .decode(decoded.payload.as_bytes())
            .context("data URL payload is not valid base64")?;
        Ok((decoded.media_type, bytes))
    }
}

pub fn encode_data_url(media_type: &str, bytes: &[u8]) -> String {
    format!("data:{media_type};base64,{}", BASE64.encode(bytes))
}

pub fn data_url_from_base64(media_type: &str, payload: &str) -> String {
    format!("data:{media_type};base64,{payload}")
}

/// Media type declared by the header, with no fallback applied.
pub fn declared_media_type(data_url: &str) -> Option<&str> {
    let (header, _) = data_url.trim().split_once(',')?;
    header_media_type(header)
}

pub fn is_image_data_url(data_url: &str) -> bool {
    declared_media_type(data_url)
        .map(|media_type| media_type.starts_with("image/"))
        .unwrap_or(false)
}

fn header_media_type(header: &str) -> Option<&str> {
    let (_, rest) = header.split_once(':')?;
    let (media_type, _) = rest.split_once(';')?;
    let media_type = media_type.trim();
    if media_type.is_empty() {
        return None;
    }
    Some(media_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_extracts_media_type_and_payload() {
        let decoded = DataUrlPolicy::default().decode("data:image/jpeg;base64,QUJD");
        assert_eq!(decoded.media_type, "image/jpeg");
        assert_eq!(decoded.payload, "QUJD");
    }

    #[test]
    fn decode_falls_back_when_header_is_malformed() {
        let policy = DataUrlPolicy::default();
        assert_eq!(policy.decode("garbage,QUJD").media_type, "image/png");
        assert_eq!(policy.decode("data:;base64,QUJD").media_type, "image/png");
        assert_eq!(policy.decode("data:image/webp,QUJD").media_type, "image/png");
    }

    #[test]
    fn decode_without_comma_keeps_whole_input_as_payload() {
        let decoded = DataUrlPolicy::default().decode("  QUJD ");
        assert_eq!(decoded.media_type, DEFAULT_FALLBACK_MEDIA_TYPE);
        assert_eq!(decoded.payload, "QUJD");
    }

    #[test]
    fn fallback_media_type_is_configurable() {
        let policy = DataUrlPolicy::new("image/webp");
        assert_eq!(policy.decode("nonsense").media_type, "image/webp");
        assert_eq!(DataUrlPolicy::new("  ").fallback_media_type, "image/png");
    }

    #[test]
    fn decode_bytes_round_trips_encoded_payload() -> anyhow::Result<()> {
        let url = encode_data_url("image/png", b"\x89PNG");
        let (media_type, bytes) = DataUrlPolicy::default().decode_bytes(&url)?;
        assert_eq!(media_type, "image/png");
        assert_eq!(bytes, b"\x89PNG");
        Ok(())
    }

    #[test]
    fn decode_bytes_rejects_invalid_base64() {
        let err = DataUrlPolicy::default()
            .decode_bytes("data:image/png;base64,@@@")
            .unwrap_err();
        assert!(err.to_string().contains("not valid base64"));
    }

    #[test]
    fn image_detection_uses_declared_media_type_only() {
        assert!(is_image_data_url("data:image/gif;base64,AAAA"));
        assert!(!is_image_data_url("data:text/plain;base64,AAAA"));
        assert!(!is_image_data_url("AAAA"));
    }
}
