use crate::{Error, Result};
use base64::Engine as _;

/// Inline image decoded from a `data:` URL or a bare base64 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub declared_mime: Option<String>,
    pub data: Vec<u8>,
}

pub fn is_data_url(value: &str) -> bool {
    value
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("data:"))
}

/// Decode `data:<mime>;base64,<payload>`.
pub fn parse_data_url(value: &str) -> Result<DecodedImage> {
    if !is_data_url(value) {
        return Err(Error::malformed("not a data: URL"));
    }

    let (header, payload) = value[5..]
        .split_once(',')
        .ok_or_else(|| Error::malformed("data: URL is missing its payload"))?;

    let mut params = header.split(';');
    let mime = params.next().unwrap_or_default().trim();
    if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(Error::malformed("only base64 data: URLs are supported"));
    }

    Ok(DecodedImage {
        declared_mime: (!mime.is_empty()).then(|| mime.to_string()),
        data: decode_base64(payload)?,
    })
}

/// Decode a bare base64 string, tolerating whitespace and missing padding.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = cleaned.trim_end_matches('=');
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .map_err(|e| Error::malformed(format!("invalid base64 image data: {}", e)))
}
