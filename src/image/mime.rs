use image::ImageFormat;

/// MIME types accepted for upload and injection.
pub const SUPPORTED_IMAGE_MIME_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/webp", "image/gif"];

pub fn is_supported(mime_type: &str) -> bool {
    SUPPORTED_IMAGE_MIME_TYPES.contains(&normalize(mime_type).as_str())
}

/// Lowercase, parameters stripped, `image/jpg` folded into `image/jpeg`.
pub fn normalize(mime_type: &str) -> String {
    let base = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if base == "image/jpg" {
        "image/jpeg".to_string()
    } else {
        base
    }
}

/// Sniff the image format from its magic bytes.
pub fn detect_image_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes) {
        Ok(format) => {
            let mime = format.to_mime_type();
            if is_supported(mime) {
                Some(mime)
            } else {
                tracing::debug!("Detected unsupported image format {:?}", format);
                None
            }
        }
        Err(_) => {
            tracing::debug!(
                "Unrecognized image format (first 4 bytes: {:02X?})",
                &bytes[..bytes.len().min(4)]
            );
            None
        }
    }
}

pub fn extension_for(mime_type: &str) -> &'static str {
    ImageFormat::from_mime_type(normalize(mime_type))
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin")
}

/// Guess a MIME type from the extension at the end of a URL path.
pub fn mime_from_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1;
    ImageFormat::from_extension(ext)
        .map(|format| format.to_mime_type())
        .filter(|mime| is_supported(mime))
}
