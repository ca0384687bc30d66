//! Content-type sniffing
//!
//! Recognizes a payload's content type from its leading bytes: a small
//! magic-byte table followed by a UTF-8 text heuristic. Unrecognized
//! payloads fall back to `application/octet-stream`.

/// Fallback content type for unrecognized payloads
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Magic-byte signatures, longest match first within a shared prefix
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b\x08", "application/x-gzip"),
    (b"OggS", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"\xff\xfb", "audio/mpeg"),
    (b"<!DOCTYPE html", "text/html; charset=utf-8"),
    (b"<html", "text/html; charset=utf-8"),
    (b"<?xml", "text/xml; charset=utf-8"),
];

/// Sniff the content type of a payload from its leading bytes
#[must_use]
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    for (signature, content_type) in SIGNATURES {
        if data.starts_with(signature) {
            return content_type;
        }
    }

    // RIFF containers carry their format tag at offset 8.
    if data.len() >= 12 && data.starts_with(b"RIFF") {
        match &data[8..12] {
            b"WAVE" => return "audio/wave",
            b"WEBP" => return "image/webp",
            b"AVI " => return "video/avi",
            _ => {}
        }
    }

    // MP4 family: a size-prefixed "ftyp" box at offset 4.
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return "video/mp4";
    }

    if looks_like_text(data) {
        return "text/plain; charset=utf-8";
    }
    OCTET_STREAM
}

/// Whether the first bytes decode as UTF-8 without control characters
fn looks_like_text(data: &[u8]) -> bool {
    let probe = &data[..data.len().min(512)];
    match std::str::from_utf8(probe) {
        Ok(text) => !text
            .chars()
            .any(|c| c.is_control() && c != '\n' && c != '\r' && c != '\t'),
        // A probe cut mid-codepoint still counts when the error sits at
        // the very end of the window.
        Err(e) => {
            e.error_len().is_none()
                && std::str::from_utf8(&probe[..e.valid_up_to()]).is_ok_and(|text| {
                    !text
                        .chars()
                        .any(|c| c.is_control() && c != '\n' && c != '\r' && c != '\t')
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_bytes() {
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(sniff_content_type(b"\xff\xd8\xff\xe0"), "image/jpeg");
        assert_eq!(sniff_content_type(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(sniff_content_type(b"PK\x03\x04zipdata"), "application/zip");
    }

    #[test]
    fn test_riff_containers() {
        assert_eq!(sniff_content_type(b"RIFF\x00\x00\x00\x00WAVEfmt "), "audio/wave");
        assert_eq!(sniff_content_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
    }

    #[test]
    fn test_text_detection() {
        assert_eq!(
            sniff_content_type(b"hello world\n"),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            sniff_content_type("héllo".as_bytes()),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_binary_fallback() {
        assert_eq!(sniff_content_type(&[0u8, 1, 2, 3]), OCTET_STREAM);
        assert_eq!(sniff_content_type(&[0xFE, 0xED, 0xFA, 0xCE]), OCTET_STREAM);
    }
}
