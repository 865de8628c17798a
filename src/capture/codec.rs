//! Content-encoding normalization for captured bodies.
//!
//! `decode` never fails: unknown labels are read as UTF-8, and a body that
//! claims a compression it does not actually have comes back as base64 of
//! the raw bytes, flagged as [`BodyEncoding::Base64Fallback`].

use std::io::{self, Read};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Serialize;

/// How the text of a [`DecodedBody`] relates to the original bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Text is the (decompressed) payload read as UTF-8.
    #[default]
    Utf8,
    /// Decompression failed; text is standard base64 of the raw bytes.
    #[serde(rename = "base64")]
    Base64Fallback,
}

impl BodyEncoding {
    pub fn is_utf8(&self) -> bool {
        matches!(self, BodyEncoding::Utf8)
    }
}

/// A body normalized to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    pub text: String,
    pub encoding: BodyEncoding,
}

impl DecodedBody {
    fn utf8(bytes: &[u8]) -> Self {
        Self {
            text: String::from_utf8_lossy(bytes).into_owned(),
            encoding: BodyEncoding::Utf8,
        }
    }

    fn fallback(raw: &[u8]) -> Self {
        Self {
            text: BASE64_STANDARD.encode(raw),
            encoding: BodyEncoding::Base64Fallback,
        }
    }
}

/// Compression schemes the relay knows how to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    /// zlib-wrapped deflate, as sent by `Content-Encoding: deflate`.
    Deflate,
    Br,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` label. Unknown and identity labels yield `None`.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.eq_ignore_ascii_case("gzip") {
            Some(Self::Gzip)
        } else if label.eq_ignore_ascii_case("deflate") {
            Some(Self::Deflate)
        } else if label.eq_ignore_ascii_case("br") {
            Some(Self::Br)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Br => "br",
        }
    }

    fn decompress(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(raw.len() * 2);
        match self {
            ContentEncoding::Gzip => GzDecoder::new(raw).read_to_end(&mut out)?,
            ContentEncoding::Deflate => ZlibDecoder::new(raw).read_to_end(&mut out)?,
            ContentEncoding::Br => brotli::Decompressor::new(raw, 4096).read_to_end(&mut out)?,
        };
        Ok(out)
    }
}

/// Decode a fully buffered body according to its declared encoding.
pub fn decode(raw: &[u8], declared_encoding: Option<&str>) -> DecodedBody {
    if raw.is_empty() {
        return DecodedBody::utf8(raw);
    }

    let Some(encoding) = declared_encoding.and_then(ContentEncoding::parse) else {
        return DecodedBody::utf8(raw);
    };

    match encoding.decompress(raw) {
        Ok(bytes) => DecodedBody::utf8(&bytes),
        Err(e) => {
            tracing::debug!(
                encoding = encoding.name(),
                bytes = raw.len(),
                error = %e,
                "Body decode failed, falling back to base64"
            );
            DecodedBody::fallback(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    const TEXT: &str = "{\"ok\":true,\"items\":[\"ä\",\"β\",\"🦀\"]}";

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn brotli(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(bytes).unwrap();
        }
        out
    }

    #[test]
    fn identity_and_unknown_labels_read_utf8() {
        for label in [None, Some(""), Some("identity"), Some("zstd")] {
            let decoded = decode(TEXT.as_bytes(), label);
            assert_eq!(decoded.text, TEXT, "label {label:?}");
            assert_eq!(decoded.encoding, BodyEncoding::Utf8);
        }
    }

    #[test]
    fn compressed_bodies_round_trip() {
        let cases = [
            ("gzip", gzip(TEXT.as_bytes())),
            ("deflate", zlib(TEXT.as_bytes())),
            ("br", brotli(TEXT.as_bytes())),
        ];

        for (label, compressed) in cases {
            let decoded = decode(&compressed, Some(label));
            assert_eq!(decoded.text, TEXT, "encoding {label}");
            assert!(decoded.encoding.is_utf8());
        }
    }

    #[test]
    fn labels_are_case_insensitive() {
        let decoded = decode(&gzip(b"hello"), Some(" GZIP "));
        assert_eq!(decoded.text, "hello");
    }

    #[test]
    fn malformed_stream_falls_back_to_base64() {
        let raw = b"this was never compressed";
        for label in ["gzip", "deflate", "br"] {
            let decoded = decode(raw, Some(label));
            assert_eq!(decoded.encoding, BodyEncoding::Base64Fallback);
            assert_eq!(BASE64_STANDARD.decode(&decoded.text).unwrap(), raw);
        }
    }

    #[test]
    fn truncated_brotli_falls_back_to_base64() {
        let compressed = brotli(TEXT.repeat(20).as_bytes());
        let truncated = &compressed[..compressed.len() / 2];

        let decoded = decode(truncated, Some("br"));
        assert_eq!(decoded.encoding, BodyEncoding::Base64Fallback);
        assert_eq!(BASE64_STANDARD.decode(&decoded.text).unwrap(), truncated);
    }

    #[test]
    fn truncated_gzip_falls_back_to_base64() {
        let compressed = gzip(TEXT.repeat(20).as_bytes());
        let truncated = &compressed[..compressed.len() / 2];

        let decoded = decode(truncated, Some("gzip"));
        assert_eq!(decoded.encoding, BodyEncoding::Base64Fallback);
        assert_eq!(BASE64_STANDARD.decode(&decoded.text).unwrap(), truncated);
    }

    #[test]
    fn empty_body_is_empty_text() {
        let decoded = decode(b"", Some("gzip"));
        assert_eq!(decoded.text, "");
        assert!(decoded.encoding.is_utf8());
    }
}
