//! Encoding registry: canonicalizes user-specified encoding names and
//! exposes the byte/text codecs used at pipeline boundaries.

use std::collections::HashMap;

use base64::Engine as _;
use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::error::PipeError;
use crate::stdio::Descriptor;

/// A canonical codec identifier.
///
/// Text-capable codecs participate in line splitting; binary-like codecs
/// (`Base64`, `Base64Url`, `Hex`, `Raw`) carry bytes through the pipeline
/// untouched and render to text only when the final result is assembled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Latin1,
    Ascii,
    Base64,
    Base64Url,
    Hex,
    /// Binary passthrough, no conversion.
    Raw,
}

static ALIASES: Lazy<HashMap<&'static str, Encoding>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("utf8", Encoding::Utf8);
    m.insert("utf-8", Encoding::Utf8);
    m.insert("utf16le", Encoding::Utf16Le);
    m.insert("utf-16le", Encoding::Utf16Le);
    m.insert("ucs2", Encoding::Utf16Le);
    m.insert("ucs-2", Encoding::Utf16Le);
    m.insert("latin1", Encoding::Latin1);
    m.insert("ascii", Encoding::Ascii);
    m.insert("base64", Encoding::Base64);
    m.insert("base64url", Encoding::Base64Url);
    m.insert("hex", Encoding::Hex);
    m.insert("binary", Encoding::Raw);
    m.insert("buffer", Encoding::Raw);
    m.insert("raw", Encoding::Raw);
    m
});

impl Encoding {
    /// Resolve a user-supplied encoding name, case-insensitively.
    pub fn canonicalize(name: &str) -> Result<Self, PipeError> {
        let key = name.trim().to_ascii_lowercase();
        ALIASES
            .get(key.as_str())
            .copied()
            .ok_or_else(|| PipeError::UnknownEncoding(name.to_string()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Utf16Le => "utf16le",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
            Encoding::Base64 => "base64",
            Encoding::Base64Url => "base64url",
            Encoding::Hex => "hex",
            Encoding::Raw => "buffer",
        }
    }

    /// Whether line splitting applies to this codec's output.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            Encoding::Utf8 | Encoding::Utf16Le | Encoding::Latin1 | Encoding::Ascii
        )
    }

    /// Decode bytes to text. Never fails: malformed input decodes with the
    /// codec's replacement-character policy.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 | Encoding::Raw => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Utf16Le => decode_utf16_le(bytes),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b < 0x80 {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
            Encoding::Base64Url => base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
            Encoding::Hex => hex::encode(bytes),
        }
    }

    /// Encode text to bytes. Fails only for the binary-like codecs when the
    /// text is not a valid payload (e.g. odd-length hex).
    pub fn encode(self, descriptor: Descriptor, text: &str) -> Result<Bytes, PipeError> {
        let bytes = match self {
            Encoding::Utf8 | Encoding::Raw => text.as_bytes().to_vec(),
            Encoding::Utf16Le => text
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
                .collect(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| {
                    PipeError::invalid_output(descriptor, format!("invalid base64 payload: {e}"))
                })?,
            Encoding::Base64Url => base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(text)
                .map_err(|e| {
                    PipeError::invalid_output(descriptor, format!("invalid base64url payload: {e}"))
                })?,
            Encoding::Hex => hex::decode(text).map_err(|e| {
                PipeError::invalid_output(descriptor, format!("invalid hex payload: {e}"))
            })?,
        };
        Ok(Bytes::from(bytes))
    }
}

fn decode_utf16_le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let mut out: String = char::decode_utf16(units.iter().copied())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    // A trailing lone byte cannot form a code unit.
    if bytes.len() % 2 != 0 {
        out.push(char::REPLACEMENT_CHARACTER);
    }
    out
}
