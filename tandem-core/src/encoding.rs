// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Text codecs for binary fields carried in JSON control messages.

use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Standard alphabet, padding optional on decode.
const BASE64_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryEncoding {
    Hex,
    Base64,
}

impl BinaryEncoding {
    /// An even-length string made only of hex digits is hex, anything else base64.
    pub fn detect(value: &str) -> Self {
        if !value.is_empty()
            && value.len() % 2 == 0
            && value.bytes().all(|b| b.is_ascii_hexdigit())
        {
            Self::Hex
        } else {
            Self::Base64
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hex => "hex",
            Self::Base64 => "base64",
        }
    }

    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Hex => hex::encode(bytes),
            Self::Base64 => STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self, value: &str) -> Option<Vec<u8>> {
        match self {
            Self::Hex => hex::decode(value).ok(),
            Self::Base64 => BASE64_LENIENT.decode(value).ok(),
        }
    }
}

impl std::fmt::Display for BinaryEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes `value`, detecting the encoding when none is given.
///
/// Surrounding whitespace is ignored and a blank value decodes to no bytes.
/// On failure the encoding that was attempted is returned.
pub fn decode_binary(
    value: &str,
    encoding: Option<BinaryEncoding>,
) -> std::result::Result<Vec<u8>, BinaryEncoding> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let encoding = encoding.unwrap_or_else(|| BinaryEncoding::detect(trimmed));
    encoding.decode(trimmed).ok_or(encoding)
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(value: &str) -> Option<Vec<u8>> {
    STANDARD.decode(value.trim()).ok()
}
