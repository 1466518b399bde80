/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Pluggable payload codec.
//!
//! The frame header names the format that encoded the payload, so the two
//! sides of a transport agree per-frame rather than per-connection. Adding a
//! format means adding a variant, a wire byte, and the encode/decode arms.

use serde::{de::DeserializeOwned, Serialize};

use super::types::IpcError;

/// Serialization format for envelope payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// JSON format (UTF-8 encoded, human-readable).
    #[default]
    Json,
}

impl Format {
    /// Format byte for JSON.
    pub const JSON_BYTE: u8 = 0x01;

    /// Convert format to wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Json => Self::JSON_BYTE,
        }
    }

    /// Parse format from wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::JSON_BYTE => Some(Self::Json),
            _ => None,
        }
    }

    /// Serialize a value using this format.
    pub fn serialize<T: Serialize>(self, value: &T) -> Result<Vec<u8>, IpcError> {
        match self {
            Self::Json => serde_json::to_vec(value).map_err(IpcError::from),
        }
    }

    /// Deserialize a value using this format.
    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, IpcError> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(IpcError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_byte_round_trips() {
        assert_eq!(Format::from_byte(Format::Json.to_byte()), Some(Format::Json));
        assert_eq!(Format::from_byte(0x7f), None);
    }

    #[test]
    fn serialize_then_deserialize_is_identity() {
        let value = serde_json::json!({"a": [1, 2, 3], "b": "x"});
        let bytes = Format::Json.serialize(&value).unwrap();
        let back: serde_json::Value = Format::Json.deserialize(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn corrupt_payload_is_a_serialization_error() {
        let err = Format::Json
            .deserialize::<serde_json::Value>(b"{not json")
            .unwrap_err();
        assert!(matches!(err, IpcError::SerializationError(_)));
    }
}
