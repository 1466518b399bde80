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

//! Transport-level error type.

use std::fmt;

/// Error types for transport and framing operations.
///
/// These are wire-level failures. They surface to scopes and contexts as
/// [`ActorError`](crate::message::ActorError) through the mailbox's
/// transport-loss fan-out, never silently.
#[derive(Debug, Clone)]
pub enum IpcError {
    /// Target actor not found in the registry.
    ActorNotFound(String),

    /// Serialization or deserialization failure.
    ///
    /// Contains the underlying error message from the serialization library.
    SerializationError(String),

    /// Connection was closed by the peer.
    ConnectionClosed,

    /// Protocol error (invalid frame, unsupported version, unknown
    /// envelope kind, oversized frame).
    ProtocolError(String),

    /// Socket or I/O error.
    IoError(String),

    /// Handshake or request timeout exceeded.
    Timeout,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActorNotFound(a) => write!(f, "Actor not found: {a}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ProtocolError(e) => write!(f, "Protocol error: {e}"),
            Self::IoError(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "Timeout"),
        }
    }
}

impl std::error::Error for IpcError {}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
