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

//! Wire framing for the inter-actor transport.
//!
//! Messages are length-prefixed with a header naming the protocol version
//! and payload format.
//!
//! # Wire Format
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Frame Length (4 bytes, big-endian u32, excludes header)       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Protocol Version (1 byte, currently 0x01)                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Format (1 byte)                                               │
//! │   0x01 = JSON                                                 │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Payload (codec-encoded envelope)                              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A frame that fails any validation fails the whole transport: framing
//! never partially delivers.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::Format;
use super::types::IpcError;
use crate::message::Envelope;

/// Protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Frame header size: 4 bytes length + 1 byte version + 1 byte format.
pub const HEADER_SIZE: usize = 6;

/// Maximum frame size (16 MiB hard limit).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read a frame header from the stream.
///
/// Returns `(payload_length, format)`.
async fn read_header<R>(reader: &mut R) -> Result<(u32, Format), IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::ConnectionClosed
        } else {
            IpcError::IoError(e.to_string())
        }
    })?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let version = header[4];
    let format_byte = header[5];

    if version != PROTOCOL_VERSION {
        return Err(IpcError::ProtocolError(format!(
            "Unsupported protocol version: {version}, expected {PROTOCOL_VERSION}"
        )));
    }

    let format = Format::from_byte(format_byte).ok_or_else(|| {
        IpcError::ProtocolError(format!("Unknown serialization format: {format_byte:#04x}"))
    })?;

    Ok((length, format))
}

/// Read one envelope frame from the stream.
///
/// Fails with [`IpcError::ConnectionClosed`] on a clean EOF at a frame
/// boundary, and with [`IpcError::ProtocolError`] for anything malformed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, IpcError>
where
    R: AsyncRead + Unpin,
{
    let (length, format) = read_header(reader).await?;
    let length = length as usize;

    if length > MAX_FRAME_SIZE {
        return Err(IpcError::ProtocolError(format!(
            "Frame size {length} exceeds hard limit {MAX_FRAME_SIZE}"
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            // EOF inside a frame body is a truncated frame, not a clean close.
            IpcError::ProtocolError("Connection closed mid-frame".to_string())
        } else {
            IpcError::IoError(e.to_string())
        }
    })?;

    // An envelope with an unknown kind tag fails here, which fails the
    // transport: the peer is speaking a different protocol.
    format
        .deserialize(&payload)
        .map_err(|e| IpcError::ProtocolError(format!("Undecodable envelope: {e}")))
}

/// Write one envelope frame to the stream.
pub async fn write_frame<W>(
    writer: &mut W,
    envelope: &Envelope,
    format: Format,
) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let payload = format.serialize(envelope)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(IpcError::ProtocolError(format!(
            "Frame size {} exceeds hard limit {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }

    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&u32::try_from(payload.len()).expect("checked above").to_be_bytes());
    header[4] = PROTOCOL_VERSION;
    header[5] = format.to_byte();

    writer
        .write_all(&header)
        .await
        .map_err(|e| IpcError::IoError(e.to_string()))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| IpcError::IoError(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| IpcError::IoError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorId;
    use crate::message::EnvelopeKind;
    use uuid::Uuid;

    fn envelope() -> Envelope {
        Envelope::new(
            EnvelopeKind::Return {
                value: serde_json::json!(42),
            },
            Uuid::new_v4(),
            ActorId::new("caller"),
            ActorId::new("callee"),
        )
    }

    #[tokio::test]
    async fn frame_round_trips() {
        let env = envelope();
        let mut buf = Vec::new();
        write_frame(&mut buf, &env, Format::Json).await.unwrap();

        let mut reader = buf.as_slice();
        let back = read_frame(&mut reader).await.unwrap();
        assert_eq!(env.correlation_id, back.correlation_id);
        assert_eq!(env.from, back.from);
        assert!(back.is_terminal());
    }

    #[tokio::test]
    async fn several_frames_preserve_order() {
        let mut buf = Vec::new();
        let mut corrs = Vec::new();
        for _ in 0..3 {
            let env = envelope();
            corrs.push(env.correlation_id);
            write_frame(&mut buf, &env, Format::Json).await.unwrap();
        }
        let mut reader = buf.as_slice();
        for corr in corrs {
            assert_eq!(read_frame(&mut reader).await.unwrap().correlation_id, corr);
        }
    }

    #[tokio::test]
    async fn truncated_frame_fails_never_partially_delivers() {
        let env = envelope();
        let mut buf = Vec::new();
        write_frame(&mut buf, &env, Format::Json).await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, IpcError::ProtocolError(_)), "{err}");
    }

    #[tokio::test]
    async fn corrupt_payload_fails_the_frame() {
        let env = envelope();
        let mut buf = Vec::new();
        write_frame(&mut buf, &env, Format::Json).await.unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut reader = buf.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await.unwrap_err(),
            IpcError::ProtocolError(_)
        ));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let env = envelope();
        let mut buf = Vec::new();
        write_frame(&mut buf, &env, Format::Json).await.unwrap();
        buf[4] = 0x7e;

        let mut reader = buf.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await.unwrap_err(),
            IpcError::ProtocolError(_)
        ));
    }

    #[tokio::test]
    async fn clean_eof_is_connection_closed() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut reader).await.unwrap_err(),
            IpcError::ConnectionClosed
        ));
    }
}
