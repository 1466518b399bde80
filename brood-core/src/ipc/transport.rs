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

//! One duplex connection between two actors.
//!
//! A transport owns exactly one TCP connection. A writer task serializes all
//! outbound envelopes (which is what gives one transport its in-order
//! delivery guarantee) and a reader task feeds inbound frames to the
//! mailbox. Any framing or decode failure kills both halves and fans out to
//! every context multiplexed on the connection; there is no automatic
//! reconnection.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{instrument, trace};

use super::codec::Format;
use super::frame::{read_frame, write_frame};
use super::mailbox::Mailbox;
use super::types::IpcError;
use crate::actor::ActorId;
use crate::message::Envelope;

/// How long a connecting peer gets to present its hello envelope.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound queue depth per transport.
const WRITE_QUEUE_CAPACITY: usize = 64;

/// Sending half of a transport, shared by every local context that talks to
/// this peer. The mailbox owns the canonical copy; contexts hold clones.
#[derive(Debug, Clone)]
pub(crate) struct TransportSender {
    peer: ActorId,
    tx: mpsc::Sender<Envelope>,
    closed: CancellationToken,
}

impl TransportSender {
    pub(crate) fn peer(&self) -> &ActorId {
        &self.peer
    }

    /// Fires when either half of the connection has died.
    pub(crate) fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// Stops accepting new envelopes; the writer drains what is queued.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

/// Wires a connected, handshaken stream into the mailbox and starts its
/// reader and writer tasks.
#[instrument(skip(stream, mailbox, tracker), fields(peer = %peer.short()))]
pub(crate) fn spawn_transport(
    stream: TcpStream,
    peer: ActorId,
    mailbox: Arc<Mailbox>,
    tracker: &TaskTracker,
) -> TransportSender {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let closed = CancellationToken::new();

    let sender = TransportSender {
        peer: peer.clone(),
        tx,
        closed: closed.clone(),
    };

    tracker.spawn(write_loop(write_half, rx, closed.clone()));
    tracker.spawn(read_loop(read_half, peer, mailbox, closed));

    sender
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if let Err(e) = write_frame(&mut write_half, &envelope, Format::Json).await {
            trace!(%e, "transport write failed");
            break;
        }
    }
    // Drain whatever was queued before the close was observed.
    while let Ok(envelope) = rx.try_recv() {
        if write_frame(&mut write_half, &envelope, Format::Json)
            .await
            .is_err()
        {
            break;
        }
    }
    closed.cancel();
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    peer: ActorId,
    mailbox: Arc<Mailbox>,
    closed: CancellationToken,
) {
    let error = loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => break IpcError::ConnectionClosed,
            result = read_frame(&mut read_half) => match result {
                Ok(envelope) => envelope,
                Err(e) => break e,
            },
        };
        mailbox.deliver(envelope).await;
    };
    closed.cancel();
    mailbox.transport_failed(&peer, error).await;
}

/// Dials a peer and presents `hello` as the first frame.
///
/// Used both by freshly bootstrapped children connecting back to their
/// parent and by actors connecting to a peer found through the registry.
pub(crate) async fn connect(
    addr: std::net::SocketAddr,
    hello: &Envelope,
) -> Result<TcpStream, IpcError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| IpcError::IoError(format!("connect to {addr}: {e}")))?;
    write_frame(&mut stream, hello, Format::Json).await?;
    Ok(stream)
}

/// Accept side of the handshake: reads the peer's hello envelope off a
/// fresh connection, bounded by [`HANDSHAKE_TIMEOUT`].
pub(crate) async fn read_hello(stream: &mut TcpStream) -> Result<Envelope, IpcError> {
    timeout(HANDSHAKE_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| IpcError::Timeout)?
}
