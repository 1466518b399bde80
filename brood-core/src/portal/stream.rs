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

//! Flow-controlled value streams layered over a context.
//!
//! Credits are the backpressure mechanism: a producer spends one credit per
//! yielded value and suspends when it has none, and the consumer returns a
//! credit with each pull. The window that seeds the credit pool is fixed
//! when the stream is opened, so neither side ever buffers more than a
//! window of unconsumed values.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore, TryAcquireError};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::common::Wiring;
use crate::message::{ActorError, CancelReason, Envelope, EnvelopeKind};
use crate::nursery::CancelScope;

/// Largest accepted credit window. Bounded well under the route channel
/// capacity so a full window of in-flight yields can never block a
/// transport read loop.
pub(crate) const MAX_STREAM_WINDOW: u32 = 32;

/// Clamps a requested window into the supported range.
pub(crate) fn clamp_window(window: u32) -> u32 {
    window.clamp(1, MAX_STREAM_WINDOW)
}

/// State shared between one side's producer API, consumer API, and route
/// sidecar.
pub(crate) struct StreamCore {
    pub(crate) correlation_id: Uuid,
    pub(crate) peer: crate::actor::ActorId,
    pub(crate) wiring: Wiring,
    pub(crate) scope: CancelScope,
    credits: Arc<Semaphore>,
    send_open: AtomicBool,
    backpressure_waits: AtomicU64,
}

impl StreamCore {
    pub(crate) fn new(
        correlation_id: Uuid,
        peer: crate::actor::ActorId,
        wiring: Wiring,
        scope: CancelScope,
        window: Option<u32>,
    ) -> Arc<Self> {
        let window = window.map(clamp_window);
        Arc::new(Self {
            correlation_id,
            peer,
            wiring,
            scope,
            credits: Arc::new(Semaphore::new(window.unwrap_or(0) as usize)),
            send_open: AtomicBool::new(window.is_some()),
            backpressure_waits: AtomicU64::new(0),
        })
    }

    fn envelope(&self, kind: EnvelopeKind) -> Envelope {
        Envelope::new(
            kind,
            self.correlation_id,
            self.wiring.local.clone(),
            self.peer.clone(),
        )
    }

    /// Sends one value, suspending while the peer's unconsumed window is
    /// full. This suspension is the producer-side backpressure point.
    pub(crate) async fn send_value(&self, value: Value) -> Result<(), ActorError> {
        if !self.send_open.load(Ordering::Acquire) {
            return Err(ActorError::StreamClosed);
        }
        let permit = match self.credits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(ActorError::StreamClosed),
            Err(TryAcquireError::NoPermits) => {
                self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
                trace!(correlation_id = %self.correlation_id, "producer suspended on window");
                tokio::select! {
                    _ = self.scope.cancelled() => return Err(self.scope.cancel_error()),
                    acquired = self.credits.clone().acquire_owned() => {
                        acquired.map_err(|_| ActorError::StreamClosed)?
                    }
                }
            }
        };
        if !self.send_open.load(Ordering::Acquire) {
            return Err(ActorError::StreamClosed);
        }
        permit.forget();
        self.wiring
            .mailbox
            .post(self.envelope(EnvelopeKind::Yield { value }))
            .await
            .map_err(|_| ActorError::Cancelled {
                reason: CancelReason::TransportLost,
            })
    }

    /// Returns one credit to the peer after a pull. Best effort: if the
    /// transport is gone the sidecar surfaces that separately.
    pub(crate) async fn grant_credit(&self) {
        let _ = self
            .wiring
            .mailbox
            .post(self.envelope(EnvelopeKind::StreamCredit { n: 1 }))
            .await;
    }

    /// Peer granted us `n` more sends.
    pub(crate) fn add_credits(&self, n: u32) {
        self.credits.add_permits(n as usize);
    }

    /// Ends the stream locally: no further sends from this side, and any
    /// suspended producer wakes with [`ActorError::StreamClosed`].
    pub(crate) fn close_sending(&self) {
        self.send_open.store(false, Ordering::Release);
        self.credits.close();
    }

    /// Announces the close to the peer.
    pub(crate) async fn post_close(&self) {
        let _ = self
            .wiring
            .mailbox
            .post(self.envelope(EnvelopeKind::StreamClose))
            .await;
    }

    /// How many times this side's producer has suspended on a full window.
    pub(crate) fn backpressure_waits(&self) -> u64 {
        self.backpressure_waits.load(Ordering::Relaxed)
    }
}

/// Pulls one value off the consumer buffer, returning the credit that lets
/// the producer send the next one. The pull is the only suspension point on
/// the receiving side.
pub(crate) async fn pull(
    core: &StreamCore,
    inbound: &mut mpsc::Receiver<Value>,
) -> Result<Option<Value>, ActorError> {
    let value = tokio::select! {
        _ = core.scope.cancelled() => return Err(core.scope.cancel_error()),
        value = inbound.recv() => value,
    };
    match value {
        Some(value) => {
            core.grant_credit().await;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Feeds a yielded value into the consumer buffer.
///
/// The buffer is sized past the maximum window, so overflow here means the
/// peer ignored flow control; the value is dropped and logged.
pub(crate) fn push_inbound(
    correlation_id: Uuid,
    inbound: &Option<mpsc::Sender<Value>>,
    value: Value,
) {
    match inbound {
        Some(tx) => {
            if tx.try_send(value).is_err() {
                debug!(%correlation_id, "dropping yield past the flow-control window");
            }
        }
        None => {
            debug!(%correlation_id, "dropping yield on a context with no stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_clamped_to_supported_range() {
        assert_eq!(clamp_window(0), 1);
        assert_eq!(clamp_window(10), 10);
        assert_eq!(clamp_window(10_000), MAX_STREAM_WINDOW);
    }
}
