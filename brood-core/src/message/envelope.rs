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

//! The wire unit exchanged between actors.
//!
//! Every frame on a transport carries exactly one [`Envelope`]. The
//! correlation id binds an envelope to one in-flight context (invocation or
//! stream) on that transport; the nil id is reserved for per-actor control
//! traffic (`spawn-ack` on startup, `cancel` addressed to the root scope).

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use static_assertions::assert_impl_all;
use uuid::Uuid;

use crate::actor::ActorId;

/// Represents an envelope that carries one protocol message between actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Kind tag plus kind-specific payload.
    #[serde(flatten)]
    pub kind: EnvelopeKind,
    /// Context this envelope belongs to; nil for per-actor control traffic.
    pub correlation_id: Uuid,
    /// The sending actor.
    pub from: ActorId,
    /// The receiving actor.
    pub to: ActorId,
}

/// The set of protocol messages actors exchange.
///
/// Decoding rejects any tag outside this set, which fails the whole
/// transport as a protocol error: a peer speaking an unknown dialect cannot
/// be trusted for any of the contexts multiplexed on that connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// First envelope a freshly started actor sends: its mailbox and root
    /// nursery are ready, and `listen` is the address peers can register
    /// for it in the arbiter.
    SpawnAck {
        /// Address the sender accepts connections on.
        listen: SocketAddr,
    },
    /// Opens a context: run the named task with the given arguments.
    Invoke {
        /// Name in the callee's registered task table.
        task: String,
        /// Codec-encoded arguments for the task.
        args: Value,
        /// When present, the context carries a value stream and this seeds
        /// the credit window for both directions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_window: Option<u32>,
    },
    /// One value on a context's stream.
    Yield {
        /// The streamed value.
        value: Value,
    },
    /// Terminal: the invoked task completed with this value.
    Return {
        /// The task's result value.
        value: Value,
    },
    /// Terminal: the invoked task failed, or the context was cancelled
    /// (`kind == "cancelled"`), or the invoke was rejected
    /// (`kind == "protocol"`).
    Error {
        /// Error class name from the remote side.
        kind: String,
        /// Human-readable description.
        message: String,
        /// Remote failure-chain summary, when one exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_trace: Option<String>,
    },
    /// Cancel request for the correlated context, or for the receiving
    /// actor's root scope when sent on the nil correlation id.
    Cancel,
    /// Ends the context's stream: no further values flow in either
    /// direction, and suspended producers wake with a closed-stream error.
    StreamClose,
    /// Flow-control grant: the sender has consumed `n` values and the
    /// producer may send `n` more.
    StreamCredit {
        /// Number of values granted.
        n: u32,
    },
}

impl Envelope {
    /// Creates an envelope bound to the given context.
    #[must_use]
    pub fn new(kind: EnvelopeKind, correlation_id: Uuid, from: ActorId, to: ActorId) -> Self {
        Self {
            kind,
            correlation_id,
            from,
            to,
        }
    }

    /// Creates a per-actor control envelope (nil correlation id).
    #[must_use]
    pub fn control(kind: EnvelopeKind, from: ActorId, to: ActorId) -> Self {
        Self::new(kind, Uuid::nil(), from, to)
    }

    /// True for envelopes addressed to the actor itself rather than to one
    /// of its contexts.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.correlation_id.is_nil()
    }

    /// True for the kinds that settle a context.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EnvelopeKind::Return { .. } | EnvelopeKind::Error { .. }
        )
    }
}

assert_impl_all!(Envelope: Send);
