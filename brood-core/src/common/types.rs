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

//! Internal type bundles shared across the runtime.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::actor::ActorId;
use crate::ipc::Mailbox;
use crate::message::ActorError;

/// The slice of an actor runtime that portals, contexts, and streams need:
/// who we are, how to post envelopes, and where to park I/O helper tasks.
#[derive(Clone)]
pub(crate) struct Wiring {
    pub(crate) local: ActorId,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) io_tracker: TaskTracker,
}

/// Observable lifecycle of a spawned child actor, published on its handle.
#[derive(Debug, Clone)]
pub(crate) enum ChildState {
    /// Launched; spawn-ack not yet received.
    Pending,
    /// Handshake complete; the transport is up.
    Ready,
    /// Startup failed (spawn error, early exit, or ack timeout).
    Failed(ActorError),
    /// The child's process (or hosted task) has terminated.
    Exited,
}
