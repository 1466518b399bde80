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

#![forbid(unsafe_code)]
//! Brood Core Library
//!
//! This library provides the core functionality for the Brood actor runtime:
//! the nursery/cancel-scope tree, the inter-actor wire protocol, mailbox
//! routing, and remote task invocation over portals.

/// Common utilities and structures used throughout the Brood runtime.
pub(crate) mod common;

pub(crate) mod actor;
pub(crate) mod ipc;
pub(crate) mod message;
pub(crate) mod nursery;
pub(crate) mod portal;

/// Prelude module for convenient imports.
///
/// This module re-exports the items an application normally needs to spawn
/// actors, open nurseries, and invoke remote tasks.
pub mod prelude {
    pub use crate::actor::{
        ActorHandle, ActorId, ActorSpec, BootstrapDescriptor, TaskContext, TaskFailure,
        TaskRegistry,
    };
    pub use crate::common::{ActorDirectory, ActorRuntime, InteractiveGuard, LocalRegistry};
    pub use crate::message::{ActorError, CancelReason, Envelope, EnvelopeKind, RemoteError};
    pub use crate::nursery::{CancelScope, Nursery, ScopeState};
    pub use crate::portal::{Portal, StreamHandle};
}

pub use actor::{
    bootstrap, child_main, ActorHandle, ActorId, ActorSpec, BootstrapDescriptor, TaskContext,
    TaskFailure, TaskRegistry,
};
pub use common::{ActorDirectory, ActorRuntime, InteractiveGuard, LocalRegistry};
pub use ipc::{Format, IpcError};
pub use message::{ActorError, CancelReason, Envelope, EnvelopeKind, RemoteError};
pub use nursery::{CancelScope, Nursery, ScopeState};
pub use portal::{Portal, StreamHandle};
