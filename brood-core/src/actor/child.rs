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

//! Child-side bootstrap.
//!
//! A spawned actor process reads its [`BootstrapDescriptor`], brings up its
//! runtime, connects back to its parent, and sends `spawn-ack` once the
//! mailbox and root nursery are ready. From then on it serves invocations
//! until its root scope is cancelled (by the parent, a deadline, or local
//! code) or its parent disappears.

use tracing::{info, instrument};

use super::{BootstrapDescriptor, TaskRegistry};
use crate::common::ActorRuntime;
use crate::message::ActorError;

/// Boots a runtime from a descriptor: bind, connect to the parent, ack.
///
/// Used both by real child processes (descriptor from the environment) and
/// by hosted actors (descriptor passed in memory). The returned runtime is
/// already registered with its parent.
#[instrument(skip(descriptor, tasks), fields(actor = %descriptor.actor.short()))]
pub async fn bootstrap(
    descriptor: BootstrapDescriptor,
    tasks: TaskRegistry,
) -> Result<ActorRuntime, ActorError> {
    ActorRuntime::start_child(descriptor, tasks).await
}

/// Entry point for a spawned actor process.
///
/// Reads the descriptor from the environment, boots, serves until the root
/// scope ends, and flushes. The caller should exit nonzero if this returns
/// an error, which is the spawn contract's failure signal.
pub async fn child_main(tasks: TaskRegistry) -> Result<(), ActorError> {
    let descriptor = BootstrapDescriptor::from_env()?.ok_or_else(|| {
        ActorError::Protocol(format!(
            "{} is not set; this process was not spawned as an actor",
            super::BOOTSTRAP_ENV
        ))
    })?;
    let runtime = bootstrap(descriptor, tasks).await?;
    info!(actor = %runtime.id().short(), "actor ready");
    runtime.serve().await
}
