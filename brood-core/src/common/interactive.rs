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

//! The tree-wide interactive gate.
//!
//! At most one actor in the whole tree may hold the gate at a time — the
//! hook a debugger front-end uses around a breakpoint-style suspension. The
//! root actor owns the underlying permit; remote holders keep a live stream
//! context open against it, so the permit releases exactly when that
//! context dies: on explicit release, on cancellation, or when the holding
//! actor's transport disappears.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::actor::{TaskContext, TaskFailure, TaskRegistry};
use crate::portal::StreamHandle;

/// Reserved task name the root registers for remote gate acquisition.
pub(crate) const INTERACTIVE_TASK: &str = "brood.interactive";

/// Registers the gate task on the root's task table.
pub(crate) fn register_builtin(tasks: &mut TaskRegistry, gate: Arc<Semaphore>) {
    tasks.register(INTERACTIVE_TASK, move |_args: Value, ctx: TaskContext| {
        let gate = gate.clone();
        async move {
            let permit = gate
                .acquire_owned()
                .await
                .map_err(|_| TaskFailure::new("error", "interactive gate closed"))?;
            trace!(holder = %ctx.peer().short(), "interactive gate acquired");
            ctx.yield_value(true).await?;
            // Hold the permit until the context is cancelled: release is
            // the death of this future, however it happens.
            let _permit = permit;
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    });
}

enum GateHold {
    /// Root-local hold.
    Local(#[allow(dead_code)] OwnedSemaphorePermit),
    /// Remote hold: alive exactly as long as this stream context.
    Remote(StreamHandle<bool>),
}

/// Exclusive hold on the tree-wide interactive gate.
///
/// Dropping the guard releases the gate.
pub struct InteractiveGuard {
    hold: GateHold,
}

impl InteractiveGuard {
    pub(crate) fn local(permit: OwnedSemaphorePermit) -> Self {
        Self {
            hold: GateHold::Local(permit),
        }
    }

    pub(crate) fn remote(stream: StreamHandle<bool>) -> Self {
        Self {
            hold: GateHold::Remote(stream),
        }
    }

    /// Releases the gate.
    pub fn release(self) {}
}

impl Drop for InteractiveGuard {
    fn drop(&mut self) {
        if let GateHold::Remote(stream) = &self.hold {
            // Cancelling the context drops the root-side permit.
            stream.cancel();
        }
    }
}

impl std::fmt::Debug for InteractiveGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.hold {
            GateHold::Local(_) => "local",
            GateHold::Remote(_) => "remote",
        };
        f.debug_struct("InteractiveGuard").field("hold", &kind).finish()
    }
}
