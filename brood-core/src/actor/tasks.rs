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

//! Invocable tasks.
//!
//! Remote dispatch resolves over a finite table registered before the
//! runtime launches: a name either maps to a handler or the invoke is
//! rejected. There is no dynamic lookup into arbitrary code.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::message::{ActorError, ERROR_KIND_PROTOCOL};
use crate::nursery::CancelScope;
use crate::portal::stream::{pull, StreamCore};

use super::ActorId;

/// Future returned by a registered handler.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Type-erased handler stored in the table.
pub(crate) type TaskFn = dyn Fn(Value, TaskContext) -> TaskFuture + Send + Sync;

/// An application error a task raises deliberately, carrying the error
/// class name that crosses the wire.
///
/// Anything else a handler returns crosses as a generic `"error"` kind with
/// its chain as the remote trace; use this type when the caller needs to
/// match on the kind.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Error class name surfaced to the caller.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl TaskFailure {
    /// Creates a failure with an explicit kind.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ERROR_KIND_PROTOCOL, message)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskFailure {}

/// The statically registered set of tasks an actor exposes.
///
/// Built before the runtime launches and frozen from then on.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskFn>>,
}

impl TaskRegistry {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// Arguments are decoded into `A` before the handler runs; undecodable
    /// arguments are rejected back to the caller as a protocol error
    /// without invoking the handler.
    pub fn register<A, R, F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let wrapped: Arc<TaskFn> = Arc::new(move |args: Value, ctx: TaskContext| {
            match serde_json::from_value::<A>(args) {
                Ok(args) => {
                    let fut = handler(args, ctx);
                    Box::pin(async move {
                        let result = fut.await?;
                        Ok(serde_json::to_value(result)?)
                    }) as TaskFuture
                }
                Err(e) => Box::pin(async move {
                    Err(TaskFailure::protocol(format!("invalid arguments: {e}")).into())
                }) as TaskFuture,
            }
        });
        self.tasks.insert(name.into(), wrapped);
        self
    }

    /// Looks a task up by name.
    pub(crate) fn resolve(&self, name: &str) -> Option<Arc<TaskFn>> {
        self.tasks.get(name).cloned()
    }

    /// Registered task names, for diagnostics.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Callee-side view of one in-flight invocation.
///
/// Handed to the task handler; carries the context's cancel scope and, when
/// the caller opened a stream, the sending and receiving ends of it.
pub struct TaskContext {
    runtime: crate::common::ActorRuntime,
    peer: ActorId,
    correlation_id: Uuid,
    scope: CancelScope,
    core: Arc<StreamCore>,
    inbound: mpsc::Receiver<Value>,
}

impl TaskContext {
    pub(crate) fn new(
        runtime: crate::common::ActorRuntime,
        peer: ActorId,
        correlation_id: Uuid,
        scope: CancelScope,
        core: Arc<StreamCore>,
        inbound: mpsc::Receiver<Value>,
    ) -> Self {
        Self {
            runtime,
            peer,
            correlation_id,
            scope,
            core,
            inbound,
        }
    }

    /// The actor this task is running in.
    #[must_use]
    pub fn actor_id(&self) -> &ActorId {
        self.runtime.id()
    }

    /// This actor's runtime: the way a task opens nurseries of its own,
    /// spawns further children, or reaches the interactive gate.
    #[must_use]
    pub fn runtime(&self) -> &crate::common::ActorRuntime {
        &self.runtime
    }

    /// The invoking actor.
    #[must_use]
    pub fn peer(&self) -> &ActorId {
        &self.peer
    }

    /// Correlation id of this invocation on its transport.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// The invocation's cancel scope, a child of the actor's root scope.
    #[must_use]
    pub fn scope(&self) -> CancelScope {
        self.scope.clone()
    }

    /// Explicit suspension point; unwinds if the context was cancelled.
    pub async fn checkpoint(&self) -> Result<(), ActorError> {
        self.scope.checkpoint().await
    }

    /// Sends one value down the context's stream, suspending while the
    /// caller's unconsumed window is full.
    ///
    /// Fails with [`ActorError::StreamClosed`] when the caller opened no
    /// stream or the stream has ended.
    pub async fn yield_value(&self, value: impl Serialize) -> Result<(), ActorError> {
        let value = serde_json::to_value(value)
            .map_err(|e| ActorError::Protocol(format!("unencodable yield: {e}")))?;
        self.core.send_value(value).await
    }

    /// Receives the next value the caller pushed, granting the credit that
    /// lets it send another. `Ok(None)` once the caller closed its side.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ActorError> {
        match pull(&self.core, &mut self.inbound).await? {
            Some(value) => {
                let decoded = serde_json::from_value(value)
                    .map_err(|e| ActorError::Protocol(format!("undecodable stream value: {e}")))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// Ends the stream from this side.
    pub async fn close_stream(&self) {
        self.core.close_sending();
        self.core.post_close().await;
    }

    /// How many times this task has suspended on a full stream window.
    #[must_use]
    pub fn backpressure_waits(&self) -> u64 {
        self.core.backpressure_waits()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("actor", &self.actor_id().short())
            .field("peer", &self.peer.short())
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_names_resolve_and_unknown_names_do_not() {
        let mut registry = TaskRegistry::new();
        registry.register("double", |n: i64, _ctx: TaskContext| async move { Ok(n * 2) });
        assert!(registry.resolve("double").is_some());
        assert!(registry.resolve("triple").is_none());
    }

    #[test]
    fn task_failure_displays_kind_and_message() {
        let failure = TaskFailure::new("ValueError", "x");
        assert_eq!(failure.to_string(), "ValueError: x");
    }
}
