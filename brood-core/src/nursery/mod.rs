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

//! Nurseries: the structured-concurrency core.
//!
//! A nursery bounds the lifetime of the tasks and child actors spawned into
//! it. Closing a nursery blocks until every one of them has reported a
//! terminal outcome; the first failure cancels the nursery's scope (and so
//! all concurrent siblings, including child-actor processes); outcomes are
//! aggregated into exactly one result for the enclosing scope.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::task::TaskTracker;
use tracing::{instrument, trace};
use uuid::Uuid;

pub use cancel_scope::{CancelScope, ScopeState};

use crate::actor::ActorHandle;
use crate::common::ActorRuntime;
use crate::message::ActorError;

mod cancel_scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NurseryState {
    Open,
    Closing,
    Closed,
}

pub(crate) struct NurseryInner {
    scope: CancelScope,
    tracker: TaskTracker,
    children: DashMap<Uuid, ActorHandle>,
    failures: Mutex<Vec<ActorError>>,
    state: Mutex<NurseryState>,
    runtime: Option<ActorRuntime>,
}

impl NurseryInner {
    /// Records a child outcome that counts as a failure and cancels all
    /// concurrent siblings. This is the core propagation rule.
    pub(crate) fn record_failure(&self, error: ActorError) {
        trace!(%error, "recording child failure");
        self.failures.lock().expect("failures lock").push(error);
        self.scope.cancel_with(crate::message::CancelReason::SiblingFailure);
    }
}

/// A structured-concurrency scope owning local tasks and child actors.
///
/// Cloning yields another handle to the same nursery (handy for passing
/// into tasks); the nursery itself stays one scope with one outcome.
#[derive(Clone)]
pub struct Nursery {
    inner: Arc<NurseryInner>,
}

impl fmt::Debug for Nursery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nursery")
            .field("state", &*self.inner.state.lock().expect("state lock"))
            .field("scope", &self.inner.scope.state())
            .finish()
    }
}

impl Nursery {
    pub(crate) fn new(scope: CancelScope, runtime: Option<ActorRuntime>) -> Self {
        Self {
            inner: Arc::new(NurseryInner {
                scope,
                tracker: TaskTracker::new(),
                children: DashMap::new(),
                failures: Mutex::new(Vec::new()),
                state: Mutex::new(NurseryState::Open),
                runtime,
            }),
        }
    }

    /// Opens a nursery that can only own local tasks, not child actors.
    ///
    /// Useful for bounding a group of in-process tasks with the same
    /// cancellation and aggregation rules actors get.
    #[must_use]
    pub fn local() -> Self {
        Self::new(CancelScope::root(), None)
    }

    /// Like [`Nursery::local`], with a deadline on the scope.
    #[must_use]
    pub fn local_with_deadline(deadline: Duration) -> Self {
        Self::new(CancelScope::root_with_deadline(deadline), None)
    }

    /// Opens a nested nursery whose scope is a child of this one's.
    #[must_use]
    pub fn nested(&self) -> Self {
        Self::new(self.inner.scope.child(), self.inner.runtime.clone())
    }

    /// Opens a nested nursery with its own deadline.
    #[must_use]
    pub fn nested_with_deadline(&self, deadline: Duration) -> Self {
        Self::new(
            self.inner.scope.child_with_deadline(deadline),
            self.inner.runtime.clone(),
        )
    }

    /// The nursery's cancel scope. Tasks capture a clone for checkpoints
    /// and for linking contexts they open.
    #[must_use]
    pub fn scope(&self) -> CancelScope {
        self.inner.scope.clone()
    }

    /// Requests cancellation of everything owned by this nursery.
    pub fn cancel(&self) {
        self.inner.scope.cancel();
    }

    /// Spawns a task owned by this nursery.
    ///
    /// The task unwinds at its next suspension point once the nursery's
    /// scope is cancelled. A returned error (other than a cancellation
    /// outcome) is recorded and cancels all concurrent siblings.
    pub fn spawn<F>(&self, fut: F) -> Result<(), ActorError>
    where
        F: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.ensure_open()?;
        let inner = self.inner.clone();
        let token = self.inner.scope.token();
        self.inner.tracker.spawn(async move {
            // Biased toward the task: an outcome that is already ready is
            // recorded even when cancellation arrived in the same instant,
            // so concurrent failures aggregate deterministically.
            // Cancellation still lands at the task's next suspension point.
            let outcome = tokio::select! {
                biased;
                result = fut => result,
                _ = token.cancelled() => Err(inner.scope.cancel_error()),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => {}
                Err(e) => inner.record_failure(e),
            }
        });
        Ok(())
    }

    /// Closes the nursery: no new children are accepted, and this call
    /// does not return until every owned task and child actor has reached
    /// a terminal outcome.
    ///
    /// The aggregated result follows the propagation rules: exactly one
    /// failure propagates as itself, several become an
    /// [`ActorError::Aggregate`], and a scope that was cancelled without
    /// any distinct failure reports [`ActorError::Cancelled`].
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), ActorError> {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            match *state {
                NurseryState::Open => *state = NurseryState::Closing,
                _ => return Err(ActorError::NurseryClosed),
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        {
            *self.inner.state.lock().expect("state lock") = NurseryState::Closed;
        }
        self.inner.scope.finalize();
        self.inner.children.clear();

        let failures = std::mem::take(&mut *self.inner.failures.lock().expect("failures lock"));
        let cancelled = self.inner.scope.reason();
        ActorError::aggregate(failures, cancelled)
    }

    /// Number of child actors currently owned by this nursery.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner.children.len()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ActorError> {
        match *self.inner.state.lock().expect("state lock") {
            NurseryState::Open => Ok(()),
            _ => Err(ActorError::NurseryClosed),
        }
    }

    pub(crate) fn runtime(&self) -> Option<&ActorRuntime> {
        self.inner.runtime.as_ref()
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    pub(crate) fn shared(&self) -> Arc<NurseryInner> {
        self.inner.clone()
    }

    pub(crate) fn register_child(&self, handle: ActorHandle) {
        self.inner.children.insert(handle.id().uid, handle);
    }
}
