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

//! Cancellation scopes.
//!
//! A scope is a flag plus an optional deadline. Cancellation is cooperative:
//! requesting it flips the flag, and every task, context, and child actor
//! under the scope observes the flag at its next suspension point and
//! unwinds. The request is irreversible for the scope instance and
//! propagates strictly parent to child, never the reverse.
//!
//! Deadline expiry is not a separate mechanism: the watchdog simply calls
//! `cancel` with the [`CancelReason::Deadline`] reason, so expiry and an
//! explicit request race idempotently and the first one wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::message::{ActorError, CancelReason};

/// Observable lifecycle of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeState {
    /// No cancellation requested.
    Active,
    /// Cancellation requested; owned work is unwinding.
    CancelRequested,
    /// The owning nursery or context finished unwinding after a request.
    Cancelled,
}

#[derive(Debug)]
struct ScopeInner {
    token: CancellationToken,
    parent: Option<Arc<ScopeInner>>,
    reason: OnceLock<CancelReason>,
    terminal: AtomicBool,
    deadline: Option<Instant>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl ScopeInner {
    fn reason_chain(&self) -> Option<CancelReason> {
        if let Some(reason) = self.reason.get() {
            return Some(*reason);
        }
        self.parent.as_ref().and_then(|p| p.reason_chain())
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.lock().expect("watchdog lock").take() {
            watchdog.abort();
        }
    }
}

/// A structured-concurrency cancel scope.
///
/// Cloning yields another handle to the same scope; children created with
/// [`CancelScope::child`] are cancelled whenever any ancestor is.
#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl CancelScope {
    /// Creates an unparented scope.
    #[must_use]
    pub fn root() -> Self {
        Self::build(CancellationToken::new(), None, None)
    }

    /// Creates a scope cancelled whenever `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::build(
            self.inner.token.child_token(),
            Some(self.inner.clone()),
            None,
        )
    }

    /// Creates a child scope that additionally cancels itself after
    /// `deadline` elapses.
    ///
    /// Must be called from within a tokio runtime: the deadline is enforced
    /// by a watchdog task.
    #[must_use]
    pub fn child_with_deadline(&self, deadline: Duration) -> Self {
        Self::build(
            self.inner.token.child_token(),
            Some(self.inner.clone()),
            Some(Instant::now() + deadline),
        )
    }

    /// Creates an unparented scope with a deadline.
    #[must_use]
    pub fn root_with_deadline(deadline: Duration) -> Self {
        Self::build(CancellationToken::new(), None, Some(Instant::now() + deadline))
    }

    fn build(
        token: CancellationToken,
        parent: Option<Arc<ScopeInner>>,
        deadline: Option<Instant>,
    ) -> Self {
        let inner = Arc::new(ScopeInner {
            token,
            parent,
            reason: OnceLock::new(),
            terminal: AtomicBool::new(false),
            deadline,
            watchdog: Mutex::new(None),
        });
        if let Some(at) = deadline {
            let weak = Arc::downgrade(&inner);
            let token = inner.token.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {
                        if let Some(inner) = weak.upgrade() {
                            let _ = inner.reason.set(CancelReason::Deadline);
                            inner.token.cancel();
                        }
                    }
                }
            });
            *inner.watchdog.lock().expect("watchdog lock") = Some(handle);
        }
        Self { inner }
    }

    /// Requests cancellation of this scope and everything beneath it.
    ///
    /// Idempotent: cancelling an already-cancelled scope is a no-op, and
    /// the first request's reason sticks.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Explicit);
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        if self.inner.reason.set(reason).is_ok() {
            trace!(%reason, "scope cancel requested");
        }
        self.inner.token.cancel();
    }

    /// True once cancellation has been requested, by this scope, an
    /// ancestor, or a deadline.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Why this scope is cancelled, walking up through ancestors for a
    /// request that arrived from above.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancel_requested() {
            return None;
        }
        Some(self.inner.reason_chain().unwrap_or(CancelReason::Explicit))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ScopeState {
        if self.inner.terminal.load(Ordering::Acquire) {
            ScopeState::Cancelled
        } else if self.is_cancel_requested() {
            ScopeState::CancelRequested
        } else {
            ScopeState::Active
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Explicit suspension point: yields to the scheduler and unwinds if
    /// cancellation has been requested.
    pub async fn checkpoint(&self) -> Result<(), ActorError> {
        tokio::task::yield_now().await;
        if self.is_cancel_requested() {
            Err(self.cancel_error())
        } else {
            Ok(())
        }
    }

    /// The scope's own deadline, if one was set.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Nearest deadline among this scope and its ancestors. This is what a
    /// spawned child actor inherits as its root-scope deadline.
    #[must_use]
    pub fn effective_deadline(&self) -> Option<Instant> {
        let mut nearest: Option<Instant> = None;
        let mut cursor = Some(&self.inner);
        while let Some(inner) = cursor {
            nearest = match (nearest, inner.deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            cursor = inner.parent.as_ref();
        }
        nearest
    }

    /// Marks the unwind complete. Called by the owning nursery or context
    /// when everything beneath the scope has reached a terminal state.
    pub(crate) fn finalize(&self) {
        if self.is_cancel_requested() {
            self.inner.terminal.store(true, Ordering::Release);
        }
    }

    /// The cancellation outcome for work unwound under this scope.
    pub(crate) fn cancel_error(&self) -> ActorError {
        ActorError::Cancelled {
            reason: self.reason().unwrap_or(CancelReason::Explicit),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_scope_is_active() {
        let scope = CancelScope::root();
        assert_eq!(scope.state(), ScopeState::Active);
        assert!(scope.reason().is_none());
    }

    #[test]
    fn cancel_is_irreversible_and_idempotent() {
        let scope = CancelScope::root();
        scope.cancel();
        assert_eq!(scope.state(), ScopeState::CancelRequested);
        // Second request with a different reason does not overwrite.
        scope.cancel_with(CancelReason::SiblingFailure);
        assert_eq!(scope.reason(), Some(CancelReason::Explicit));
    }

    #[test]
    fn cancellation_flows_parent_to_child_only() {
        let parent = CancelScope::root();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancel_requested());

        let parent = CancelScope::root();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancel_requested());
    }

    #[test]
    fn child_inherits_the_ancestor_reason() {
        let parent = CancelScope::root();
        let child = parent.child();
        let grandchild = child.child();
        parent.cancel_with(CancelReason::Deadline);
        assert_eq!(grandchild.reason(), Some(CancelReason::Deadline));
    }

    #[test]
    fn finalize_reaches_the_terminal_state() {
        let scope = CancelScope::root();
        scope.finalize();
        assert_eq!(scope.state(), ScopeState::Active);
        scope.cancel();
        scope.finalize();
        assert_eq!(scope.state(), ScopeState::Cancelled);
    }

    #[tokio::test]
    async fn deadline_expiry_behaves_like_cancel() {
        let scope = CancelScope::root_with_deadline(Duration::from_millis(20));
        scope.cancelled().await;
        assert_eq!(scope.reason(), Some(CancelReason::Deadline));
    }

    #[tokio::test]
    async fn explicit_cancel_wins_a_deadline_race() {
        let scope = CancelScope::root_with_deadline(Duration::from_secs(60));
        scope.cancel();
        scope.cancelled().await;
        assert_eq!(scope.reason(), Some(CancelReason::Explicit));
    }

    #[tokio::test]
    async fn checkpoint_unwinds_after_request() {
        let scope = CancelScope::root();
        assert!(scope.checkpoint().await.is_ok());
        scope.cancel();
        match scope.checkpoint().await {
            Err(ActorError::Cancelled { reason }) => assert_eq!(reason, CancelReason::Explicit),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn effective_deadline_is_the_nearest_ancestor() {
        let outer = CancelScope::root_with_deadline(Duration::from_secs(5));
        let inner = outer.child_with_deadline(Duration::from_secs(60));
        let effective = inner.effective_deadline().unwrap();
        assert!(effective <= Instant::now() + Duration::from_secs(5));
    }
}
