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

//! Portals: caller-side handles to remote actors.
//!
//! A portal runs tasks inside another actor under the caller's
//! structured-concurrency discipline: every context it opens gets a cancel
//! scope linked beneath the scope the portal was created with, so
//! cancelling that scope cancels the remote work too.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::instrument;

use crate::actor::ActorId;
use crate::common::{ChildState, Wiring};
use crate::message::ActorError;
use crate::nursery::CancelScope;

pub(crate) use context::run_callee;

mod context;
pub(crate) mod stream;

use stream::StreamCore;

/// Caller-side handle used to invoke tasks in a remote actor.
#[derive(Clone)]
pub struct Portal {
    peer: ActorId,
    wiring: Wiring,
    scope: CancelScope,
    ready: Option<watch::Receiver<ChildState>>,
}

impl Portal {
    pub(crate) fn new(
        peer: ActorId,
        wiring: Wiring,
        scope: CancelScope,
        ready: Option<watch::Receiver<ChildState>>,
    ) -> Self {
        Self {
            peer,
            wiring,
            scope,
            ready,
        }
    }

    /// The actor this portal reaches.
    #[must_use]
    pub fn peer(&self) -> &ActorId {
        &self.peer
    }

    /// Suspends until the peer's transport is up (a freshly spawned child
    /// may still be acknowledging startup), or reports how startup failed.
    pub async fn wait_ready(&self) -> Result<(), ActorError> {
        let Some(mut rx) = self.ready.clone() else {
            return Ok(());
        };
        loop {
            let state = rx.borrow().clone();
            match state {
                ChildState::Ready => return Ok(()),
                ChildState::Failed(error) => return Err(error),
                ChildState::Exited => {
                    return Err(ActorError::TransportLost {
                        peer: self.peer.clone(),
                    })
                }
                ChildState::Pending => {
                    let changed = tokio::select! {
                        _ = self.scope.cancelled() => None,
                        changed = rx.changed() => Some(changed),
                    };
                    match changed {
                        None => return Err(self.scope.cancel_error()),
                        Some(Err(_)) => {
                            return Err(ActorError::TransportLost {
                                peer: self.peer.clone(),
                            })
                        }
                        Some(Ok(())) => {}
                    }
                }
            }
        }
    }

    /// Runs `task` inside the remote actor and suspends until its result
    /// arrives.
    ///
    /// Resolves exactly once: with the task's value, with a typed
    /// [`ActorError::Remote`] if it raised, or with a cancellation outcome
    /// if this portal's scope (or the remote side) cancelled the context.
    #[instrument(skip(self, args), fields(peer = %self.peer.short()))]
    pub async fn run<A: Serialize, T: DeserializeOwned>(
        &self,
        task: &str,
        args: A,
    ) -> Result<T, ActorError> {
        self.wait_ready().await?;
        if self.scope.is_cancel_requested() {
            return Err(self.scope.cancel_error());
        }
        let args = serde_json::to_value(args)
            .map_err(|e| ActorError::Protocol(format!("unencodable arguments: {e}")))?;
        let mut ctx = context::CallerContext::open(self.wiring.clone(), self.peer.clone(), &self.scope);
        ctx.invoke(task, args, None).await?;
        let value = ctx.await_result().await?;
        serde_json::from_value(value)
            .map_err(|e| ActorError::Protocol(format!("undecodable return value: {e}")))
    }

    /// Runs `task` remotely with a value stream layered over the context.
    ///
    /// `window` bounds the unconsumed values in flight in each direction;
    /// the producer side suspends once the window is full until the
    /// consumer pulls.
    #[instrument(skip(self, args), fields(peer = %self.peer.short(), window))]
    pub async fn open_stream<A: Serialize, T: DeserializeOwned>(
        &self,
        task: &str,
        args: A,
        window: u32,
    ) -> Result<StreamHandle<T>, ActorError> {
        self.wait_ready().await?;
        if self.scope.is_cancel_requested() {
            return Err(self.scope.cancel_error());
        }
        let window = stream::clamp_window(window);
        let args = serde_json::to_value(args)
            .map_err(|e| ActorError::Protocol(format!("unencodable arguments: {e}")))?;
        let mut ctx = context::CallerContext::open(self.wiring.clone(), self.peer.clone(), &self.scope);
        ctx.invoke(task, args, Some(window)).await?;
        let (core, inbound, outcome) = ctx.into_stream(window);
        Ok(StreamHandle {
            core,
            inbound,
            outcome,
            _marker: PhantomData,
        })
    }
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("peer", &self.peer.short())
            .finish()
    }
}

/// Caller side of an open stream.
///
/// Dropping the handle does not end the context; it stays owned by (and is
/// torn down with) the scope the portal was created under. Call
/// [`StreamHandle::close`] or [`StreamHandle::finish`] for an orderly end.
pub struct StreamHandle<T = Value> {
    core: Arc<StreamCore>,
    inbound: mpsc::Receiver<Value>,
    outcome: oneshot::Receiver<Result<Value, ActorError>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamHandle<T> {
    /// Pulls the next value, granting the producer one more credit.
    ///
    /// `Ok(None)` once the remote side has closed the stream (or the task
    /// returned). This pull is the only suspension point on the receiving
    /// side.
    pub async fn recv(&mut self) -> Result<Option<T>, ActorError> {
        match stream::pull(&self.core, &mut self.inbound).await? {
            Some(value) => {
                let decoded = serde_json::from_value(value)
                    .map_err(|e| ActorError::Protocol(format!("undecodable stream value: {e}")))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// Pushes one value toward the remote task, suspending while its
    /// unconsumed window is full.
    pub async fn send(&self, value: impl Serialize) -> Result<(), ActorError> {
        let value = serde_json::to_value(value)
            .map_err(|e| ActorError::Protocol(format!("unencodable stream value: {e}")))?;
        self.core.send_value(value).await
    }

    /// Ends the stream from this side; further sends on either side fail
    /// with [`ActorError::StreamClosed`].
    pub async fn close(&self) {
        self.core.close_sending();
        self.core.post_close().await;
    }

    /// Cancels just this context, leaving the rest of the portal's scope
    /// running.
    pub fn cancel(&self) {
        self.core.scope.cancel();
    }

    /// Suspends until the remote task settles and returns its final
    /// result.
    pub async fn finish<R: DeserializeOwned>(self) -> Result<R, ActorError> {
        let scope = self.core.scope.clone();
        let outcome = self
            .outcome
            .await
            .unwrap_or_else(|_| Err(scope.cancel_error()));
        let value = outcome?;
        serde_json::from_value(value)
            .map_err(|e| ActorError::Protocol(format!("undecodable return value: {e}")))
    }

    /// How many times this side's sends have suspended on a full window.
    #[must_use]
    pub fn backpressure_waits(&self) -> u64 {
        self.core.backpressure_waits()
    }
}

impl<T> fmt::Debug for StreamHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("peer", &self.core.peer.short())
            .finish()
    }
}
