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

//! The two halves of an in-flight remote invocation.
//!
//! A context is correlated state: the caller half suspends on the reply
//! route, the callee half runs the invoked task, and both sides own a cancel
//! scope linked under whatever scope opened them. Every suspension in this
//! module is a `select!` against that scope, which is what turns
//! cancellation into an explicit state transition rather than an interrupt.
//!
//! The first terminal envelope settles a context; the route registration is
//! removed with it, so anything arriving later is dropped by the mailbox as
//! a routing anomaly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::stream::{clamp_window, push_inbound, StreamCore};
use crate::actor::{ActorId, TaskContext, TaskFailure, TaskRegistry};
use crate::common::Wiring;
use crate::ipc::{Delivery, ROUTE_CHANNEL_CAPACITY};
use crate::message::{
    ActorError, CancelReason, Envelope, EnvelopeKind, RemoteError, ERROR_KIND_CANCELLED,
    ERROR_KIND_PROTOCOL,
};
use crate::nursery::CancelScope;

/// After sending `cancel`, how long the caller half waits for the callee's
/// terminal acknowledgement before giving up on the route.
const CANCEL_DRAIN: Duration = Duration::from_secs(5);

/// Lifecycle of one context half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextState {
    /// Created; invoke not yet on the wire (caller) or task not yet
    /// started (callee).
    Pending,
    /// In flight.
    Running,
    /// Settled with a value.
    Completed,
    /// Settled with an error.
    Errored,
    /// Settled by cancellation.
    Cancelled,
}

impl ContextState {
    /// Guarded transition; terminal states are sticky.
    pub(crate) fn advance(&mut self, next: ContextState) {
        debug_assert!(
            matches!(
                (*self, next),
                (ContextState::Pending, ContextState::Running)
                    | (ContextState::Pending, ContextState::Cancelled)
                    | (ContextState::Running, _)
            ),
            "illegal context transition {self:?} -> {next:?}"
        );
        if !matches!(
            *self,
            ContextState::Completed | ContextState::Errored | ContextState::Cancelled
        ) {
            trace!(from = ?*self, to = ?next, "context transition");
            *self = next;
        }
    }
}

/// Maps a terminal `error` envelope onto the caller-visible outcome.
fn map_error_kind(
    origin: ActorId,
    kind: String,
    message: String,
    remote_trace: Option<String>,
    scope: &CancelScope,
) -> ActorError {
    match kind.as_str() {
        ERROR_KIND_CANCELLED => ActorError::Cancelled {
            reason: scope.reason().unwrap_or(CancelReason::Explicit),
        },
        ERROR_KIND_PROTOCOL => ActorError::Protocol(message),
        _ => ActorError::Remote(RemoteError {
            kind,
            message,
            origin,
            remote_trace,
        }),
    }
}

/// Caller half of a context.
pub(crate) struct CallerContext {
    correlation_id: Uuid,
    peer: ActorId,
    wiring: Wiring,
    scope: CancelScope,
    rx: mpsc::Receiver<Delivery>,
    state: ContextState,
}

impl CallerContext {
    /// Opens the caller half: mints a correlation id, links a child scope
    /// under `parent`, and registers the reply route.
    pub(crate) fn open(wiring: Wiring, peer: ActorId, parent: &CancelScope) -> Self {
        let correlation_id = Uuid::new_v4();
        let scope = parent.child();
        let rx = wiring.mailbox.register_route(correlation_id, &peer);
        Self {
            correlation_id,
            peer,
            wiring,
            scope,
            rx,
            state: ContextState::Pending,
        }
    }

    fn envelope(&self, kind: EnvelopeKind) -> Envelope {
        Envelope::new(
            kind,
            self.correlation_id,
            self.wiring.local.clone(),
            self.peer.clone(),
        )
    }

    /// Puts the `invoke` on the wire.
    pub(crate) async fn invoke(
        &mut self,
        task: &str,
        args: Value,
        stream_window: Option<u32>,
    ) -> Result<(), ActorError> {
        let envelope = self.envelope(EnvelopeKind::Invoke {
            task: task.to_string(),
            args,
            stream_window,
        });
        self.wiring
            .mailbox
            .post(envelope)
            .await
            .map_err(|_| ActorError::TransportLost {
                peer: self.peer.clone(),
            })?;
        self.state.advance(ContextState::Running);
        Ok(())
    }

    /// Suspends until the context settles.
    ///
    /// If the owning scope is cancelled first, a `cancel` envelope goes out
    /// and the wait continues (bounded) for the callee's acknowledgement,
    /// so the callee side always observes an explicit transition.
    pub(crate) async fn await_result(mut self) -> Result<Value, ActorError> {
        loop {
            // Decide first, act after the select's futures are dropped.
            let step = tokio::select! {
                _ = self.scope.cancelled() => None,
                delivery = self.rx.recv() => Some(delivery),
            };
            match step {
                None => {
                    let cancel = self.envelope(EnvelopeKind::Cancel);
                    let _ = self.wiring.mailbox.post(cancel).await;
                    return self.drain_after_cancel().await;
                }
                Some(delivery) => {
                    if let Some(outcome) = self.settle(delivery) {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn drain_after_cancel(&mut self) -> Result<Value, ActorError> {
        loop {
            match timeout(CANCEL_DRAIN, self.rx.recv()).await {
                Ok(delivery @ Some(_)) => {
                    if let Some(outcome) = self.settle(delivery) {
                        return outcome;
                    }
                }
                Ok(None) | Err(_) => {
                    self.state.advance(ContextState::Cancelled);
                    return Err(self.scope.cancel_error());
                }
            }
        }
    }

    /// Applies one delivery; `Some` once the context has settled.
    fn settle(&mut self, delivery: Option<Delivery>) -> Option<Result<Value, ActorError>> {
        match delivery {
            Some(Delivery::Envelope(env)) => match env.kind {
                EnvelopeKind::Return { value } => {
                    self.state.advance(ContextState::Completed);
                    Some(Ok(value))
                }
                EnvelopeKind::Error {
                    kind,
                    message,
                    remote_trace,
                } => {
                    let error =
                        map_error_kind(env.from, kind, message, remote_trace, &self.scope);
                    self.state.advance(if error.is_cancellation() {
                        ContextState::Cancelled
                    } else {
                        ContextState::Errored
                    });
                    Some(Err(error))
                }
                other => {
                    // Yields and credits on a plain invocation have nothing
                    // to consume them.
                    debug!(kind = ?other, "dropping non-terminal envelope on plain context");
                    None
                }
            },
            Some(Delivery::TransportLost) | None => {
                self.scope.cancel_with(CancelReason::TransportLost);
                self.state.advance(ContextState::Cancelled);
                Some(Err(ActorError::Cancelled {
                    reason: CancelReason::TransportLost,
                }))
            }
        }
    }

    /// Converts the caller half into streaming parts, handing the route to
    /// a sidecar task that drives the context state machine.
    pub(crate) fn into_stream(
        mut self,
        window: u32,
    ) -> (
        Arc<StreamCore>,
        mpsc::Receiver<Value>,
        oneshot::Receiver<Result<Value, ActorError>>,
    ) {
        let window = clamp_window(window);
        let core = StreamCore::new(
            self.correlation_id,
            self.peer.clone(),
            self.wiring.clone(),
            self.scope.clone(),
            Some(window),
        );
        let (inbound_tx, inbound_rx) = mpsc::channel(ROUTE_CHANNEL_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let sidecar_core = core.clone();
        let wiring = self.wiring.clone();
        self.state.advance(ContextState::Running);
        wiring.io_tracker.clone().spawn(async move {
            let outcome = drive_caller_stream(&mut self, &sidecar_core, inbound_tx).await;
            let _ = outcome_tx.send(outcome);
        });

        (core, inbound_rx, outcome_rx)
    }
}

impl Drop for CallerContext {
    fn drop(&mut self) {
        self.wiring.mailbox.remove_route(&self.correlation_id);
        self.scope.finalize();
    }
}

/// One scheduling decision inside a stream sidecar's loop.
enum StreamStep {
    CancelRequested,
    DrainTimeout,
    Delivery(Option<Delivery>),
}

/// Drives a caller-side streaming context until it settles.
async fn drive_caller_stream(
    ctx: &mut CallerContext,
    core: &StreamCore,
    inbound_tx: mpsc::Sender<Value>,
) -> Result<Value, ActorError> {
    let mut inbound = Some(inbound_tx);
    let mut drain_deadline: Option<Instant> = None;

    let outcome = loop {
        let step = tokio::select! {
            _ = ctx.scope.cancelled(), if drain_deadline.is_none() => StreamStep::CancelRequested,
            _ = sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => StreamStep::DrainTimeout,
            delivery = ctx.rx.recv() => StreamStep::Delivery(delivery),
        };
        match step {
            StreamStep::CancelRequested => {
                let cancel = ctx.envelope(EnvelopeKind::Cancel);
                let _ = ctx.wiring.mailbox.post(cancel).await;
                drain_deadline = Some(Instant::now() + CANCEL_DRAIN);
            }
            StreamStep::DrainTimeout => break Err(ctx.scope.cancel_error()),
            StreamStep::Delivery(delivery) => match delivery {
                Some(Delivery::Envelope(env)) => match env.kind {
                    EnvelopeKind::Yield { value } => {
                        push_inbound(ctx.correlation_id, &inbound, value);
                    }
                    EnvelopeKind::StreamCredit { n } => core.add_credits(n),
                    EnvelopeKind::StreamClose => {
                        core.close_sending();
                        inbound = None;
                    }
                    EnvelopeKind::Return { value } => break Ok(value),
                    EnvelopeKind::Error { kind, message, remote_trace } => {
                        break Err(map_error_kind(env.from, kind, message, remote_trace, &ctx.scope));
                    }
                    other => debug!(kind = ?other, "unexpected envelope on stream context"),
                },
                Some(Delivery::TransportLost) | None => {
                    ctx.scope.cancel_with(CancelReason::TransportLost);
                    break Err(ActorError::Cancelled { reason: CancelReason::TransportLost });
                }
            },
        }
    };

    ctx.state.advance(match &outcome {
        Ok(_) => ContextState::Completed,
        Err(e) if e.is_cancellation() => ContextState::Cancelled,
        Err(_) => ContextState::Errored,
    });
    core.close_sending();
    outcome
}

/// Callee half: dispatches one inbound `invoke` through the task table and
/// drives the invoked task to a terminal reply.
#[instrument(skip(runtime, envelope), fields(actor = %runtime.id().short()))]
pub(crate) async fn run_callee(runtime: crate::common::ActorRuntime, envelope: Envelope) {
    let wiring = runtime.wiring();
    let root_scope = runtime.root_scope();
    let registry: Arc<TaskRegistry> = runtime.tasks();
    let correlation_id = envelope.correlation_id;
    let peer = envelope.from;
    let EnvelopeKind::Invoke {
        task,
        args,
        stream_window,
    } = envelope.kind
    else {
        warn!("run_callee called without an invoke envelope");
        return;
    };

    let reply_to = |kind: EnvelopeKind| {
        Envelope::new(kind, correlation_id, wiring.local.clone(), peer.clone())
    };

    // Unknown names are rejected, never dynamically resolved.
    let Some(handler) = registry.resolve(&task) else {
        debug!(%task, "rejecting invoke for unregistered task");
        let reply = reply_to(EnvelopeKind::Error {
            kind: ERROR_KIND_PROTOCOL.to_string(),
            message: format!("unknown task '{task}'"),
            remote_trace: None,
        });
        let _ = wiring.mailbox.post(reply).await;
        return;
    };

    let scope = root_scope.child();
    let mut state = ContextState::Pending;
    let rx = wiring.mailbox.register_route(correlation_id, &peer);
    let window = stream_window.map(clamp_window);
    let core = StreamCore::new(
        correlation_id,
        peer.clone(),
        wiring.clone(),
        scope.clone(),
        window,
    );
    let (inbound_tx, inbound_rx) = mpsc::channel(ROUTE_CHANNEL_CAPACITY);
    let inbound_tx = window.is_some().then_some(inbound_tx);

    wiring
        .io_tracker
        .clone()
        .spawn(drive_callee_route(rx, core.clone(), inbound_tx));

    let ctx = TaskContext::new(
        runtime.clone(),
        peer.clone(),
        correlation_id,
        scope.clone(),
        core.clone(),
        inbound_rx,
    );

    state.advance(ContextState::Running);
    let result = tokio::select! {
        _ = scope.cancelled() => None,
        result = handler(args, ctx) => Some(result),
    };

    let reply = match result {
        Some(Ok(value)) => {
            state.advance(ContextState::Completed);
            reply_to(EnvelopeKind::Return { value })
        }
        Some(Err(error)) => {
            state.advance(ContextState::Errored);
            let (kind, message, remote_trace) = describe_failure(&wiring.local, &error);
            reply_to(EnvelopeKind::Error {
                kind,
                message,
                remote_trace,
            })
        }
        None => {
            state.advance(ContextState::Cancelled);
            reply_to(EnvelopeKind::Error {
                kind: ERROR_KIND_CANCELLED.to_string(),
                message: scope.cancel_error().to_string(),
                remote_trace: None,
            })
        }
    };
    if wiring.mailbox.post(reply).await.is_err() {
        debug!(%correlation_id, "could not deliver terminal reply; transport gone");
    }

    core.close_sending();
    wiring.mailbox.remove_route(&correlation_id);
    scope.finalize();
}

/// Serializes a task failure for the wire: a [`TaskFailure`] keeps its
/// declared kind, anything else crosses as a generic error with its chain
/// as the trace.
fn describe_failure(local: &ActorId, error: &anyhow::Error) -> (String, String, Option<String>) {
    if let Some(failure) = error.downcast_ref::<TaskFailure>() {
        (
            failure.kind.clone(),
            failure.message.clone(),
            Some(format!("{}: {failure}", local.name)),
        )
    } else {
        (
            "error".to_string(),
            error.to_string(),
            Some(format!("{}: {error:#}", local.name)),
        )
    }
}

/// Feeds route deliveries into the callee half: remote cancel requests,
/// stream traffic, and transport loss.
async fn drive_callee_route(
    mut rx: mpsc::Receiver<Delivery>,
    core: Arc<StreamCore>,
    mut inbound_tx: Option<mpsc::Sender<Value>>,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Envelope(env) => match env.kind {
                EnvelopeKind::Cancel => core.scope.cancel_with(CancelReason::Explicit),
                EnvelopeKind::Yield { value } => {
                    push_inbound(core.correlation_id, &inbound_tx, value);
                }
                EnvelopeKind::StreamCredit { n } => core.add_credits(n),
                EnvelopeKind::StreamClose => {
                    core.close_sending();
                    inbound_tx = None;
                }
                other => debug!(kind = ?other, "unexpected envelope on callee context"),
            },
            Delivery::TransportLost => {
                core.scope.cancel_with(CancelReason::TransportLost);
                inbound_tx = None;
            }
        }
    }
}
