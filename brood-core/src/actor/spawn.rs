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

//! Spawning child actors and monitoring their lifetimes.
//!
//! Every child gets a monitor task inside the owning nursery. The monitor
//! owns the startup-acknowledgement wait, translates scope cancellation
//! into a graceful remote shutdown (escalating to a kill after the grace
//! period), and funnels every failure — spawn timeout, early crash, lost
//! transport, bad exit status — through nursery aggregation rather than
//! raising at the spawn call site.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{ActorHandle, ActorId, ActorSpec, TaskRegistry, BOOTSTRAP_ENV};
use crate::common::{ActorRuntime, ChildState};
use crate::message::{ActorError, CancelReason, Envelope, EnvelopeKind};
use crate::nursery::{CancelScope, Nursery, NurseryInner};

/// Grace period for hosted actors, which have no spec to configure one.
const HOSTED_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

impl Nursery {
    /// Launches a new actor process under this nursery.
    ///
    /// Blocks until the child acknowledges startup or its startup fails.
    /// Startup failures are not raised here: they are recorded as child
    /// failures of this nursery (cancelling concurrent siblings), and the
    /// returned handle's portals report them on use. `Err` is reserved for
    /// misuse: a closed nursery or one with no attached runtime.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn spawn_actor(&self, spec: ActorSpec) -> Result<ActorHandle, ActorError> {
        self.ensure_open()?;
        let runtime = self
            .runtime()
            .cloned()
            .ok_or_else(|| {
                ActorError::Protocol("nursery has no actor runtime; child actors need one".into())
            })?;

        let child_id = ActorId::new(&spec.name);
        let descriptor = runtime.bootstrap_for(&child_id, &self.scope());
        let ack_rx = runtime.expect_ack(child_id.uid);
        let child_scope = self.scope().child();
        let (state_tx, state_rx) = watch::channel(ChildState::Pending);
        let handle = ActorHandle::new(
            child_id.clone(),
            runtime.wiring(),
            child_scope.clone(),
            state_rx,
        );
        self.register_child(handle.clone());

        let program = match spec.program.clone() {
            Some(program) => program,
            None => match std::env::current_exe() {
                Ok(program) => program,
                Err(e) => {
                    let error = ActorError::SpawnFailed {
                        actor: spec.name.clone(),
                        reason: format!("no program to launch: {e}"),
                    };
                    runtime.abandon_ack(&child_id.uid);
                    let _ = state_tx.send(ChildState::Failed(error.clone()));
                    self.shared().record_failure(error);
                    return Ok(handle);
                }
            },
        };

        let mut command = Command::new(program);
        command
            .args(&spec.args)
            .env(BOOTSTRAP_ENV, descriptor.to_env_value()?)
            .envs(spec.envs.iter().cloned())
            .kill_on_drop(true);

        match command.spawn() {
            Ok(process) => {
                trace!(child = %child_id.short(), "child process launched");
                self.tracker().spawn(monitor_process(
                    process,
                    child_id,
                    spec.startup_timeout,
                    spec.shutdown_grace,
                    ack_rx,
                    child_scope,
                    state_tx,
                    runtime,
                    self.shared(),
                ));
            }
            Err(e) => {
                let error = ActorError::SpawnFailed {
                    actor: spec.name.clone(),
                    reason: e.to_string(),
                };
                runtime.abandon_ack(&child_id.uid);
                let _ = state_tx.send(ChildState::Failed(error.clone()));
                self.shared().record_failure(error);
            }
        }

        handle.wait_settled().await;
        Ok(handle)
    }

    /// Runs a second actor runtime on a local task under this nursery.
    ///
    /// The hosted actor joins the tree through exactly the same transport
    /// and handshake path a separate process would: all communication still
    /// crosses the wire, nothing is shared. Used for same-process actors
    /// and heavily by the test suite.
    #[instrument(skip(self, tasks))]
    pub async fn spawn_hosted(
        &self,
        name: &str,
        tasks: TaskRegistry,
    ) -> Result<ActorHandle, ActorError> {
        self.ensure_open()?;
        let runtime = self
            .runtime()
            .cloned()
            .ok_or_else(|| {
                ActorError::Protocol("nursery has no actor runtime; child actors need one".into())
            })?;

        let child_id = ActorId::new(name);
        let descriptor = runtime.bootstrap_for(&child_id, &self.scope());
        let ack_rx = runtime.expect_ack(child_id.uid);
        let child_scope = self.scope().child();
        let (state_tx, state_rx) = watch::channel(ChildState::Pending);
        let handle = ActorHandle::new(
            child_id.clone(),
            runtime.wiring(),
            child_scope.clone(),
            state_rx,
        );
        self.register_child(handle.clone());

        let join = tokio::spawn(async move {
            let hosted = super::child::bootstrap(descriptor, tasks).await?;
            hosted.serve().await
        });
        self.tracker().spawn(monitor_hosted(
            join,
            child_id,
            ack_rx,
            child_scope,
            state_tx,
            runtime,
            self.shared(),
        ));

        handle.wait_settled().await;
        Ok(handle)
    }
}

/// Resolution of the startup phase.
enum Startup {
    Ready,
    Cancelled,
    Timeout,
    EarlyExit(String),
}

/// One decision in the running phase.
enum Step {
    Exited(Result<Option<i32>, String>),
    CancelChild,
    GraceElapsed,
    TransportDown,
}

#[allow(clippy::too_many_arguments)]
async fn monitor_process(
    mut process: Child,
    child_id: ActorId,
    startup_timeout: Duration,
    grace: Duration,
    mut ack_rx: oneshot::Receiver<SocketAddr>,
    child_scope: CancelScope,
    state_tx: watch::Sender<ChildState>,
    runtime: ActorRuntime,
    nursery: Arc<NurseryInner>,
) {
    let startup = tokio::select! {
        _ = child_scope.cancelled() => Startup::Cancelled,
        ack = timeout(startup_timeout, &mut ack_rx) => match ack {
            Ok(Ok(_listen)) => Startup::Ready,
            Ok(Err(_)) | Err(_) => Startup::Timeout,
        },
        status = process.wait() => Startup::EarlyExit(match status {
            Ok(status) => format!("exited during startup with {status}"),
            Err(e) => format!("wait failed: {e}"),
        }),
    };

    match startup {
        Startup::Ready => {
            let _ = state_tx.send(ChildState::Ready);
        }
        Startup::Cancelled => {
            runtime.abandon_ack(&child_id.uid);
            let _ = process.start_kill();
            let _ = process.wait().await;
            let _ = state_tx.send(ChildState::Exited);
            return;
        }
        Startup::Timeout => {
            runtime.abandon_ack(&child_id.uid);
            let _ = process.start_kill();
            let _ = process.wait().await;
            let error = ActorError::SpawnTimeout {
                actor: child_id.name.clone(),
            };
            let _ = state_tx.send(ChildState::Failed(error.clone()));
            nursery.record_failure(error);
            return;
        }
        Startup::EarlyExit(reason) => {
            runtime.abandon_ack(&child_id.uid);
            let error = ActorError::SpawnFailed {
                actor: child_id.name.clone(),
                reason,
            };
            let _ = state_tx.send(ChildState::Failed(error.clone()));
            nursery.record_failure(error);
            return;
        }
    }

    let transport_closed = transport_token(&runtime, &child_id);
    let mut cancel_sent = false;
    let mut grace_deadline: Option<Instant> = None;
    let mut transport_down = false;

    loop {
        let step = tokio::select! {
            status = process.wait() => Step::Exited(match status {
                Ok(status) => Ok(status.code()),
                Err(e) => Err(e.to_string()),
            }),
            _ = child_scope.cancelled(), if !cancel_sent => Step::CancelChild,
            _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => Step::GraceElapsed,
            _ = transport_closed.cancelled(), if !transport_down && !cancel_sent => Step::TransportDown,
        };
        match step {
            Step::CancelChild => {
                trace!(child = %child_id.short(), "forwarding cancel to child root scope");
                let cancel = Envelope::control(
                    EnvelopeKind::Cancel,
                    runtime.id().clone(),
                    child_id.clone(),
                );
                let _ = runtime.wiring().mailbox.post(cancel).await;
                cancel_sent = true;
                grace_deadline = Some(Instant::now() + grace);
            }
            Step::GraceElapsed => {
                warn!(child = %child_id.short(), "graceful shutdown grace elapsed; killing");
                let _ = process.start_kill();
                grace_deadline = None;
            }
            Step::TransportDown => {
                // Connection gone while the process still runs: the child
                // is unreachable, which makes it a failed child.
                transport_down = true;
                let _ = process.start_kill();
                nursery.record_failure(ActorError::TransportLost {
                    peer: child_id.clone(),
                });
            }
            Step::Exited(status) => {
                runtime.registry().deregister(&child_id).await;
                let failed = match &status {
                    _ if child_scope.is_cancel_requested() || transport_down => None,
                    Ok(Some(0)) => None,
                    Ok(code) => Some(ActorError::ChildExit {
                        actor: child_id.clone(),
                        status: *code,
                    }),
                    Err(reason) => Some(ActorError::SpawnFailed {
                        actor: child_id.name.clone(),
                        reason: reason.clone(),
                    }),
                };
                if let Some(error) = failed {
                    debug!(child = %child_id.short(), %error, "child process failed");
                    nursery.record_failure(error);
                }
                let _ = state_tx.send(ChildState::Exited);
                return;
            }
        }
    }
}

async fn monitor_hosted(
    mut join: JoinHandle<Result<(), ActorError>>,
    child_id: ActorId,
    mut ack_rx: oneshot::Receiver<SocketAddr>,
    child_scope: CancelScope,
    state_tx: watch::Sender<ChildState>,
    runtime: ActorRuntime,
    nursery: Arc<NurseryInner>,
) {
    let startup = tokio::select! {
        _ = child_scope.cancelled() => Startup::Cancelled,
        ack = timeout(HANDSHAKE_WINDOW, &mut ack_rx) => match ack {
            Ok(Ok(_listen)) => Startup::Ready,
            Ok(Err(_)) | Err(_) => Startup::Timeout,
        },
        result = &mut join => Startup::EarlyExit(describe_join(result)),
    };

    match startup {
        Startup::Ready => {
            let _ = state_tx.send(ChildState::Ready);
        }
        Startup::Cancelled => {
            runtime.abandon_ack(&child_id.uid);
            join.abort();
            let _ = state_tx.send(ChildState::Exited);
            return;
        }
        Startup::Timeout => {
            runtime.abandon_ack(&child_id.uid);
            join.abort();
            let error = ActorError::SpawnTimeout {
                actor: child_id.name.clone(),
            };
            let _ = state_tx.send(ChildState::Failed(error.clone()));
            nursery.record_failure(error);
            return;
        }
        Startup::EarlyExit(reason) => {
            runtime.abandon_ack(&child_id.uid);
            let error = ActorError::SpawnFailed {
                actor: child_id.name.clone(),
                reason,
            };
            let _ = state_tx.send(ChildState::Failed(error.clone()));
            nursery.record_failure(error);
            return;
        }
    }

    let transport_closed = transport_token(&runtime, &child_id);
    let mut cancel_sent = false;
    let mut grace_deadline: Option<Instant> = None;
    let mut transport_down = false;

    loop {
        let step = tokio::select! {
            result = &mut join => Step::Exited(match result {
                Ok(Ok(())) => Ok(Some(0)),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join_error) if join_error.is_cancelled() => Ok(Some(0)),
                Err(join_error) => Err(format!("hosted actor panicked: {join_error}")),
            }),
            _ = child_scope.cancelled(), if !cancel_sent => Step::CancelChild,
            _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => Step::GraceElapsed,
            _ = transport_closed.cancelled(), if !transport_down && !cancel_sent => Step::TransportDown,
        };
        match step {
            Step::CancelChild => {
                let cancel = Envelope::control(
                    EnvelopeKind::Cancel,
                    runtime.id().clone(),
                    child_id.clone(),
                );
                let _ = runtime.wiring().mailbox.post(cancel).await;
                cancel_sent = true;
                grace_deadline = Some(Instant::now() + HOSTED_SHUTDOWN_GRACE);
            }
            Step::GraceElapsed => {
                join.abort();
                grace_deadline = None;
            }
            Step::TransportDown => {
                transport_down = true;
                join.abort();
                nursery.record_failure(ActorError::TransportLost {
                    peer: child_id.clone(),
                });
            }
            Step::Exited(status) => {
                runtime.registry().deregister(&child_id).await;
                let failed = match &status {
                    _ if child_scope.is_cancel_requested() || transport_down => None,
                    Ok(_) => None,
                    Err(reason) => Some(ActorError::SpawnFailed {
                        actor: child_id.name.clone(),
                        reason: reason.clone(),
                    }),
                };
                if let Some(error) = failed {
                    nursery.record_failure(error);
                }
                let _ = state_tx.send(ChildState::Exited);
                return;
            }
        }
    }
}

/// Startup window for hosted actors (loopback connect plus one frame).
const HANDSHAKE_WINDOW: Duration = Duration::from_secs(10);

fn describe_join(result: Result<Result<(), ActorError>, tokio::task::JoinError>) -> String {
    match result {
        Ok(Ok(())) => "exited during startup".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(join_error) => format!("hosted actor panicked: {join_error}"),
    }
}

/// The child transport's closed-token, or an already-fired token when the
/// transport is missing (treated as lost).
fn transport_token(runtime: &ActorRuntime, child_id: &ActorId) -> CancellationToken {
    match runtime.wiring().mailbox.transport(&child_id.uid) {
        Some(sender) => sender.closed(),
        None => {
            let token = CancellationToken::new();
            token.cancel();
            token
        }
    }
}
