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

//! The per-process actor runtime.
//!
//! One process, one runtime: a listener, a mailbox, a registry, a task
//! table, and a root cancel scope. The runtime accepts peer connections,
//! dispatches inbound invokes onto the task table, and tears everything
//! down — flushing outstanding transports — when the root scope ends. An
//! actor never outlives its root nursery.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{timeout, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::interactive::{self, InteractiveGuard, INTERACTIVE_TASK};
use super::registry::{ActorDirectory, LocalRegistry};
use super::types::Wiring;
use crate::actor::{ActorId, BootstrapDescriptor, TaskRegistry};
use crate::ipc::{self, Control, IpcError, Mailbox};
use crate::message::{ActorError, CancelReason, Envelope, EnvelopeKind};
use crate::nursery::{CancelScope, Nursery};
use crate::portal::{run_callee, Portal};

/// Bound on each teardown phase while flushing.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct RuntimeInner {
    id: ActorId,
    listen_addr: SocketAddr,
    mailbox: Arc<Mailbox>,
    registry: Arc<dyn ActorDirectory>,
    tasks: Arc<crate::actor::TaskRegistry>,
    root_scope: CancelScope,
    /// Transports, accept loop, control loop, and context sidecars.
    io_tracker: TaskTracker,
    /// Callee-side invocation tasks.
    rpc_tracker: TaskTracker,
    pending_acks: DashMap<Uuid, oneshot::Sender<SocketAddr>>,
    parent: Option<ActorId>,
    /// The tree root and where to reach it; `(self, listen_addr)` on the
    /// root itself.
    root_ref: (ActorId, SocketAddr),
    /// Present only on the root: the tree-wide interactive gate.
    gate: Option<Arc<Semaphore>>,
    live: AtomicBool,
}

/// Handle to this process's actor runtime.
#[derive(Clone)]
pub struct ActorRuntime {
    inner: Arc<RuntimeInner>,
}

impl ActorRuntime {
    /// Launches a root actor runtime: binds a listener, initializes the
    /// registry, and starts serving. The root owns the interactive gate
    /// and the registry for its tree.
    #[instrument(skip(tasks))]
    pub async fn launch(name: &str, tasks: TaskRegistry) -> Result<Self, ActorError> {
        Self::start(ActorId::new(name), tasks, None, None, None).await
    }

    /// Boots a child runtime from its bootstrap descriptor: bind, connect
    /// back to the parent, send `spawn-ack`.
    pub(crate) async fn start_child(
        descriptor: BootstrapDescriptor,
        tasks: TaskRegistry,
    ) -> Result<Self, ActorError> {
        let deadline = descriptor.deadline_ms.map(Duration::from_millis);
        Self::start(
            descriptor.actor,
            tasks,
            Some((descriptor.parent, descriptor.parent_addr)),
            Some((descriptor.root, descriptor.root_addr)),
            deadline,
        )
        .await
    }

    async fn start(
        id: ActorId,
        mut tasks: TaskRegistry,
        parent: Option<(ActorId, SocketAddr)>,
        root_ref: Option<(ActorId, SocketAddr)>,
        deadline: Option<Duration>,
    ) -> Result<Self, ActorError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(IpcError::from)?;
        let listen_addr = listener.local_addr().map_err(IpcError::from)?;

        let (control_tx, control_rx) = mpsc::channel(64);
        let mailbox = Mailbox::new(id.clone(), control_tx);
        let root_scope = match deadline {
            Some(deadline) => CancelScope::root_with_deadline(deadline),
            None => CancelScope::root(),
        };

        let gate = parent.is_none().then(|| Arc::new(Semaphore::new(1)));
        if let Some(gate) = &gate {
            interactive::register_builtin(&mut tasks, gate.clone());
        }

        let registry: Arc<dyn ActorDirectory> = Arc::new(LocalRegistry::new());
        registry.register(id.clone(), listen_addr).await;
        let root_ref = root_ref.unwrap_or_else(|| (id.clone(), listen_addr));
        if root_ref.0 != id {
            registry.register(root_ref.0.clone(), root_ref.1).await;
        }

        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                id: id.clone(),
                listen_addr,
                mailbox,
                registry,
                tasks: Arc::new(tasks),
                root_scope,
                io_tracker: TaskTracker::new(),
                rpc_tracker: TaskTracker::new(),
                pending_acks: DashMap::new(),
                parent: parent.as_ref().map(|(parent_id, _)| parent_id.clone()),
                root_ref,
                gate,
                live: AtomicBool::new(true),
            }),
        };

        runtime
            .inner
            .io_tracker
            .spawn(accept_loop(runtime.clone(), listener));
        runtime
            .inner
            .io_tracker
            .spawn(control_loop(runtime.clone(), control_rx));

        if let Some((parent_id, parent_addr)) = parent {
            let hello = Envelope::control(
                EnvelopeKind::SpawnAck {
                    listen: listen_addr,
                },
                id.clone(),
                parent_id.clone(),
            );
            let stream = ipc::connect(parent_addr, &hello).await?;
            let sender = ipc::spawn_transport(
                stream,
                parent_id.clone(),
                runtime.inner.mailbox.clone(),
                &runtime.inner.io_tracker,
            );
            runtime.inner.mailbox.register_transport(sender);
            runtime
                .inner
                .registry
                .register(parent_id, parent_addr)
                .await;
        }

        info!(actor = %id.short(), %listen_addr, "actor runtime started");
        Ok(runtime)
    }

    /// This actor's identity.
    #[must_use]
    pub fn id(&self) -> &ActorId {
        &self.inner.id
    }

    /// Address this actor accepts connections on.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// The runtime's root cancel scope.
    #[must_use]
    pub fn root_scope(&self) -> CancelScope {
        self.inner.root_scope.clone()
    }

    /// False once teardown has begun.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    /// The runtime's registry (arbiter view).
    #[must_use]
    pub fn registry(&self) -> Arc<dyn ActorDirectory> {
        self.inner.registry.clone()
    }

    /// Opens a nursery directly over the root scope. Conventionally called
    /// once at startup; the actor exits when this nursery closes.
    #[must_use]
    pub fn root_nursery(&self) -> Nursery {
        Nursery::new(self.inner.root_scope.clone(), Some(self.clone()))
    }

    /// Opens a portal to a peer found through the registry, dialing a
    /// transport if none exists yet. Contexts link under `scope`.
    pub async fn connect(&self, peer: &ActorId, scope: &CancelScope) -> Result<Portal, ActorError> {
        if !self.inner.mailbox.has_transport(&peer.uid) {
            let addr = self.inner.registry.resolve(peer).await?;
            let hello = Envelope::control(
                EnvelopeKind::SpawnAck {
                    listen: self.inner.listen_addr,
                },
                self.inner.id.clone(),
                peer.clone(),
            );
            let stream = ipc::connect(addr, &hello).await?;
            let sender = ipc::spawn_transport(
                stream,
                peer.clone(),
                self.inner.mailbox.clone(),
                &self.inner.io_tracker,
            );
            self.inner.mailbox.register_transport(sender);
        }
        Ok(Portal::new(peer.clone(), self.wiring(), scope.clone(), None))
    }

    /// Acquires the tree-wide interactive gate.
    ///
    /// On the root this takes the permit directly; elsewhere it holds a
    /// live context against the root so the gate releases if this actor
    /// dies while holding it.
    pub async fn interactive(&self, scope: &CancelScope) -> Result<InteractiveGuard, ActorError> {
        if let Some(gate) = &self.inner.gate {
            let acquired = tokio::select! {
                _ = scope.cancelled() => None,
                permit = gate.clone().acquire_owned() => Some(permit),
            };
            return match acquired {
                None => Err(scope.cancel_error()),
                Some(Ok(permit)) => Ok(InteractiveGuard::local(permit)),
                Some(Err(_)) => Err(ActorError::Protocol("interactive gate closed".into())),
            };
        }
        let root = self.inner.root_ref.0.clone();
        let portal = self.connect(&root, scope).await?;
        let mut stream = portal
            .open_stream::<serde_json::Value, bool>(INTERACTIVE_TASK, serde_json::Value::Null, 1)
            .await?;
        match stream.recv().await? {
            Some(_) => Ok(InteractiveGuard::remote(stream)),
            None => Err(ActorError::Protocol("interactive gate refused".into())),
        }
    }

    /// Serves until the root scope ends (parent cancel, deadline, or local
    /// request), then flushes outstanding transports and returns.
    pub async fn serve(&self) -> Result<(), ActorError> {
        self.inner.root_scope.cancelled().await;
        self.teardown().await;
        Ok(())
    }

    /// Cancels the root scope and flushes. Equivalent to a local graceful
    /// shutdown request.
    #[instrument(skip(self), fields(actor = %self.inner.id.short()))]
    pub async fn shutdown(&self) {
        self.inner.root_scope.cancel();
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.inner.live.store(false, Ordering::Release);
        self.inner.rpc_tracker.close();
        if timeout(TEARDOWN_TIMEOUT, self.inner.rpc_tracker.wait())
            .await
            .is_err()
        {
            warn!("invocation tasks did not unwind within the teardown bound");
        }
        self.inner.mailbox.close_all();
        self.inner.io_tracker.close();
        if timeout(TEARDOWN_TIMEOUT, self.inner.io_tracker.wait())
            .await
            .is_err()
        {
            warn!("io tasks did not unwind within the teardown bound");
        }
        self.inner.root_scope.finalize();
        debug!(actor = %self.inner.id.short(), "runtime torn down");
    }

    pub(crate) fn wiring(&self) -> Wiring {
        Wiring {
            local: self.inner.id.clone(),
            mailbox: self.inner.mailbox.clone(),
            io_tracker: self.inner.io_tracker.clone(),
        }
    }

    pub(crate) fn tasks(&self) -> Arc<crate::actor::TaskRegistry> {
        self.inner.tasks.clone()
    }

    /// Builds the descriptor a child spawned under `scope` boots from.
    pub(crate) fn bootstrap_for(
        &self,
        child_id: &ActorId,
        scope: &CancelScope,
    ) -> BootstrapDescriptor {
        let deadline_ms = scope.effective_deadline().map(|at| {
            u64::try_from(at.saturating_duration_since(Instant::now()).as_millis())
                .unwrap_or(u64::MAX)
        });
        BootstrapDescriptor {
            actor: child_id.clone(),
            parent: self.inner.id.clone(),
            parent_addr: self.inner.listen_addr,
            root: self.inner.root_ref.0.clone(),
            root_addr: self.inner.root_ref.1,
            deadline_ms,
        }
    }

    /// Registers interest in a child's `spawn-ack` before launching it.
    pub(crate) fn expect_ack(&self, child_uid: Uuid) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending_acks.insert(child_uid, tx);
        rx
    }

    pub(crate) fn abandon_ack(&self, child_uid: &Uuid) {
        self.inner.pending_acks.remove(child_uid);
    }
}

impl fmt::Debug for ActorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRuntime")
            .field("id", &self.inner.id.short())
            .field("listen_addr", &self.inner.listen_addr)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Accepts peer connections until the root scope ends.
async fn accept_loop(runtime: ActorRuntime, listener: TcpListener) {
    let token = runtime.inner.root_scope.token();
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                debug!(%remote, "inbound connection");
                runtime
                    .inner
                    .io_tracker
                    .spawn(handle_connection(runtime.clone(), stream));
            }
            Err(e) => {
                warn!(%e, "accept failed");
            }
        }
    }
}

/// Performs the accept-side handshake and wires the transport in.
async fn handle_connection(runtime: ActorRuntime, mut stream: TcpStream) {
    match ipc::read_hello(&mut stream).await {
        Ok(envelope) => match envelope.kind {
            EnvelopeKind::SpawnAck { listen } if envelope.to == *runtime.id() => {
                let peer = envelope.from;
                let sender = ipc::spawn_transport(
                    stream,
                    peer.clone(),
                    runtime.inner.mailbox.clone(),
                    &runtime.inner.io_tracker,
                );
                runtime.inner.mailbox.register_transport(sender);
                runtime
                    .inner
                    .registry
                    .register(peer.clone(), listen)
                    .await;
                if let Some((_, ack)) = runtime.inner.pending_acks.remove(&peer.uid) {
                    let _ = ack.send(listen);
                }
                debug!(peer = %peer.short(), "peer transport established");
            }
            other => {
                warn!(kind = ?other, "connection presented an invalid hello; dropping");
            }
        },
        Err(e) => {
            warn!(%e, "handshake failed; dropping connection");
        }
    }
}

/// Handles per-actor control traffic from the mailbox.
async fn control_loop(runtime: ActorRuntime, mut control_rx: mpsc::Receiver<Control>) {
    let token = runtime.inner.root_scope.token();
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = control_rx.recv() => message,
        };
        match message {
            None => break,
            Some(Control::Invoke { envelope }) => {
                runtime
                    .inner
                    .rpc_tracker
                    .spawn(run_callee(runtime.clone(), envelope));
            }
            Some(Control::CancelRoot { from }) => {
                debug!(from = %from.short(), "root scope cancel requested remotely");
                let reason = if runtime.inner.parent.as_ref() == Some(&from) {
                    CancelReason::ParentShutdown
                } else {
                    CancelReason::Explicit
                };
                runtime.inner.root_scope.cancel_with(reason);
            }
            Some(Control::PeerLost { peer, error }) => {
                debug!(peer = %peer.short(), %error, "peer lost");
                runtime.inner.registry.deregister(&peer).await;
                if runtime.inner.parent.as_ref() == Some(&peer) {
                    // Orphaned: unwind rather than linger without a tree.
                    runtime
                        .inner
                        .root_scope
                        .cancel_with(CancelReason::ParentShutdown);
                }
            }
        }
    }
}
