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

//! Per-actor envelope router.
//!
//! The mailbox owns the actor's transports and demultiplexes inbound
//! envelopes to whichever local context registered the correlation id.
//! Routing is a pure lookup: an envelope whose correlation id has no live
//! registration is dropped and logged as a routing anomaly, because it may
//! legitimately arrive after local cancellation tore the context down.
//!
//! The mailbox is the one structure mutated by many concurrent local tasks
//! (contexts registering and deregistering routes); the concurrent maps
//! serialize those mutations. Everything else in the runtime is owned by a
//! single task.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::transport::TransportSender;
use super::types::IpcError;
use crate::actor::ActorId;
use crate::message::{Envelope, EnvelopeKind};

/// Capacity of each context's route channel. Must comfortably exceed the
/// largest stream credit window so a full window of yields never blocks the
/// transport read loop.
pub(crate) const ROUTE_CHANNEL_CAPACITY: usize = 64;

/// What a registered route receives.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// An envelope for this correlation id, in transport order.
    Envelope(Envelope),
    /// The transport under this context died; no further envelopes can
    /// arrive or be sent.
    TransportLost,
}

/// Per-actor control traffic surfaced to the runtime rather than a context.
#[derive(Debug)]
pub(crate) enum Control {
    /// An `invoke` opening a new callee-side context.
    Invoke { envelope: Envelope },
    /// A `cancel` addressed to this actor's root scope.
    CancelRoot { from: ActorId },
    /// A peer's transport failed or closed.
    PeerLost { peer: ActorId, error: IpcError },
}

struct Route {
    tx: mpsc::Sender<Delivery>,
    peer_uid: Uuid,
}

/// Per-actor multiplexer owning the transports and the correlation-id
/// routing table.
pub(crate) struct Mailbox {
    local: ActorId,
    routes: DashMap<Uuid, Route>,
    transports: DashMap<Uuid, TransportSender>,
    control: mpsc::Sender<Control>,
}

impl Mailbox {
    pub(crate) fn new(local: ActorId, control: mpsc::Sender<Control>) -> Arc<Self> {
        Arc::new(Self {
            local,
            routes: DashMap::new(),
            transports: DashMap::new(),
            control,
        })
    }

    pub(crate) fn local_id(&self) -> &ActorId {
        &self.local
    }

    /// Registers a live context under its correlation id and returns the
    /// receiving end of its route.
    pub(crate) fn register_route(&self, correlation_id: Uuid, peer: &ActorId) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(ROUTE_CHANNEL_CAPACITY);
        let previous = self.routes.insert(
            correlation_id,
            Route {
                tx,
                peer_uid: peer.uid,
            },
        );
        if previous.is_some() {
            // Correlation ids are uuids minted per context; a collision here
            // means a context leaked its registration.
            warn!(%correlation_id, "replacing a live route registration");
        }
        rx
    }

    /// Drops a context's registration. Envelopes arriving afterwards for
    /// this correlation id are routing anomalies and get dropped.
    pub(crate) fn remove_route(&self, correlation_id: &Uuid) {
        self.routes.remove(correlation_id);
    }

    /// Adds a connected peer transport.
    pub(crate) fn register_transport(&self, sender: TransportSender) {
        let peer = sender.peer().clone();
        if self.transports.insert(peer.uid, sender).is_some() {
            warn!(peer = %peer.short(), "replacing an existing transport");
        }
    }

    pub(crate) fn transport(&self, peer_uid: &Uuid) -> Option<TransportSender> {
        self.transports.get(peer_uid).map(|t| t.value().clone())
    }

    pub(crate) fn has_transport(&self, peer_uid: &Uuid) -> bool {
        self.transports.contains_key(peer_uid)
    }

    /// Sends an envelope to the peer it is addressed to.
    pub(crate) async fn post(&self, envelope: Envelope) -> Result<(), IpcError> {
        let Some(transport) = self.transport(&envelope.to.uid) else {
            return Err(IpcError::ActorNotFound(envelope.to.to_string()));
        };
        transport.send(envelope).await
    }

    /// Routes one inbound envelope.
    ///
    /// Called from transport read loops, one envelope at a time per
    /// transport, which preserves per-transport delivery order.
    pub(crate) async fn deliver(&self, envelope: Envelope) {
        trace!(
            correlation_id = %envelope.correlation_id,
            from = %envelope.from.short(),
            "inbound envelope"
        );

        if matches!(envelope.kind, EnvelopeKind::Invoke { .. }) {
            let _ = self.control.send(Control::Invoke { envelope }).await;
            return;
        }
        if envelope.is_control() {
            match envelope.kind {
                EnvelopeKind::Cancel => {
                    let _ = self
                        .control
                        .send(Control::CancelRoot {
                            from: envelope.from,
                        })
                        .await;
                }
                // A spawn-ack after the handshake has no live meaning.
                ref kind => {
                    debug!(?kind, "dropping control envelope outside handshake");
                }
            }
            return;
        }

        let tx = self
            .routes
            .get(&envelope.correlation_id)
            .map(|route| route.tx.clone());
        match tx {
            Some(tx) => {
                if tx.send(Delivery::Envelope(envelope)).await.is_err() {
                    trace!("route receiver dropped before delivery");
                }
            }
            None => {
                // Not an error: replies and stream traffic can legitimately
                // cross a local teardown on the wire.
                debug!(
                    correlation_id = %envelope.correlation_id,
                    from = %envelope.from.short(),
                    "routing anomaly: no live context for envelope"
                );
            }
        }
    }

    /// Fans a transport failure out to every context that was multiplexed
    /// on it, then tells the runtime.
    pub(crate) async fn transport_failed(&self, peer: &ActorId, error: IpcError) {
        if self.transports.remove(&peer.uid).is_none() {
            // Reader and writer halves both report; only the first matters.
            return;
        }
        debug!(peer = %peer.short(), %error, "transport failed");

        let affected: Vec<mpsc::Sender<Delivery>> = self
            .routes
            .iter()
            .filter(|entry| entry.value().peer_uid == peer.uid)
            .map(|entry| entry.value().tx.clone())
            .collect();
        join_all(affected.into_iter().map(|tx| async move {
            let _ = tx.send(Delivery::TransportLost).await;
        }))
        .await;

        let _ = self
            .control
            .send(Control::PeerLost {
                peer: peer.clone(),
                error,
            })
            .await;
    }

    /// Closes all transports, letting writers drain queued envelopes.
    pub(crate) fn close_all(&self) {
        for entry in self.transports.iter() {
            entry.value().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> (Arc<Mailbox>, mpsc::Receiver<Control>) {
        let (control_tx, control_rx) = mpsc::channel(16);
        (Mailbox::new(ActorId::new("local"), control_tx), control_rx)
    }

    fn reply(corr: Uuid, from: &ActorId, to: &ActorId) -> Envelope {
        Envelope::new(
            EnvelopeKind::Return {
                value: serde_json::json!(1),
            },
            corr,
            from.clone(),
            to.clone(),
        )
    }

    #[tokio::test]
    async fn routes_by_correlation_id() {
        let (mailbox, _control) = mailbox();
        let peer = ActorId::new("peer");
        let corr = Uuid::new_v4();
        let mut rx = mailbox.register_route(corr, &peer);

        mailbox
            .deliver(reply(corr, &peer, mailbox.local_id()))
            .await;
        match rx.recv().await {
            Some(Delivery::Envelope(env)) => assert_eq!(env.correlation_id, corr),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_arrival_is_dropped_not_delivered() {
        let (mailbox, _control) = mailbox();
        let peer = ActorId::new("peer");
        let corr = Uuid::new_v4();
        let mut rx = mailbox.register_route(corr, &peer);
        mailbox.remove_route(&corr);

        mailbox
            .deliver(reply(corr, &peer, mailbox.local_id()))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invoke_goes_to_the_runtime() {
        let (mailbox, mut control) = mailbox();
        let peer = ActorId::new("peer");
        let env = Envelope::new(
            EnvelopeKind::Invoke {
                task: "double".into(),
                args: serde_json::json!(21),
                stream_window: None,
            },
            Uuid::new_v4(),
            peer,
            mailbox.local_id().clone(),
        );
        mailbox.deliver(env).await;
        assert!(matches!(
            control.recv().await,
            Some(Control::Invoke { .. })
        ));
    }

    #[tokio::test]
    async fn nil_correlation_cancel_targets_the_root_scope() {
        let (mailbox, mut control) = mailbox();
        let peer = ActorId::new("parent");
        mailbox
            .deliver(Envelope::control(
                EnvelopeKind::Cancel,
                peer.clone(),
                mailbox.local_id().clone(),
            ))
            .await;
        match control.recv().await {
            Some(Control::CancelRoot { from }) => assert_eq!(from, peer),
            other => panic!("expected root cancel, got {other:?}"),
        }
    }
}
