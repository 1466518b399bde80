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

use std::fmt;

use tokio::sync::watch;
use tracing::instrument;

use super::ActorId;
use crate::common::{ChildState, Wiring};
use crate::message::{ActorError, CancelReason};
use crate::nursery::CancelScope;
use crate::portal::Portal;

/// Handle to a child actor owned by a nursery.
///
/// The nursery owns the child by value through this handle; the mailbox
/// keeps only a routing entry for the peer, so the handle is the one place
/// the child's lifetime is managed from.
#[derive(Clone)]
pub struct ActorHandle {
    id: ActorId,
    wiring: Wiring,
    /// Control scope for this child, a child of the owning nursery's scope.
    /// Cancelling it triggers graceful shutdown of the remote actor.
    scope: CancelScope,
    state: watch::Receiver<ChildState>,
}

impl ActorHandle {
    pub(crate) fn new(
        id: ActorId,
        wiring: Wiring,
        scope: CancelScope,
        state: watch::Receiver<ChildState>,
    ) -> Self {
        Self {
            id,
            wiring,
            scope,
            state,
        }
    }

    /// The child's identity.
    #[must_use]
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Opens a portal to this child. Contexts created through it link
    /// their cancel scopes under `scope`.
    #[must_use]
    pub fn portal(&self, scope: &CancelScope) -> Portal {
        Portal::new(
            self.id.clone(),
            self.wiring.clone(),
            scope.clone(),
            Some(self.state.clone()),
        )
    }

    /// Suspends until the child has acknowledged startup, reporting the
    /// failure if it never does.
    pub async fn wait_ready(&self) -> Result<(), ActorError> {
        self.portal(&self.scope).wait_ready().await
    }

    /// Requests graceful termination (equivalent to cancelling the child's
    /// root scope) and waits for the process to exit. The monitor escalates
    /// to a forced kill after the configured grace period.
    #[instrument(skip(self), fields(child = %self.id.short()))]
    pub async fn shutdown(&self) -> Result<(), ActorError> {
        self.scope.cancel_with(CancelReason::ParentShutdown);
        self.wait_exited().await;
        Ok(())
    }

    /// Suspends until the child has terminated, however that happened.
    pub async fn wait_exited(&self) {
        let mut state = self.state.clone();
        loop {
            if matches!(*state.borrow(), ChildState::Exited | ChildState::Failed(_)) {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits until startup has settled one way or the other, without
    /// turning a failure into a caller-side error (failures funnel through
    /// the owning nursery).
    pub(crate) async fn wait_settled(&self) {
        let mut state = self.state.clone();
        loop {
            if !matches!(*state.borrow(), ChildState::Pending) {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("id", &self.id.short())
            .field("state", &*self.state.borrow())
            .finish()
    }
}
