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

//! The arbiter: actor identity to reachable address.
//!
//! Registry state is scoped to the runtime that owns it — initialized at
//! startup, dropped when the runtime tears down — and is only reached
//! through the [`ActorDirectory`] interface, never as ambient globals.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::actor::ActorId;
use crate::ipc::IpcError;

/// Directory mapping actor identities to reachable addresses.
///
/// The trait is the seam: a single-process tree uses [`LocalRegistry`],
/// while a distributed arbiter can answer the same questions over its own
/// transport.
#[async_trait]
pub trait ActorDirectory: Send + Sync + fmt::Debug {
    /// Records where `id` can be reached.
    async fn register(&self, id: ActorId, addr: SocketAddr);

    /// Looks up a reachable address for `id`.
    async fn resolve(&self, id: &ActorId) -> Result<SocketAddr, IpcError>;

    /// Forgets `id`. Idempotent.
    async fn deregister(&self, id: &ActorId);
}

/// In-process directory: the runtime's own view of itself, its parent, its
/// children, and the tree root.
#[derive(Default)]
pub struct LocalRegistry {
    entries: DashMap<Uuid, (ActorId, SocketAddr)>,
}

impl LocalRegistry {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered actors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no actors are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ActorDirectory for LocalRegistry {
    async fn register(&self, id: ActorId, addr: SocketAddr) {
        self.entries.insert(id.uid, (id, addr));
    }

    async fn resolve(&self, id: &ActorId) -> Result<SocketAddr, IpcError> {
        self.entries
            .get(&id.uid)
            .map(|entry| entry.value().1)
            .ok_or_else(|| IpcError::ActorNotFound(id.to_string()))
    }

    async fn deregister(&self, id: &ActorId) {
        self.entries.remove(&id.uid);
    }
}

impl fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve() {
        let registry = LocalRegistry::new();
        let id = ActorId::new("worker");
        let addr: SocketAddr = "127.0.0.1:4100".parse().unwrap();
        registry.register(id.clone(), addr).await;
        assert_eq!(registry.resolve(&id).await.unwrap(), addr);
    }

    #[tokio::test]
    async fn unknown_actor_is_not_found() {
        let registry = LocalRegistry::new();
        let id = ActorId::new("ghost");
        assert!(matches!(
            registry.resolve(&id).await,
            Err(IpcError::ActorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = LocalRegistry::new();
        let id = ActorId::new("worker");
        registry
            .register(id.clone(), "127.0.0.1:4100".parse().unwrap())
            .await;
        registry.deregister(&id).await;
        registry.deregister(&id).await;
        assert!(registry.is_empty());
    }
}
