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

#![forbid(unsafe_code)]
//! # Brood
//!
//! Brood is a structured-concurrency actor runtime: a process spawns other
//! OS processes as actors, bounds their lifetimes with nursery scopes, and
//! talks to them over typed message channels. Cancellation, error
//! aggregation, and lifetime ordering behave exactly as they do for local
//! tasks — across process boundaries.
//!
//! ```ignore
//! use brood::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // A spawned child re-enters main; hand it its task table.
//!     if BroodApp::is_child() {
//!         return BroodApp::child_main(worker_tasks()).await;
//!     }
//!
//!     let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
//!     let nursery = runtime.root_nursery();
//!     let worker = nursery.spawn_actor(ActorSpec::new("worker")).await?;
//!
//!     let portal = worker.portal(&nursery.scope());
//!     let doubled: i64 = portal.run("double", 21).await?;
//!     assert_eq!(doubled, 42);
//!
//!     worker.shutdown().await?;
//!     nursery.close().await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub use brood_core::prelude::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use brood_core::prelude::*;

    pub use crate::BroodApp;
}

/// Application entry points for the Brood runtime.
///
/// `BroodApp` is the launcher: it boots the root runtime for a fresh
/// process, or — in a process that was spawned as an actor — hands control
/// to the child bootstrap path.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroodApp;

impl BroodApp {
    /// Launches a root actor runtime for this process.
    pub async fn launch(name: &str, tasks: TaskRegistry) -> anyhow::Result<ActorRuntime> {
        Ok(ActorRuntime::launch(name, tasks).await?)
    }

    /// True when this process was spawned as a brood actor and should call
    /// [`BroodApp::child_main`] instead of launching its own tree.
    #[must_use]
    pub fn is_child() -> bool {
        BootstrapDescriptor::is_present()
    }

    /// Runs the child side: bootstrap from the environment, serve until
    /// the root scope ends, flush, return.
    pub async fn child_main(tasks: TaskRegistry) -> anyhow::Result<()> {
        brood_core::child_main(tasks).await?;
        Ok(())
    }
}

/// Installs a `tracing` subscriber honoring `RUST_LOG`, once.
///
/// Safe to call from every test or binary entry point; later calls are
/// no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
