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
#![allow(dead_code)]

use std::time::Duration;

use brood::prelude::*;
use serde_json::Value;
use tokio::time::timeout;

use crate::setup::{initialize_tracing, worker_tasks};

mod setup;

/// The interactive gate is exclusive tree-wide: while the root holds it, a
/// child actor's acquisition blocks, and proceeds once the root releases.
#[tokio::test]
async fn gate_is_mutually_exclusive_across_the_tree() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    worker.wait_ready().await?;

    let guard = runtime.interactive(&nursery.scope()).await?;

    let portal = worker.portal(&nursery.scope());
    let contender = portal.run::<_, bool>("grab_gate", Value::Null);
    tokio::pin!(contender);
    assert!(
        timeout(Duration::from_millis(200), contender.as_mut())
            .await
            .is_err(),
        "child acquired the gate while the root held it"
    );

    guard.release();
    let acquired: bool = contender.await?;
    assert!(acquired);

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}

/// A holder that dies releases the gate: the permit is tied to a live
/// context, not to good manners.
#[tokio::test]
async fn gate_releases_when_the_holding_actor_dies() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let holder = nursery.spawn_hosted("holder", worker_tasks()).await?;
    holder.wait_ready().await?;

    let portal = holder.portal(&nursery.scope());
    let mut stream = portal
        .open_stream::<Value, bool>("acquire_and_hold", Value::Null, 1)
        .await?;
    assert_eq!(stream.recv().await?, Some(true), "holder never took the gate");

    // Kill the holder while it still holds the gate.
    holder.shutdown().await?;

    let guard = timeout(
        Duration::from_secs(3),
        runtime.interactive(&nursery.scope()),
    )
    .await
    .expect("gate was not released after the holder died")?;
    guard.release();

    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}
