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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brood::prelude::*;
use tokio::time::Instant;

use crate::setup::{initialize_tracing, worker_tasks};

mod setup;

/// Closing a nursery does not return until every owned task has a terminal
/// outcome, even when those tasks are still running at close time.
#[tokio::test]
async fn close_waits_for_every_owned_task() -> anyhow::Result<()> {
    initialize_tracing();
    let nursery = Nursery::local();
    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let finished = finished.clone();
        nursery.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
    }
    nursery.close().await?;
    assert_eq!(finished.load(Ordering::SeqCst), 4);
    Ok(())
}

/// One failing task: the nursery's outcome is exactly that error, and the
/// concurrent sibling observes cancellation before close returns.
#[tokio::test]
async fn one_failure_cancels_siblings_and_propagates() -> anyhow::Result<()> {
    initialize_tracing();
    let nursery = Nursery::local();

    let sibling_cancelled = Arc::new(AtomicBool::new(false));
    let witness = sibling_cancelled.clone();
    let scope = nursery.scope();
    nursery.spawn(async move {
        scope.cancelled().await;
        witness.store(true, Ordering::SeqCst);
        Ok(())
    })?;
    nursery.spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Err(ActorError::Protocol("boom".into()))
    })?;

    match nursery.close().await {
        Err(ActorError::Protocol(msg)) => assert_eq!(msg, "boom"),
        other => panic!("expected the single failure itself, got {other:?}"),
    }
    assert!(sibling_cancelled.load(Ordering::SeqCst));
    Ok(())
}

/// A nursery deadline behaves exactly like an external cancel: the scope's
/// outcome is `cancelled` with the deadline reason.
#[tokio::test]
async fn deadline_expiry_cancels_like_an_external_cancel() -> anyhow::Result<()> {
    initialize_tracing();
    let nursery = Nursery::local_with_deadline(Duration::from_millis(50));
    nursery.spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    })?;
    let started = Instant::now();
    match nursery.close().await {
        Err(ActorError::Cancelled { reason }) => assert_eq!(reason, CancelReason::Deadline),
        other => panic!("expected deadline cancellation, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    Ok(())
}

/// Cancelling an outer scope transitively cancels a nested nursery and the
/// child actor spawned inside it; both closes report cancellation, not
/// failure.
#[tokio::test]
async fn cancel_propagates_through_nested_scopes_into_child_actors() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let outer = runtime.root_nursery();
    let nested = outer.nested();

    let worker = nested.spawn_hosted("worker", worker_tasks()).await?;
    worker.wait_ready().await?;

    outer.cancel();

    // The nested close returning proves the child actor reached a terminal
    // state under the transitive cancel.
    match nested.close().await {
        Err(ActorError::Cancelled { .. }) => {}
        other => panic!("expected nested cancellation, got {other:?}"),
    }
    match outer.close().await {
        Err(ActorError::Cancelled { .. }) => {}
        other => panic!("expected outer cancellation, got {other:?}"),
    }
    runtime.shutdown().await;
    Ok(())
}

/// Close blocks on a still-running child actor until it exits.
#[tokio::test]
async fn close_waits_for_child_actor_exit() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    worker.wait_ready().await?;

    let handle = worker.clone();
    nursery.spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.shutdown().await?;
        Ok(())
    })?;

    let started = Instant::now();
    nursery.close().await?;
    assert!(
        started.elapsed() >= Duration::from_millis(140),
        "close returned before the child actor exited"
    );
    runtime.shutdown().await;
    Ok(())
}
