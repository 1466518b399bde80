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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brood::prelude::*;
use serde_json::Value;
use tokio::time::timeout;

use crate::setup::{initialize_tracing, worker_tasks, FailArgs};

mod setup;

/// Scenario: the root spawns worker B under nursery N, invokes `double(21)`
/// through a portal, gets 42 exactly once, and `close(N)` returns normally.
#[tokio::test]
async fn portal_run_resolves_with_the_remote_result() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    worker.wait_ready().await?;

    let portal = worker.portal(&nursery.scope());
    let doubled: i64 = portal.run("double", 21i64).await?;
    assert_eq!(doubled, 42);

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}

/// Scenario: B raises `ValueError("x")` while sibling C is still running.
/// The nursery's close reports exactly that error, identifying B, and the
/// sibling branch observes cancellation before close returns.
#[tokio::test]
async fn remote_failure_propagates_and_cancels_siblings() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let b = nursery.spawn_hosted("b", worker_tasks()).await?;
    let _c = nursery.spawn_hosted("c", worker_tasks()).await?;

    let observed_cancel = Arc::new(AtomicBool::new(false));
    let witness = observed_cancel.clone();
    let scope = nursery.scope();
    nursery.spawn(async move {
        scope.cancelled().await;
        witness.store(true, Ordering::SeqCst);
        Ok(())
    })?;

    let portal = b.portal(&nursery.scope());
    nursery.spawn(async move {
        portal
            .run::<_, Value>(
                "fail",
                FailArgs {
                    kind: "ValueError".into(),
                    message: "x".into(),
                },
            )
            .await
            .map(|_| ())
    })?;

    match nursery.close().await {
        Err(ActorError::Remote(remote)) => {
            assert_eq!(remote.kind, "ValueError");
            assert_eq!(remote.message, "x");
            assert_eq!(remote.origin.name, "b");
        }
        other => panic!("expected the remote failure, got {other:?}"),
    }
    assert!(
        observed_cancel.load(Ordering::SeqCst),
        "sibling branch never observed the cancellation"
    );
    runtime.shutdown().await;
    Ok(())
}

/// A remote error is typed: distinguishable from a local error of the same
/// kind and carrying the remote failure summary.
#[tokio::test]
async fn remote_errors_carry_kind_message_and_origin() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    let portal = worker.portal(&nursery.scope());

    let error = portal
        .run::<_, Value>(
            "fail",
            FailArgs {
                kind: "KeyError".into(),
                message: "missing".into(),
            },
        )
        .await
        .unwrap_err();
    match error {
        ActorError::Remote(remote) => {
            assert_eq!(remote.kind, "KeyError");
            assert_eq!(remote.message, "missing");
            assert!(remote.remote_trace.is_some());
        }
        other => panic!("expected a typed remote error, got {other:?}"),
    }

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}

/// Cancelling the caller's scope sends `cancel` for the in-flight context;
/// the callee unwinds and the caller resolves with a cancellation outcome.
#[tokio::test]
async fn cancelling_the_scope_cancels_in_flight_contexts() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let nested = nursery.nested();
    let worker = nested.spawn_hosted("worker", worker_tasks()).await?;
    worker.wait_ready().await?;

    let portal = worker.portal(&nested.scope());
    let run = portal.run::<_, Value>("block_forever", Value::Null);
    tokio::pin!(run);

    assert!(
        timeout(Duration::from_millis(200), run.as_mut()).await.is_err(),
        "blocked task should still be in flight"
    );
    nested.cancel();

    let outcome = run.await;
    assert!(
        outcome.as_ref().err().is_some_and(ActorError::is_cancellation),
        "expected a cancellation outcome, got {outcome:?}"
    );

    match nested.close().await {
        Err(ActorError::Cancelled { .. }) => {}
        other => panic!("expected cancelled scope outcome, got {other:?}"),
    }
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}

/// Unknown task names are rejected with a protocol error; the transport
/// stays healthy for later invocations.
#[tokio::test]
async fn unknown_task_names_are_rejected() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    let portal = worker.portal(&nursery.scope());

    let error = portal
        .run::<_, Value>("no_such_task", Value::Null)
        .await
        .unwrap_err();
    match error {
        ActorError::Protocol(message) => assert!(message.contains("unknown task")),
        other => panic!("expected a protocol rejection, got {other:?}"),
    }

    // Same transport, same portal: still fully usable.
    let doubled: i64 = portal.run("double", 4i64).await?;
    assert_eq!(doubled, 8);

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}
