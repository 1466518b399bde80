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

use crate::setup::{initialize_tracing, worker_tasks};

mod setup;

/// Scenario: stream integers 1..=1000 through a window of 10. Every value
/// arrives in order, and the producer's suspension count is observably
/// positive — it waited on the window instead of buffering unboundedly.
#[tokio::test]
async fn window_backpressure_suspends_the_producer() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    let portal = worker.portal(&nursery.scope());

    let mut stream = portal.open_stream::<u64, u64>("count_to", 1000u64, 10).await?;
    let mut received = Vec::with_capacity(1000);
    while let Some(value) = stream.recv().await? {
        received.push(value);
    }
    assert_eq!(received, (1..=1000).collect::<Vec<u64>>());

    // `count_to` returns its own backpressure-wait count.
    let producer_waits: u64 = stream.finish().await?;
    assert!(
        producer_waits > 0,
        "producer never suspended on the window"
    );

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}

/// A consumer that stops pulling suspends the producer rather than letting
/// it run ahead; pulls resume exactly where the stream left off.
#[tokio::test]
async fn zero_pull_consumer_suspends_the_producer() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    let portal = worker.portal(&nursery.scope());

    let mut stream = portal.open_stream::<u64, u64>("count_to", 100u64, 4).await?;

    // Pull nothing; the producer exhausts its window and parks.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut received = Vec::new();
    while let Some(value) = stream.recv().await? {
        received.push(value);
    }
    assert_eq!(received, (1..=100).collect::<Vec<u64>>());

    let producer_waits: u64 = stream.finish().await?;
    assert!(producer_waits > 0, "stalled consumer never suspended the producer");

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}

/// Values flow both ways over one context, each direction flow-controlled.
#[tokio::test]
async fn streams_carry_values_in_both_directions() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    let portal = worker.portal(&nursery.scope());

    let mut stream = portal
        .open_stream::<Value, i64>("echo_stream", Value::Null, 4)
        .await?;
    for i in 1..=20i64 {
        stream.send(i).await?;
        assert_eq!(stream.recv().await?, Some(i * 10));
    }
    stream.close().await;
    assert_eq!(stream.recv().await?, None);
    let _: Value = stream.finish().await?;

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}

/// A closed stream yields no further values and rejects further sends.
#[tokio::test]
async fn closed_streams_reject_further_sends() -> anyhow::Result<()> {
    initialize_tracing();
    let runtime = BroodApp::launch("root", TaskRegistry::new()).await?;
    let nursery = runtime.root_nursery();
    let worker = nursery.spawn_hosted("worker", worker_tasks()).await?;
    let portal = worker.portal(&nursery.scope());

    let stream = portal
        .open_stream::<Value, i64>("echo_stream", Value::Null, 4)
        .await?;
    stream.send(7i64).await?;
    stream.close().await;

    match stream.send(8i64).await {
        Err(ActorError::StreamClosed) => {}
        other => panic!("expected StreamClosed, got {other:?}"),
    }

    worker.shutdown().await?;
    nursery.close().await?;
    runtime.shutdown().await;
    Ok(())
}
