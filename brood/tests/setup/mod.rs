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

//! Shared fixtures: the worker task table the test actors expose.

use brood::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn initialize_tracing() {
    brood::init_tracing();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailArgs {
    pub kind: String,
    pub message: String,
}

/// The task table every test worker serves.
pub fn worker_tasks() -> TaskRegistry {
    let mut tasks = TaskRegistry::new();
    tasks.register("double", |n: i64, _ctx: TaskContext| async move { Ok(n * 2) });
    tasks.register("fail", |args: FailArgs, _ctx: TaskContext| async move {
        Err::<Value, anyhow::Error>(TaskFailure::new(args.kind, args.message).into())
    });
    // Parks until cancelled; used to exercise remote cancellation.
    tasks.register("block_forever", |_: Value, _ctx: TaskContext| async move {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    });
    // Streams 1..=n to the caller, then returns how often it suspended on
    // a full window.
    tasks.register("count_to", |n: u64, ctx: TaskContext| async move {
        for i in 1..=n {
            ctx.yield_value(i).await?;
        }
        Ok(serde_json::json!(ctx.backpressure_waits()))
    });
    // Echoes each received value times ten until the caller closes.
    tasks.register("echo_stream", |_: Value, mut ctx: TaskContext| async move {
        while let Some(v) = ctx.recv::<i64>().await? {
            if ctx.yield_value(v * 10).await.is_err() {
                break;
            }
        }
        Ok(Value::Null)
    });
    // Takes the tree-wide interactive gate, then immediately releases it.
    tasks.register("grab_gate", |_: Value, ctx: TaskContext| async move {
        let guard = ctx.runtime().interactive(&ctx.scope()).await?;
        guard.release();
        Ok(true)
    });
    // Takes the gate and holds it until this actor dies.
    tasks.register("acquire_and_hold", |_: Value, ctx: TaskContext| async move {
        let guard = ctx.runtime().interactive(&ctx.scope()).await?;
        ctx.yield_value(true).await?;
        std::future::pending::<()>().await;
        drop(guard);
        Ok(Value::Null)
    });
    tasks
}
