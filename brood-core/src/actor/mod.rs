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

//! Actor identity, specs, handles, spawning, and the invocable task table.

pub use actor_id::ActorId;
pub use child::{bootstrap, child_main};
pub use handle::ActorHandle;
pub use spec::{ActorSpec, BootstrapDescriptor, BOOTSTRAP_ENV};
pub use tasks::{TaskContext, TaskFailure, TaskRegistry};

mod actor_id;
pub(crate) mod child;
mod handle;
mod spawn;
mod spec;
mod tasks;
