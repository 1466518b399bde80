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

//! Wire envelopes and the outcome taxonomy.

pub use envelope::{Envelope, EnvelopeKind};
pub use error::{ActorError, CancelReason, RemoteError};

mod envelope;
mod error;

/// Error-kind string a callee puts on the wire when its context was
/// cancelled rather than failed.
pub(crate) const ERROR_KIND_CANCELLED: &str = "cancelled";

/// Error-kind string for invokes rejected before reaching a task (unknown
/// task name, undecodable arguments).
pub(crate) const ERROR_KIND_PROTOCOL: &str = "protocol";
