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
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identity of one actor process.
///
/// An `ActorId` pairs a human-chosen name with an instance id assigned at
/// spawn time. The name is for operators and logs; the instance id is what
/// the registry and every envelope route on, so two actors spawned under the
/// same name never collide.
///
/// The id is immutable for the actor's whole life and appears as the
/// `from`/`to` field of every envelope it sends or receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorId {
    /// Operator-facing name, chosen by whoever spawned the actor.
    pub name: String,
    /// Instance id, unique per spawn.
    pub uid: Uuid,
}

impl ActorId {
    /// Mints a fresh id for a new actor instance.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: Uuid::new_v4(),
        }
    }

    /// Short display form used in log fields.
    #[must_use]
    pub fn short(&self) -> String {
        let uid = self.uid.simple().to_string();
        format!("{}:{}", self.name, &uid[..8])
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.uid)
    }
}

impl PartialEq for ActorId {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for ActorId {}

impl Hash for ActorId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}
