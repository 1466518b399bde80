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

//! What to launch, and what a launched child needs to know.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ActorId;
use crate::message::ActorError;

/// Environment variable carrying the bootstrap descriptor into a spawned
/// child process.
pub const BOOTSTRAP_ENV: &str = "BROOD_BOOTSTRAP";

/// Description of a child actor process to spawn.
///
/// Defaults launch the current executable again, which is the usual
/// arrangement: one binary that branches on
/// [`BootstrapDescriptor::from_env`] at startup.
#[derive(Debug, Clone)]
pub struct ActorSpec {
    pub(crate) name: String,
    pub(crate) program: Option<PathBuf>,
    pub(crate) args: Vec<String>,
    pub(crate) envs: Vec<(String, String)>,
    pub(crate) startup_timeout: Duration,
    pub(crate) shutdown_grace: Duration,
}

impl ActorSpec {
    /// Creates a spec with defaults: re-exec the current executable, a 10
    /// second startup window, and a 5 second shutdown grace period.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: None,
            args: Vec::new(),
            envs: Vec::new(),
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Launches `program` instead of the current executable.
    #[must_use]
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Appends a command-line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable in the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bounds how long the child gets to send its `spawn-ack`.
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Bounds how long graceful shutdown waits before escalating to a
    /// forced kill.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Everything a freshly launched actor process needs to join the tree:
/// its assigned identity, where to connect back to, who the tree root is,
/// and the root-scope deadline it inherits, if any.
///
/// Travels as JSON in the [`BOOTSTRAP_ENV`] environment variable. The
/// spawned process's sole startup obligation is to connect to
/// `parent_addr`, send `spawn-ack`, and serve — or exit nonzero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapDescriptor {
    /// Identity assigned to the new actor by its parent.
    pub actor: ActorId,
    /// The spawning actor.
    pub parent: ActorId,
    /// Where the parent accepts the connection back.
    pub parent_addr: SocketAddr,
    /// The root of the actor tree (holder of the interactive gate).
    pub root: ActorId,
    /// Where the root accepts connections.
    pub root_addr: SocketAddr,
    /// Remaining milliseconds of the inherited root-scope deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl BootstrapDescriptor {
    /// Serializes for the child's environment.
    pub fn to_env_value(&self) -> Result<String, ActorError> {
        serde_json::to_string(self)
            .map_err(|e| ActorError::Protocol(format!("unencodable bootstrap descriptor: {e}")))
    }

    /// Reads the descriptor out of this process's environment, if present.
    /// `Ok(None)` means this process was not launched as a brood child.
    pub fn from_env() -> Result<Option<Self>, ActorError> {
        match std::env::var(BOOTSTRAP_ENV) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ActorError::Protocol(format!("malformed bootstrap descriptor: {e}"))),
            Err(_) => Ok(None),
        }
    }

    /// True when this process was launched as a brood child.
    #[must_use]
    pub fn is_present() -> bool {
        std::env::var_os(BOOTSTRAP_ENV).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_json() {
        let desc = BootstrapDescriptor {
            actor: ActorId::new("child"),
            parent: ActorId::new("parent"),
            parent_addr: "127.0.0.1:4100".parse().unwrap(),
            root: ActorId::new("root"),
            root_addr: "127.0.0.1:4000".parse().unwrap(),
            deadline_ms: Some(1500),
        };
        let raw = desc.to_env_value().unwrap();
        let back: BootstrapDescriptor = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.actor, desc.actor);
        assert_eq!(back.parent_addr, desc.parent_addr);
        assert_eq!(back.deadline_ms, Some(1500));
    }

    #[test]
    fn spec_builder_accumulates() {
        let spec = ActorSpec::new("worker")
            .program("/usr/bin/true")
            .arg("--flag")
            .env("K", "V")
            .startup_timeout(Duration::from_secs(2));
        assert_eq!(spec.name, "worker");
        assert_eq!(spec.args, vec!["--flag".to_string()]);
        assert_eq!(spec.startup_timeout, Duration::from_secs(2));
    }
}
