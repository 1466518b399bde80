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

//! Terminal outcomes of tasks, contexts, and scopes.
//!
//! Cooperative cancellation is deliberately its own variant rather than an
//! error kind: nursery aggregation must be able to exclude cancelled
//! branches, and callers must be able to tell a cancelled context apart from
//! a failed one.

use std::fmt;

use crate::actor::ActorId;
use crate::ipc::IpcError;

/// Why a scope was cancelled.
///
/// Recorded by the first effective `cancel()` on a scope; later requests are
/// no-ops and do not overwrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Somebody called `cancel()` on the scope (locally or via a `cancel`
    /// envelope from the peer).
    Explicit,
    /// The scope's deadline expired.
    Deadline,
    /// A sibling under the same nursery failed first.
    SiblingFailure,
    /// The transport carrying this context went away.
    TransportLost,
    /// The parent actor went away or requested shutdown of the whole actor.
    ParentShutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "cancel requested"),
            Self::Deadline => write!(f, "deadline expired"),
            Self::SiblingFailure => write!(f, "sibling failure"),
            Self::TransportLost => write!(f, "transport lost"),
            Self::ParentShutdown => write!(f, "parent shutdown"),
        }
    }
}

/// An application error surfaced from a remote task.
///
/// Carries enough of the remote failure to be actionable locally while
/// staying distinguishable from a local error of the same kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Error class name as reported by the remote side.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Actor the error originated in.
    pub origin: ActorId,
    /// Remote failure-chain summary, when one exists.
    pub remote_trace: Option<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote {} from {}: {}",
            self.kind,
            self.origin.short(),
            self.message
        )
    }
}

impl std::error::Error for RemoteError {}

/// Terminal outcome of a task, context, stream, or child actor, as seen by
/// the scope that owns it.
#[derive(Debug, Clone)]
pub enum ActorError {
    /// A spawned child never sent its `spawn-ack` within the startup window.
    SpawnTimeout {
        /// Name the child was being spawned under.
        actor: String,
    },
    /// The child process could not be launched, or exited before
    /// acknowledging startup.
    SpawnFailed {
        /// Name the child was being spawned under.
        actor: String,
        /// What went wrong.
        reason: String,
    },
    /// A running child actor's process exited with a failure status.
    ChildExit {
        /// The child that exited.
        actor: ActorId,
        /// Exit status code, if the platform reported one.
        status: Option<i32>,
    },
    /// The connection to a peer dropped while it was still registered.
    TransportLost {
        /// The unreachable peer.
        peer: ActorId,
    },
    /// Malformed or unexpected protocol traffic.
    Protocol(String),
    /// An application error surfaced from a remote task.
    Remote(RemoteError),
    /// Two or more concurrent failures under one scope.
    Aggregate(Vec<ActorError>),
    /// A send or receive on a stream that has already closed.
    StreamClosed,
    /// The scope (or context) was cooperatively cancelled.
    Cancelled {
        /// Why the cancellation happened.
        reason: CancelReason,
    },
    /// The nursery is no longer accepting children.
    NurseryClosed,
}

impl ActorError {
    /// True for outcomes that represent cooperative cancellation rather
    /// than failure. Aggregation excludes these.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Folds a list of recorded failures plus the owning scope's
    /// cancellation state into the scope's single outcome.
    ///
    /// One failure propagates as itself; several become an aggregate; a
    /// cancelled scope with no distinct failure reports `Cancelled`.
    pub(crate) fn aggregate(
        mut failures: Vec<ActorError>,
        cancelled: Option<CancelReason>,
    ) -> Result<(), ActorError> {
        match failures.len() {
            0 => match cancelled {
                Some(reason) => Err(ActorError::Cancelled { reason }),
                None => Ok(()),
            },
            1 => Err(failures.remove(0)),
            _ => Err(ActorError::Aggregate(failures)),
        }
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnTimeout { actor } => {
                write!(f, "actor '{actor}' did not acknowledge startup in time")
            }
            Self::SpawnFailed { actor, reason } => {
                write!(f, "failed to spawn actor '{actor}': {reason}")
            }
            Self::ChildExit { actor, status } => match status {
                Some(code) => write!(f, "child actor {} exited with status {code}", actor.short()),
                None => write!(f, "child actor {} was killed by a signal", actor.short()),
            },
            Self::TransportLost { peer } => {
                write!(f, "lost transport to {}", peer.short())
            }
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Remote(err) => write!(f, "{err}"),
            Self::Aggregate(errors) => {
                write!(f, "{} concurrent failures: [", errors.len())?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                write!(f, "]")
            }
            Self::StreamClosed => write!(f, "stream closed"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            Self::NurseryClosed => write!(f, "nursery is closed to new children"),
        }
    }
}

impl std::error::Error for ActorError {}

impl From<RemoteError> for ActorError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

impl From<IpcError> for ActorError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::ConnectionClosed => Self::Protocol("connection closed".into()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(kind: &str, message: &str) -> ActorError {
        ActorError::Remote(RemoteError {
            kind: kind.into(),
            message: message.into(),
            origin: ActorId::new("worker"),
            remote_trace: None,
        })
    }

    #[test]
    fn no_failures_and_no_cancel_is_ok() {
        assert!(ActorError::aggregate(vec![], None).is_ok());
    }

    #[test]
    fn single_failure_propagates_unwrapped() {
        let out = ActorError::aggregate(vec![remote("ValueError", "x")], None);
        match out {
            Err(ActorError::Remote(e)) => {
                assert_eq!(e.kind, "ValueError");
                assert_eq!(e.message, "x");
            }
            other => panic!("expected the single error itself, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_failures_become_an_aggregate() {
        let out = ActorError::aggregate(
            vec![remote("ValueError", "x"), remote("KeyError", "y")],
            Some(CancelReason::SiblingFailure),
        );
        match out {
            Err(ActorError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn external_cancel_alone_reports_cancelled() {
        let out = ActorError::aggregate(vec![], Some(CancelReason::Deadline));
        match out {
            Err(ActorError::Cancelled { reason }) => assert_eq!(reason, CancelReason::Deadline),
            other => panic!("expected cancelled outcome, got {other:?}"),
        }
    }

    #[test]
    fn failure_beats_cancellation_in_the_outcome() {
        let out = ActorError::aggregate(vec![remote("ValueError", "x")], Some(CancelReason::Explicit));
        assert!(matches!(out, Err(ActorError::Remote(_))));
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        assert!(ActorError::Cancelled {
            reason: CancelReason::Explicit
        }
        .is_cancellation());
        assert!(!remote("ValueError", "x").is_cancellation());
    }
}
