//! The error taxonomy shared by every store, index and transport.
//!
//! Storage and ref errors travel unchanged from the backend to the caller.
//! Transport faults are wrapped into [`Error::Transport`] at the adapter
//! boundary so callers can tell a flaky network from a broken repository.

use std::fmt;
use std::time::Duration;

use crate::id::ObjectId;
use crate::object::ObjectKind;
use crate::remote::SessionState;

/// Alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required input was absent, e.g. no remote was configured.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("object {0} not found")]
    NotFound(ObjectId),

    #[error("ref {0} not found")]
    RefNotFound(String),

    #[error("invalid ref name {0:?}")]
    InvalidRefName(String),

    /// The ref moved between the caller's read and its update.
    /// Retriable: re-read and try again.
    #[error("ref {name} changed concurrently (expected {}, found {})", display_opt(.expected), display_opt(.actual))]
    CompareAndSwapFailed {
        name: String,
        expected: Option<ObjectId>,
        actual: Option<ObjectId>,
    },

    #[error("cannot {operation} while session is {state}")]
    IllegalState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("transport error on remote {remote}: {source}")]
    Transport {
        remote: String,
        #[source]
        source: TransportError,
    },

    #[error("update of {name} rejected: {reason}")]
    Rejected { name: String, reason: RejectReason },

    /// A derived cache disagrees with the authoritative object store.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// Stored bytes no longer hash to the id they are filed under.
    #[error("object {0} is corrupt")]
    Corrupt(ObjectId),

    #[error("malformed object: {0}")]
    Malformed(String),

    #[error("object {id} is a {found}, expected a {expected}")]
    UnexpectedKind {
        id: ObjectId,
        expected: ObjectKind,
        found: ObjectKind,
    },

    #[error("{backend} backend failed: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn backend<E>(backend: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Backend {
            backend,
            source: Box::new(source),
        }
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::CompareAndSwapFailed { .. } | Error::Transport { .. }
        )
    }

    /// Wraps anything that is not already a transport error as a transport
    /// fault on `remote`.
    pub(crate) fn into_transport(self, remote: &str) -> Self {
        match self {
            Error::Io(e) => Error::Transport {
                remote: remote.to_owned(),
                source: TransportError::Fault(Box::new(e)),
            },
            Error::Backend { source, .. } => Error::Transport {
                remote: remote.to_owned(),
                source: TransportError::Fault(source),
            },
            other => other,
        }
    }
}

fn display_opt(id: &Option<ObjectId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "nothing".to_owned(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("unsupported url {0:?}")]
    UnsupportedUrl(String),
    #[error(transparent)]
    Fault(Box<dyn std::error::Error + Send + Sync>),
}

/// Why the remote refused a single ref update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The new value does not descend from the current one.
    NonFastForward,
    /// The remote ref no longer holds the value the pusher expected.
    Stale { current: Option<ObjectId> },
    /// Refused by remote policy.
    Policy(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NonFastForward => write!(f, "non-fast-forward"),
            RejectReason::Stale { current } => {
                write!(f, "stale expectation, remote has {}", display_opt(current))
            }
            RejectReason::Policy(reason) => write!(f, "{reason}"),
        }
    }
}
