use std::{io, time::Duration};

use thiserror::Error;

use crate::message::Version;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The two peers were built from different protocol revisions.
    #[error("upgrade qpbench on {side} from {older} to {newer}")]
    VersionMismatch {
        side: &'static str,
        older: Version,
        newer: Version,
    },

    #[error("{name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unknown test {0}")]
    UnknownTest(String),

    #[error("test selector {0} is out of range")]
    UnknownSelector(u16),

    #[error("{0} is not supported by this build")]
    Unsupported(String),

    #[error("failed to connect to {host}:{port} within {wait:?}: {source}")]
    ConnectTimeout {
        host: String,
        port: u16,
        wait: Duration,
        #[source]
        source: io::Error,
    },

    #[error("timed out while {what}")]
    Timeout { what: String },

    #[error("peer closed the connection while {what}")]
    PeerClosed { what: String },

    #[error("unexpected {what}: expected {expected:?}, got {got:?}")]
    Protocol {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// Text surfaced by a peer that hit a fatal error and notified us out of band.
    #[error("{peer}: {message}")]
    PeerFailed { peer: String, message: String },

    #[error("{op} failed: {status}")]
    Completion { op: &'static str, status: String },

    #[error("{0}")]
    Rdma(String),

    /// Invariant violations. Never expected in a correctly constructed build.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("{what}: {source}")]
    Os {
        what: &'static str,
        #[source]
        source: nix::Error,
    },
}

impl Error {
    pub fn io(what: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            what: what.into(),
            source,
        }
    }

    pub fn os(what: &'static str, source: nix::Error) -> Self {
        Error::Os { what, source }
    }

    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }

    /// Whether the peer already knows about this failure, in which case
    /// there is no point signalling it back.
    pub fn came_from_peer(&self) -> bool {
        matches!(self, Error::PeerFailed { .. } | Error::PeerClosed { .. })
    }
}
