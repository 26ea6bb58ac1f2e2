//! Error types for meshcast.

use std::io;
use thiserror::Error;

/// Result type for meshcast operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for group formation and collective operations.
///
/// A collective operation is only correct when every member succeeds, so no
/// variant is retried or recovered locally. [`Error::Transport`],
/// [`Error::ProtocolMismatch`] and an in-operation [`Error::Timeout`] leave
/// the communicator broken: every later call fails with [`Error::Lifecycle`].
#[derive(Error, Debug)]
pub enum Error {
    /// The process group could not be formed (rendezvous protocol or
    /// consistency violation).
    #[error("registration failed: {0}")]
    Registration(String),

    /// A peer became unreachable or disconnected mid-operation.
    #[error("transport failure on link to rank {peer}: {source}")]
    Transport {
        /// Rank of the peer the failing link belongs to.
        peer: i32,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Members disagree on what the current collective looks like
    /// (sequence number, operation kind, root, datatype or element count).
    #[error("collective mismatch between members: expected {expected}, peer sent {got}")]
    ProtocolMismatch {
        /// Header this member derived from its own call.
        expected: String,
        /// Header actually received from the partner.
        got: String,
    },

    /// A bounded wait was exceeded.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Operation on a communicator that is no longer usable.
    #[error("communicator is not active: {0}")]
    Lifecycle(&'static str),

    /// A rank argument was outside `0..size`.
    #[error("invalid rank: {0}")]
    InvalidRank(i32),

    /// A buffer was too large for a single wire frame.
    #[error("element count too large for one frame: {0}")]
    InvalidCount(u64),

    /// Invalid configuration value (environment variable or field).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Map a socket error observed on the link to `peer` during a collective.
    ///
    /// Read/write deadline expiry surfaces as [`Error::Timeout`]; everything
    /// else is a [`Error::Transport`] failure. Both kinds break the
    /// communicator.
    pub(crate) fn from_io(peer: i32, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout("collective"),
            _ => Error::Transport { peer, source: err },
        }
    }

    /// Whether this error leaves the communicator unusable.
    ///
    /// Fatal errors break the whole group: the communicator that observed
    /// one refuses every later collective with [`Error::Lifecycle`], and
    /// its peers fail in turn when they next touch the torn-down links.
    /// Non-fatal errors ([`Error::InvalidRank`] and friends) reject the
    /// offending call before anything goes on the wire, so the group stays
    /// usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::ProtocolMismatch { .. } | Error::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeout_maps_to_timeout() {
        let err = Error::from_io(2, io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(matches!(err, Error::Timeout("collective")));
        let err = Error::from_io(2, io::Error::new(io::ErrorKind::WouldBlock, "would block"));
        assert!(matches!(err, Error::Timeout("collective")));
    }

    #[test]
    fn io_disconnect_maps_to_transport() {
        let err = Error::from_io(
            1,
            io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"),
        );
        match err {
            Error::Transport { peer, .. } => assert_eq!(peer, 1),
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[test]
    fn fatal_kinds_break_the_communicator() {
        assert!(Error::Timeout("collective").is_fatal());
        assert!(
            Error::ProtocolMismatch {
                expected: "a".into(),
                got: "b".into(),
            }
            .is_fatal()
        );
        assert!(!Error::InvalidRank(9).is_fatal());
        assert!(!Error::Lifecycle("communicator is finalized").is_fatal());
    }
}
