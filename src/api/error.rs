use crate::ident::{SessionId, SessionRef};
use crate::transport::TransportError;
use bytes::Bytes;

/// Error is the set of failures surfaced by the public API.
///
/// The first four variants are domain errors: they are part of the optimistic
/// concurrency contract and callers are expected to match on them. `Failure`
/// is an application-defined negative response, not a transport problem.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The session never existed on the queried peer, or has been destroyed.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// An optimistic update lost a race; the ref is no longer current.
    #[error("update of {0} is out of date")]
    StaleUpdate(SessionRef),

    /// Attributes were requested at a revision older than the freshest
    /// evidence already held.
    #[error("can not fetch attributes at {0}, one or more attributes have been updated since")]
    StaleFetch(SessionRef),

    /// The update would change a frozen attribute.
    #[error("can not update {0}, one or more attributes are frozen")]
    FrozenAttributes(SessionRef),

    /// A revision handle was requested for a revision the catalog has not
    /// reached yet.
    #[error("revision {0} is from the future")]
    FutureRevision(SessionRef),

    /// An application-signaled failure returned by a command handler.
    #[error("command failed: {failure_type}: {message}")]
    Failure {
        failure_type: String,
        message: String,
        payload: Bytes,
    },

    /// A server-side error; opaque to the calling application.
    #[error("command raised an error: {0}")]
    CommandError(String),

    #[error("{0}")]
    InvalidNamespace(String),

    /// A notification was addressed to a session ID that can not exist.
    #[error("session ID {0} is invalid")]
    InvalidTarget(SessionId),

    /// The call's deadline elapsed before a response arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The local peer stopped while the operation was in flight.
    #[error("peer has been stopped")]
    PeerStopped,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    pub(crate) fn failure(
        failure_type: impl Into<String>,
        message: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Error::Failure {
            failure_type: failure_type.into(),
            message: message.into(),
            payload,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true if the error is an application failure of the given type.
    pub fn is_failure_type(&self, t: &str) -> bool {
        matches!(self, Error::Failure { failure_type, .. } if failure_type == t)
    }
}
