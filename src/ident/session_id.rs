use crate::ident::message_id::MessageId;
use crate::ident::parse::ParseIdError;
use crate::ident::peer_id::PeerId;
use std::fmt;
use std::str::FromStr;

/// Revision is a session's version number. Revision zero is the session as it
/// was created; each successful attribute update increments it by one.
pub type Revision = u32;

/// SessionId uniquely identifies a session within a network.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId {
    peer: PeerId,
    seq: u32,
}

impl SessionId {
    pub(crate) fn new(peer: PeerId, seq: u32) -> Self {
        SessionId { peer, seq }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Checks the peer components. Seq zero is allowed here: it is reserved
    /// for messages a peer sends on its own behalf rather than for a
    /// session; see `SessionId::seq` callers that forbid it explicitly.
    pub fn validate(&self) -> Result<(), ParseIdError> {
        if self.peer.validate().is_err() {
            return Err(ParseIdError::new("session ID", self.to_string()));
        }

        Ok(())
    }

    /// Returns a reference to this session at the given revision.
    pub fn at(self, rev: Revision) -> SessionRef {
        SessionRef { id: self, rev }
    }

    pub fn short_string(&self) -> String {
        format!("{}.{}", self.peer.short_string(), self.seq)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer, self.seq)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for SessionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseIdError::new("session ID", s);

        let (peer_str, seq_str) = s.rsplit_once('.').ok_or_else(malformed)?;

        let peer: PeerId = peer_str.parse().map_err(|_| malformed())?;
        let seq: u32 = seq_str.parse().map_err(|_| malformed())?;

        let id = SessionId { peer, seq };
        id.validate().map_err(|_| malformed())?;

        Ok(id)
    }
}

/// SessionRef refers to a session at a specific revision. It is the token
/// used for optimistic concurrency control: catalog mutations carry the ref
/// the mutator last observed, and fail if the session has moved on.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionRef {
    id: SessionId,
    rev: Revision,
}

impl SessionRef {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn rev(&self) -> Revision {
        self.rev
    }

    pub fn validate(&self) -> Result<(), ParseIdError> {
        self.id
            .validate()
            .map_err(|_| ParseIdError::new("session ref", self.to_string()))
    }

    /// Returns the ID of the seq'th message sent at this revision.
    pub fn message(self, seq: u32) -> MessageId {
        MessageId::new(self, seq)
    }

    pub fn short_string(&self) -> String {
        format!("{}@{}", self.id.short_string(), self.rev)
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.rev)
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for SessionRef {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseIdError::new("session ref", s);

        let (id_str, rev_str) = s.rsplit_once('@').ok_or_else(malformed)?;

        let id: SessionId = id_str.parse().map_err(|_| malformed())?;
        let rev: Revision = rev_str.parse().map_err(|_| malformed())?;

        Ok(SessionRef { id, rev })
    }
}
