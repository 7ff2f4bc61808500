use crate::ident::parse::ParseIdError;
use crate::ident::session_id::SessionRef;
use std::fmt;
use std::str::FromStr;

/// MessageId uniquely identifies a message sent by a session.
///
/// The embedded ref is the session as the sender observed it when the message
/// was composed; the per-revision sequence resets every time the session's
/// attribute table is updated.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId {
    session: SessionRef,
    seq: u32,
}

impl MessageId {
    pub(crate) fn new(session: SessionRef, seq: u32) -> Self {
        MessageId { session, seq }
    }

    pub fn session(&self) -> SessionRef {
        self.session
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn validate(&self) -> Result<(), ParseIdError> {
        if self.seq == 0 || self.session.validate().is_err() {
            return Err(ParseIdError::new("message ID", self.to_string()));
        }

        Ok(())
    }

    pub fn short_string(&self) -> String {
        format!("{}#{}", self.session.short_string(), self.seq)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.seq)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for MessageId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseIdError::new("message ID", s);

        let (session_str, seq_str) = s.rsplit_once('#').ok_or_else(malformed)?;

        let session: SessionRef = session_str.parse().map_err(|_| malformed())?;
        let seq: u32 = seq_str.parse().map_err(|_| malformed())?;

        let id = MessageId { session, seq };
        id.validate().map_err(|_| malformed())?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::peer_id::PeerId;

    fn session_ref() -> SessionRef {
        PeerId::new(0x0123456789abcdef, 0x0bad).session(123).at(456)
    }

    #[test]
    fn parse_round_trips() {
        let id: MessageId = "123456789ABCDEF-0BAD.123@456#789".parse().unwrap();
        assert_eq!(id, session_ref().message(789));
        assert_eq!(id.to_string(), "123456789ABCDEF-0BAD.123@456#789");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        let cases = [
            ("malformed", "<malformed>"),
            ("zero peer clock component", "0-1.1@0#1"),
            ("zero peer random component", "1-0.1@0#1"),
            ("zero message seq", "1-1.1@0#0"),
            ("invalid peer clock component", "x-1.1@0#1"),
            ("invalid peer random component", "1-x.1@0#1"),
            ("invalid session sequence", "1-1.x@0#1"),
            ("invalid session revision", "1-1.1@x#1"),
            ("invalid message sequence", "1-1.1@0#x"),
        ];

        for (label, input) in cases {
            assert!(input.parse::<MessageId>().is_err(), "case '{}' should be rejected", label);
        }
    }

    #[test]
    fn short_string_omits_clock_component() {
        let id = session_ref().message(789);
        assert_eq!(id.short_string(), "0BAD.123@456#789");
    }
}
