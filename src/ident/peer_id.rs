use crate::ident::parse::ParseIdError;
use crate::ident::session_id::SessionId;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// PeerId uniquely identifies a peer within a network.
///
/// Every ID generated by a peer (session IDs, message IDs) embeds the peer ID
/// so it can be traced back to its origin.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeerId {
    /// A seed chosen when the peer starts. Two peers started at different
    /// times are guaranteed distinct clock components.
    clock: u64,
    /// A random component to distinguish peers started within the same
    /// clock tick.
    rand: u16,
}

impl PeerId {
    pub(crate) fn new(clock: u64, rand: u16) -> Self {
        PeerId { clock, rand }
    }

    /// Generates a peer ID for a newly started peer. Both components are
    /// guaranteed non-zero.
    pub fn random() -> Self {
        let clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .max(1);

        let mut rng = rand::thread_rng();
        let rand = loop {
            let r: u16 = rng.gen();
            if r != 0 {
                break r;
            }
        };

        PeerId { clock, rand }
    }

    pub fn validate(&self) -> Result<(), ParseIdError> {
        if self.clock == 0 || self.rand == 0 {
            return Err(ParseIdError::new("peer ID", self.to_string()));
        }

        Ok(())
    }

    /// Returns the session ID with the given sequence number, owned by this
    /// peer.
    pub fn session(self, seq: u32) -> SessionId {
        SessionId::new(self, seq)
    }

    /// ShortString omits the clock component, which is rarely useful when
    /// eyeballing logs from a single run.
    pub fn short_string(&self) -> String {
        format!("{:04X}", self.rand)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}-{:04X}", self.clock, self.rand)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for PeerId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseIdError::new("peer ID", s);

        let (clock_str, rand_str) = s.split_once('-').ok_or_else(malformed)?;

        let clock = u64::from_str_radix(clock_str, 16).map_err(|_| malformed())?;
        let rand = u16::from_str_radix(rand_str, 16).map_err(|_| malformed())?;

        let id = PeerId { clock, rand };
        id.validate().map_err(|_| malformed())?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_pads_rand_component_to_four_digits() {
        let id = PeerId::new(0x0123456789abcdef, 0x0bad);
        assert_eq!(id.to_string(), "123456789ABCDEF-0BAD");
    }

    #[test]
    fn short_string_omits_clock_component() {
        let id = PeerId::new(0x0123456789abcdef, 0x0bad);
        assert_eq!(id.short_string(), "0BAD");
    }

    #[test]
    fn parse_round_trips() {
        let id: PeerId = "123456789ABCDEF-0BAD".parse().unwrap();
        assert_eq!(id, PeerId::new(0x0123456789abcdef, 0x0bad));
        assert_eq!(id.to_string(), "123456789ABCDEF-0BAD");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for input in ["<malformed>", "0-1", "1-0", "x-1", "1-x", "1", "1-1-1", "1-10000"] {
            assert!(input.parse::<PeerId>().is_err(), "expected '{}' to be rejected", input);
        }
    }

    #[test]
    fn random_components_are_non_zero() {
        for _ in 0..100 {
            let id = PeerId::random();
            assert!(id.validate().is_ok());
        }
    }
}
