use serde::{Deserialize, Serialize};
use std::fmt;

/// Attr is a single key/value pair in a session's attribute table.
///
/// A frozen attribute can never be changed again for the lifetime of the
/// session.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Attr {
    pub key: String,
    pub value: String,
    pub is_frozen: bool,
}

/// Returns an attribute with the given key and value.
pub fn set(key: impl Into<String>, value: impl Into<String>) -> Attr {
    Attr {
        key: key.into(),
        value: value.into(),
        is_frozen: false,
    }
}

/// Returns a frozen attribute with the given key and value.
pub fn freeze(key: impl Into<String>, value: impl Into<String>) -> Attr {
    Attr {
        key: key.into(),
        value: value.into(),
        is_frozen: true,
    }
}

impl Attr {
    /// Shorthand for [`set`].
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Attr {
        set(key, value)
    }

    /// Shorthand for [`freeze`].
    pub fn freeze(key: impl Into<String>, value: impl Into<String>) -> Attr {
        freeze(key, value)
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            if self.is_frozen {
                write!(f, "!{}", self.key)
            } else {
                write!(f, "-{}", self.key)
            }
        } else if self.is_frozen {
            write!(f, "{}@{}", self.key, self.value)
        } else {
            write!(f, "{}={}", self.key, self.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_returns_a_non_frozen_attribute() {
        let attr = set("foo", "bar");
        assert_eq!(
            attr,
            Attr {
                key: "foo".to_string(),
                value: "bar".to_string(),
                is_frozen: false,
            }
        );
    }

    #[test]
    fn freeze_returns_a_frozen_attribute() {
        let attr = freeze("foo", "bar");
        assert!(attr.is_frozen);
    }

    #[test]
    fn display_uses_equals_syntax() {
        assert_eq!(set("foo", "bar").to_string(), "foo=bar");
    }

    #[test]
    fn display_uses_at_syntax_for_frozen_attributes() {
        assert_eq!(freeze("foo", "bar").to_string(), "foo@bar");
    }

    #[test]
    fn display_uses_bang_syntax_for_empty_frozen_attributes() {
        assert_eq!(freeze("foo", "").to_string(), "!foo");
    }

    #[test]
    fn display_uses_dash_syntax_for_unset_attributes() {
        assert_eq!(set("foo", "").to_string(), "-foo");
    }
}
