use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

/// Constraint restricts the set of sessions a multicast notification is
/// delivered to.
///
/// A session matches when, for every constrained key, its attribute value in
/// the notification's namespace equals the constrained value. An empty
/// constrained value matches sessions where the attribute is absent or unset.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Constraint(BTreeMap<String, String>);

impl Constraint {
    pub fn new() -> Self {
        Constraint(BTreeMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;

        for (index, (key, value)) in self.0.iter().enumerate() {
            if index != 0 {
                write!(f, ", ")?;
            }

            if value.is_empty() {
                write!(f, "-{}", key)?;
            } else {
                write!(f, "{}={}", key, value)?;
            }
        }

        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_entries_in_key_order() {
        let c = Constraint::new().with("b", "2").with("a", "1");
        assert_eq!(c.to_string(), "{a=1, b=2}");
    }

    #[test]
    fn display_uses_dash_syntax_for_empty_values() {
        let c = Constraint::new().with("gone", "");
        assert_eq!(c.to_string(), "{-gone}");
    }
}
