use crate::attributes::attr::Attr;
use crate::attributes::constraint::Constraint;
use crate::ident::Revision;
use serde::{Deserialize, Serialize};
use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;
use std::sync::Arc;

/// AttrMeta is an attribute together with the revisions at which it was
/// first created and last updated.
///
/// Invariant: `created_at <= updated_at <= catalog rev`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AttrMeta {
    pub attr: Attr,
    pub created_at: Revision,
    pub updated_at: Revision,
}

/// Writes a "diff" representation of meta to buf. Attributes written for the
/// first time are prefixed with '+'.
pub fn write_diff(buf: &mut String, meta: &AttrMeta) {
    if !meta.attr.value.is_empty() && meta.created_at == meta.updated_at {
        buf.push('+');
    }

    let _ = write!(buf, "{}", meta.attr);
}

/// Table maps attribute keys to attributes with meta data. It holds the
/// attributes of one namespace.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Table(HashMap<String, AttrMeta>);

impl Table {
    pub fn new() -> Self {
        Table(HashMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&AttrMeta> {
        self.0.get(key)
    }

    pub fn insert(&mut self, meta: AttrMeta) {
        self.0.insert(meta.attr.key.clone(), meta);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Values<'_, String, AttrMeta> {
        self.0.values()
    }

    /// Returns true if this table satisfies the constraint. A constrained
    /// key with an empty value matches an absent attribute.
    pub fn matches(&self, constraint: &Constraint) -> bool {
        constraint.iter().all(|(key, value)| {
            let current = self.0.get(key).map(|m| m.attr.value.as_str()).unwrap_or("");
            current == value
        })
    }
}

impl fmt::Display for Table {
    /// Non-frozen attributes with empty values are omitted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<&AttrMeta> = self
            .0
            .values()
            .filter(|m| m.attr.is_frozen || !m.attr.value.is_empty())
            .collect();
        entries.sort_by(|a, b| a.attr.key.cmp(&b.attr.key));

        for (index, meta) in entries.iter().enumerate() {
            if index != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", meta.attr)?;
        }

        Ok(())
    }
}

/// NamespacedTable maps namespaces to attribute tables.
///
/// Namespace sub-tables are individually reference counted so that an update
/// to one namespace produces a new sub-table without copying any other. A
/// snapshot of the whole structure is an `Arc<NamespacedTable>`; readers
/// holding a snapshot are unaffected by later mutations.
#[derive(Clone, Debug, Default)]
pub struct NamespacedTable(HashMap<String, Arc<Table>>);

impl NamespacedTable {
    pub fn new() -> Self {
        NamespacedTable(HashMap::new())
    }

    pub fn namespace(&self, ns: &str) -> Option<&Arc<Table>> {
        self.0.get(ns)
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, Arc<Table>> {
        self.0.iter()
    }

    /// Returns a copy of this table with the ns sub-table replaced. Other
    /// namespaces share their sub-tables with the original.
    pub fn with_namespace(&self, ns: &str, table: Table) -> NamespacedTable {
        let mut next = self.0.clone();
        next.insert(ns.to_string(), Arc::new(table));
        NamespacedTable(next)
    }
}

impl fmt::Display for NamespacedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut namespaces: Vec<(&String, &Arc<Table>)> = self.0.iter().collect();
        namespaces.sort_by(|a, b| a.0.cmp(b.0));

        let mut first = true;
        for (ns, table) in namespaces {
            let rendered = table.to_string();
            if rendered.is_empty() {
                continue;
            }

            if !first {
                write!(f, " | ")?;
            }
            first = false;

            write!(f, "{}::{}", ns, rendered)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::attr;

    fn meta(a: Attr, created_at: Revision, updated_at: Revision) -> AttrMeta {
        AttrMeta {
            attr: a,
            created_at,
            updated_at,
        }
    }

    #[test]
    fn write_diff_prefixes_new_attributes() {
        let mut buf = String::new();
        write_diff(&mut buf, &meta(attr::set("foo", "bar"), 3, 3));
        assert_eq!(buf, "+foo=bar");
    }

    #[test]
    fn write_diff_does_not_prefix_updated_attributes() {
        let mut buf = String::new();
        write_diff(&mut buf, &meta(attr::freeze("foo", "bar"), 1, 3));
        assert_eq!(buf, "foo@bar");
    }

    #[test]
    fn write_diff_uses_plain_form_for_empty_values() {
        let mut buf = String::new();
        write_diff(&mut buf, &meta(attr::set("foo", ""), 3, 3));
        assert_eq!(buf, "-foo");
    }

    #[test]
    fn display_omits_unset_attributes() {
        let mut table = Table::new();
        table.insert(meta(attr::set("a", "1"), 1, 1));
        table.insert(meta(attr::set("gone", ""), 1, 2));
        table.insert(meta(attr::freeze("locked", ""), 1, 1));
        assert_eq!(table.to_string(), "!locked, a=1");
    }

    #[test]
    fn matches_requires_every_constrained_key() {
        let mut table = Table::new();
        table.insert(meta(attr::set("a", "1"), 1, 1));
        table.insert(meta(attr::set("b", "2"), 1, 1));

        assert!(table.matches(&Constraint::new().with("a", "1")));
        assert!(!table.matches(&Constraint::new().with("a", "1").with("b", "3")));
    }

    #[test]
    fn matches_treats_absent_keys_as_empty() {
        let table = Table::new();
        assert!(table.matches(&Constraint::new().with("missing", "")));
        assert!(!table.matches(&Constraint::new().with("missing", "x")));
    }

    #[test]
    fn with_namespace_shares_untouched_sub_tables() {
        let mut a = Table::new();
        a.insert(meta(attr::set("x", "1"), 1, 1));

        let original = NamespacedTable::new().with_namespace("a", a);
        let before = Arc::clone(original.namespace("a").unwrap());

        let mut b = Table::new();
        b.insert(meta(attr::set("y", "2"), 2, 2));
        let next = original.with_namespace("b", b);

        assert!(Arc::ptr_eq(&before, next.namespace("a").unwrap()));
        assert!(original.namespace("b").is_none());
    }
}
