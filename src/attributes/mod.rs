pub(crate) mod attr;
mod constraint;
mod table;

pub use attr::freeze;
pub use attr::set;
pub use attr::Attr;
pub use constraint::Constraint;
pub use table::write_diff;
pub use table::AttrMeta;
pub use table::NamespacedTable;
pub use table::Table;
