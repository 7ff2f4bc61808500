mod local;
mod registry;
mod revision;

pub use local::Catalog;
pub use registry::SessionRegistry;
pub use revision::ClosedRevision;
pub use revision::LocalRevision;
pub use revision::RevisionStore;
pub use revision::SessionRevision;
