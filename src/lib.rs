mod api;
mod attributes;
mod catalog;
mod command;
mod ident;
mod notify;
mod peer;
mod remotesession;
mod transport;

pub use api::default_logger;
pub use api::validate_namespace;
pub use api::Config;
pub use api::ConfigError;
pub use api::Context;
pub use api::Error;
pub use api::Options;
pub use attributes::freeze;
pub use attributes::set;
pub use attributes::Attr;
pub use attributes::AttrMeta;
pub use attributes::Constraint;
pub use attributes::NamespacedTable;
pub use attributes::Table;
pub use catalog::Catalog;
pub use catalog::SessionRevision;
pub use command::AsyncHandler;
pub use command::CommandHandler;
pub use command::Request;
pub use command::Responder;
pub use ident::MessageId;
pub use ident::ParseIdError;
pub use ident::PeerId;
pub use ident::Revision;
pub use ident::SessionId;
pub use ident::SessionRef;
pub use notify::Notification;
pub use notify::NotificationHandler;
pub use peer::try_start_peer;
pub use peer::Peer;
pub use peer::PeerConfig;
pub use peer::PeerStartError;
pub use peer::Session;
pub use transport::Consumer;
pub use transport::ConsumerTag;
pub use transport::Delivery;
pub use transport::Exchange;
pub use transport::MemoryBroker;
pub use transport::Message;
pub use transport::Outcome;
pub use transport::Queue;
pub use transport::Transport;
pub use transport::TransportError;

// The crate root holds no code: only `mod` and `pub use` statements, so the
// public surface is visible in one place and internal modules stay private.
