mod peer;
mod session;
pub(crate) mod shutdown;
mod wiring;

pub use peer::Peer;
pub use session::Session;
pub use wiring::try_start_peer;
pub use wiring::PeerConfig;
pub use wiring::PeerStartError;
