mod broker;
mod memory;

pub use broker::Consumer;
pub use broker::ConsumerTag;
pub use broker::Delivery;
pub use broker::Exchange;
pub use broker::Message;
pub use broker::Outcome;
pub use broker::Queue;
pub use broker::Transport;
pub use broker::TransportError;
pub use memory::MemoryBroker;
