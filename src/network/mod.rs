//! Network subsystem for the engine sockets

pub mod channel;

pub use channel::{Channel, ChannelStatus};
