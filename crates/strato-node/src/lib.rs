// strato-node: the node-bus session. Verbs become frames on a bounded
// FIFO send queue; inbound frames are forwarded to the event handler.

pub mod client;
pub mod transport;

pub use client::{NodeClient, build_start_payload};
pub use transport::{ChannelTransport, NodeTransport, PeerHandle, TcpTransport};
