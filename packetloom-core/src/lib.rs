//! packetloom-core: a reliable, message-oriented transport multiplexed
//! over a single authenticated UDP socket.
//!
//! Three layers, leaves first: [`codec`] and [`frame`] describe the wire
//! format, [`packet`] is the outer per-datagram envelope, [`session`] is
//! the per-remote-endpoint context (key schedule, sequence counter, stream
//! registry), [`stream`] is the reliable chunked-transfer state machine,
//! and [`mux`] owns the socket and ties the other layers together.
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod mux;
pub mod packet;
pub mod session;
pub mod stream;

pub use config::Config;
pub use error::{Error, Result};
pub use mux::Mux;
pub use session::Session;
pub use stream::Stream;
