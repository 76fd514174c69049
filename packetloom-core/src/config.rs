//! Programmatic configuration for a [`Mux`](crate::mux::Mux).
use std::net::SocketAddr;
use std::time::Duration;

use crate::crypto::KEY_LEN;
use crate::packet::MAX_PACKET_SIZE;

/// Configuration consumed directly by [`Mux::bind`](crate::mux::Mux::bind).
///
/// `packetloom-proxy` layers `serde`+`toml` file loading on top of this via
/// its own `ConfigFile`, mirroring the teacher's `Config`/`Srt` split.
#[derive(Clone, Debug)]
pub struct Config {
    /// Local address to bind the UDP socket to.
    pub bind: SocketAddr,
    /// Pre-shared symmetric key. Reinterpreted as an X25519 scalar to
    /// derive the public key advertised in the Handshake frame.
    pub key: [u8; KEY_LEN],
    /// Per-stream message assembly capacity, in bytes. Advertised to peers
    /// as `Handshake::buffer_size`.
    pub buffer_size: u64,
    /// Maximum on-wire packet size this host will ever emit or accept.
    /// Defaults to `MAX_PACKET_SIZE`; kept configurable only for tests that
    /// want to exercise smaller chunking without a loopback MTU.
    pub max_packet_size: usize,
    /// How long a stream write waits for a chunk's ack before resending
    /// every still-unacknowledged chunk.
    pub stream_retransmit_timeout: Duration,
    /// `SO_RCVBUF` size hint passed to the socket, see `socket2`.
    pub rcvbuf: usize,
    /// `SO_SNDBUF` size hint passed to the socket, see `socket2`.
    pub sndbuf: usize,
}

impl Config {
    pub fn new(bind: SocketAddr, key: [u8; KEY_LEN]) -> Self {
        Self {
            bind,
            key,
            buffer_size: 1 << 20,
            max_packet_size: MAX_PACKET_SIZE,
            stream_retransmit_timeout: Duration::from_secs(15),
            rcvbuf: 2_000_000,
            sndbuf: 2_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_sane() {
        let config = Config::new("127.0.0.1:0".parse().unwrap(), [0u8; KEY_LEN]);
        assert_eq!(config.max_packet_size, MAX_PACKET_SIZE);
        assert!(config.buffer_size > 0);
        assert!(config.stream_retransmit_timeout.as_secs() > 0);
    }
}
