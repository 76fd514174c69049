//! File-backed configuration, layered on top of `packetloom_core::Config`.
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use packetloom_core::crypto::KEY_LEN;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("`key` must be exactly {KEY_LEN} bytes of hex, got {0} bytes")]
    BadKeyLength(usize),
    #[error("`key` is not valid hex: {0}")]
    BadKeyHex(#[from] std::num::ParseIntError),
}

/// The on-disk TOML shape; kept separate from [`packetloom_core::Config`] so
/// the core crate never depends on `serde`/`toml` for its own sake, mirroring
/// the teacher's `Config`/`Srt` split in `stsync-proxy/src/config.rs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub mux: Mux,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mux {
    pub bind: SocketAddr,
    /// Pre-shared symmetric key, hex-encoded (64 hex characters).
    pub key: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,
    #[serde(default = "default_retransmit_secs")]
    pub retransmit_timeout_secs: u64,
    #[serde(default = "default_rcvbuf")]
    pub rcvbuf: usize,
    #[serde(default = "default_sndbuf")]
    pub sndbuf: usize,
}

const fn default_buffer_size() -> u64 {
    1 << 20
}

const fn default_retransmit_secs() -> u64 {
    15
}

const fn default_rcvbuf() -> usize {
    2_000_000
}

const fn default_sndbuf() -> usize {
    2_000_000
}

impl ConfigFile {
    pub fn from_file<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(toml::from_str(&buf)?)
    }

    pub fn into_core_config(self) -> Result<packetloom_core::Config, Error> {
        let key = parse_hex_key(&self.mux.key)?;

        let mut config = packetloom_core::Config::new(self.mux.bind, key);
        config.buffer_size = self.mux.buffer_size;
        config.stream_retransmit_timeout = Duration::from_secs(self.mux.retransmit_timeout_secs);
        config.rcvbuf = self.mux.rcvbuf;
        config.sndbuf = self.mux.sndbuf;
        Ok(config)
    }
}

fn parse_hex_key(s: &str) -> Result<[u8; KEY_LEN], Error> {
    let s = s.trim();
    if s.len() != KEY_LEN * 2 {
        return Err(Error::BadKeyLength(s.len() / 2));
    }

    let mut key = [0u8; KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_key_roundtrip() {
        let hex = "00".repeat(KEY_LEN);
        let key = parse_hex_key(&hex).unwrap();
        assert_eq!(key, [0u8; KEY_LEN]);
    }

    #[test]
    fn test_parse_hex_key_rejects_short_input() {
        let err = parse_hex_key("abcd").unwrap_err();
        assert!(matches!(err, Error::BadKeyLength(_)));
    }

    #[test]
    fn test_config_file_parses_minimal_toml() {
        let toml = format!(
            "[mux]\nbind = \"127.0.0.1:9001\"\nkey = \"{}\"\n",
            "ab".repeat(KEY_LEN)
        );
        let parsed: ConfigFile = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.mux.buffer_size, default_buffer_size());
        let core = parsed.into_core_config().unwrap();
        assert_eq!(core.key, [0xab; KEY_LEN]);
    }
}
