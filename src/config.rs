//! Engine configuration
//!
//! The options an IRC client exposes in its DCC preferences panel,
//! persisted as JSON alongside the rest of the client configuration.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::DEFAULT_BLOCK_SIZE;

/// Runtime options for DCC sessions
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DccConfig {
    /// Address announced to peers in offers, as seen from the IRC server
    #[serde(default = "default_local_address")]
    pub local_address: Ipv4Addr,

    /// Chunk size for file transfer I/O
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Send without waiting for acknowledgement packets
    #[serde(default)]
    pub turbo: bool,

    /// Offer reverse (passive) DCC, for senders that cannot accept
    /// inbound connections
    #[serde(default)]
    pub passive: bool,

    /// First port to try when listening; 0 lets the OS pick
    #[serde(default)]
    pub first_port: u16,

    /// Last port to try when listening
    #[serde(default)]
    pub last_port: u16,

    /// Print diagnostics for dropped messages and session turnover
    #[serde(default)]
    pub debug: bool,
}

fn default_local_address() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

impl Default for DccConfig {
    fn default() -> Self {
        Self {
            local_address: default_local_address(),
            block_size: default_block_size(),
            turbo: false,
            passive: false,
            first_port: 0,
            last_port: 0,
            debug: false,
        }
    }
}

impl DccConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Save configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DccConfig::default();
        assert_eq!(config.local_address, Ipv4Addr::LOCALHOST);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(!config.turbo);
        assert!(!config.passive);
        assert_eq!(config.first_port, 0);
        assert_eq!(config.last_port, 0);
        assert!(!config.debug);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dcc.json");

        let config = DccConfig {
            local_address: Ipv4Addr::new(203, 0, 113, 9),
            block_size: 4096,
            turbo: true,
            passive: true,
            first_port: 40000,
            last_port: 40010,
            debug: false,
        };
        config.save(&path).unwrap();

        let loaded = DccConfig::load(&path).unwrap();
        assert_eq!(loaded.local_address, config.local_address);
        assert_eq!(loaded.block_size, 4096);
        assert!(loaded.turbo);
        assert!(loaded.passive);
        assert_eq!(loaded.first_port, 40000);
        assert_eq!(loaded.last_port, 40010);
    }

    #[test]
    fn test_load_fills_missing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dcc.json");
        std::fs::write(&path, "{\"turbo\": true}").unwrap();

        let loaded = DccConfig::load(&path).unwrap();
        assert!(loaded.turbo);
        assert_eq!(loaded.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(loaded.local_address, Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dcc.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(DccConfig::load(&path).is_err());
    }
}
