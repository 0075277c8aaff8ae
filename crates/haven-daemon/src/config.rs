//! Daemon configuration.
//!
//! Loaded from `config.toml` in the data directory, falling back to
//! defaults for anything unset. `HAVEN_DATA_DIR` overrides the data
//! directory. The mainnet/testnet choice lives here and is threaded
//! through construction; nothing reads network state globally.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use haven_types::account::Network;
use haven_types::DB_SIZE_LIMIT;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Which overlay network this node serves.
    #[serde(default)]
    pub network: Network,
    /// Network listeners.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Chain oracle connection.
    #[serde(default)]
    pub oracle: OracleConfig,
    /// RPC settings.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Peer bus (QUIC) bind address.
    #[serde(default = "default_bus_bind")]
    pub bus: SocketAddr,
    /// Legacy HTTP bind address.
    #[serde(default = "default_http_bind")]
    pub http: SocketAddr,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory; empty selects the platform default.
    #[serde(default)]
    pub data_dir: String,
    /// On-disk size cap for the message database, in bytes.
    #[serde(default = "default_size_cap")]
    pub size_cap: u64,
}

/// Chain oracle connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Oracle daemon bus address.
    #[serde(default = "default_oracle_addr")]
    pub address: SocketAddr,
    /// Oracle daemon Ed25519 identity, hex.
    #[serde(default)]
    pub pubkey: String,
}

/// RPC settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Peer identities allowed to read stats and logs, hex.
    #[serde(default)]
    pub stats_access_keys: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "haven=debug".
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bus_bind() -> SocketAddr {
    "0.0.0.0:22021".parse().expect("static addr")
}

fn default_http_bind() -> SocketAddr {
    "0.0.0.0:22023".parse().expect("static addr")
}

fn default_size_cap() -> u64 {
    DB_SIZE_LIMIT
}

fn default_oracle_addr() -> SocketAddr {
    "127.0.0.1:22025".parse().expect("static addr")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bus: default_bus_bind(),
            http: default_http_bind(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            size_cap: default_size_cap(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            address: default_oracle_addr(),
            pubkey: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from the data directory's `config.toml`, falling
    /// back to defaults when the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::data_dir_from_env().join("config.toml");
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::data_dir_from_env()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    /// Parsed stats access keys; invalid entries are skipped with a warning.
    pub fn stats_access_keys(&self) -> Vec<[u8; 32]> {
        self.rpc
            .stats_access_keys
            .iter()
            .filter_map(|h| {
                let decoded = hex::decode(h).ok()?;
                <[u8; 32]>::try_from(decoded.as_slice()).ok()
            })
            .collect()
    }

    /// Oracle identity, if configured.
    pub fn oracle_pubkey(&self) -> Option<[u8; 32]> {
        let decoded = hex::decode(&self.oracle.pubkey).ok()?;
        <[u8; 32]>::try_from(decoded.as_slice()).ok()
    }

    fn data_dir_from_env() -> PathBuf {
        if let Ok(dir) = std::env::var("HAVEN_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".haven"))
            .unwrap_or_else(|_| PathBuf::from("/var/lib/haven"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.storage.size_cap, DB_SIZE_LIMIT);
        assert!(config.rpc.stats_access_keys.is_empty());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = NodeConfig::default();
        let rendered = toml::to_string(&config).expect("serialize");
        let _parsed: NodeConfig = toml::from_str(&rendered).expect("parse");
    }

    #[test]
    fn test_partial_toml() {
        let parsed: NodeConfig = toml::from_str(
            "network = \"testnet\"\n[storage]\nsize_cap = 4096\n",
        )
        .expect("parse");
        assert_eq!(parsed.network, Network::Testnet);
        assert_eq!(parsed.storage.size_cap, 4096);
        // Unspecified sections keep their defaults.
        assert_eq!(parsed.listen.bus, default_bus_bind());
    }

    #[test]
    fn test_access_keys_skip_invalid() {
        let config: NodeConfig = toml::from_str(&format!(
            "[rpc]\nstats_access_keys = [\"{}\", \"zz\", \"abcd\"]\n",
            "11".repeat(32)
        ))
        .expect("parse");
        assert_eq!(config.stats_access_keys(), vec![[0x11u8; 32]]);
    }
}
