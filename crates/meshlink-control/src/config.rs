//! Server Configuration
//!
//! JSON config file with defaults, created on first run. Command-line flags
//! override file values; overrides are not written back.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use meshlink_types::PrivateKey;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ControlError, ControlResult};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const STORE_FILE_NAME: &str = "store.db";
pub const KEY_FILE_NAME: &str = "private_key";

fn default_provision_key() -> String {
    "please".to_string()
}

/// Server configuration as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network_prefix: Ipv4Net,
    pub store_path: PathBuf,
    pub http_port: u16,
    pub stun_port: u16,
    #[serde(default)]
    pub autocert_domain: String,
    #[serde(rename = "debug_mode", default)]
    pub debug: bool,
    #[serde(default = "default_provision_key")]
    pub provision_key: String,
}

impl Config {
    /// Defaults rooted in `dir`
    pub fn default_in(dir: &Path) -> Self {
        Self {
            network_prefix: Ipv4Net::new(Ipv4Addr::new(100, 70, 0, 0), 24)
                .expect("default prefix is valid"),
            store_path: dir.join(STORE_FILE_NAME),
            http_port: 8080,
            stun_port: 3478,
            autocert_domain: String::new(),
            debug: false,
            provision_key: default_provision_key(),
        }
    }

    /// Read the config file at `dir/config.json`
    pub fn load(dir: &Path) -> ControlResult<Self> {
        let raw = std::fs::read(dir.join(CONFIG_FILE_NAME))?;
        serde_json::from_slice(&raw)
            .map_err(|err| ControlError::Internal(format!("config file: {err}")))
    }

    /// Write the config file to `dir/config.json`
    pub fn save(&self, dir: &Path) -> ControlResult<()> {
        std::fs::create_dir_all(dir)?;
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|err| ControlError::Internal(err.to_string()))?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), raw)?;
        Ok(())
    }

    /// Read the config, or create it from defaults on first run
    pub fn load_or_create(dir: &Path) -> ControlResult<Self> {
        match Self::load(dir) {
            Ok(config) => Ok(config),
            Err(ControlError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default_in(dir);
                if let Err(err) = config.save(dir) {
                    warn!(error = %err, "could not write default config file");
                }
                Ok(config)
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    private_key: PrivateKey,
}

/// Load the long-term private key from `dir/private_key`, generating and
/// best-effort persisting one when missing; falls back to an ephemeral key
/// if the file cannot be written.
pub fn load_or_generate_key(dir: &Path) -> PrivateKey {
    let path = dir.join(KEY_FILE_NAME);

    if let Ok(raw) = std::fs::read(&path) {
        match serde_json::from_slice::<KeyFile>(&raw) {
            Ok(file) if !file.private_key.is_zero() => return file.private_key,
            _ => warn!(path = %path.display(), "ignoring invalid private key file"),
        }
    }

    let key = PrivateKey::generate();
    let file = KeyFile {
        private_key: key.clone(),
    };
    let persisted = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(&path, serde_json::to_vec(&file).unwrap_or_default()));
    if let Err(err) = persisted {
        warn!(error = %err, "could not persist private key, running with an ephemeral key");
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default_in(dir.path());
        assert_eq!(config.network_prefix.to_string(), "100.70.0.0/24");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.stun_port, 3478);
        assert_eq!(config.provision_key, "please");
        assert!(!config.debug);
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let created = Config::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());

        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded.network_prefix, created.network_prefix);
        assert_eq!(loaded.http_port, created.http_port);
    }

    #[test]
    fn test_config_without_provision_key_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            br#"{"network_prefix":"100.70.0.0/24","store_path":"/tmp/s.db","http_port":9000,"stun_port":3478,"debug_mode":true}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.http_port, 9000);
        assert!(config.debug);
        assert_eq!(config.provision_key, "please");
    }

    #[test]
    fn test_key_is_persisted_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_key(dir.path());
        let second = load_or_generate_key(dir.path());
        assert_eq!(first.public(), second.public());
    }
}
