//! Persisted CLI configuration: nickname, bind/peer addresses, and the data
//! directory holding the identity file the `SecretStore` is backed by.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub nickname: String,
    pub listen_addr: String,
    pub peer_addrs: Vec<String>,
    pub data_dir: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            listen_addr: "127.0.0.1:7878".to_string(),
            peer_addrs: Vec::new(),
            data_dir: None,
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(),
        }
    }

    pub fn identity_file(&self) -> PathBuf {
        self.data_dir().join("identity.bin")
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".bitchat")
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| CliError::Config("HOME is not set".into()))?;
    Ok(PathBuf::from(home).join(".bitchat").join("config.toml"))
}
