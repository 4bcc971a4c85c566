//! Configuration file module: the handful of settings a loopback
//! vhost-user backend actually needs.

use std::{fs::File, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub socket: SocketConfig,
    #[serde(default)]
    pub pcap: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketConfig {
    /// Path of the Unix stream socket the front-end (VMM) connects to.
    pub path: std::path::PathBuf,
}

impl Config {
    /// Loads a configuration file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let f = File::open(path)?;
        let cfg: Config = serde_yaml::from_reader(f)
            .map_err(|e| AppError::Config(format!("failed to parse config: {e}")))?;
        Ok(cfg)
    }
}
