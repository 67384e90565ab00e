// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mudband/mudband.toml";
pub const DEFAULT_API_HOST: &str = "https://www.mud.band";

const MIN_LOG_RETENTION_DAYS: u32 = 3;
const MAX_LOG_RETENTION_DAYS: u32 = 60;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    pub api_host: String,
    pub state_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_retention_days: u32,
    pub device_name: Option<String>,
    pub listen_port: u16,
    pub ping_interval_secs: u64,
    pub conf_refresh_secs: u64,
    pub status_snapshot: bool,
    pub stun: StunToml,
}

/// Values the engine reports for STUN, since classification is done elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StunToml {
    pub mapped_addr: Option<String>,
    pub nat_type: i32,
}

impl Default for ClientToml {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.into(),
            state_dir: PathBuf::from("/var/lib/mudband"),
            log_dir: None,
            log_retention_days: MIN_LOG_RETENTION_DAYS,
            device_name: None,
            listen_port: 51820,
            ping_interval_secs: 3,
            conf_refresh_secs: 600,
            status_snapshot: false,
            stun: StunToml::default(),
        }
    }
}

impl ClientToml {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn conf_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.conf_refresh_secs.max(1))
    }

    /// Log retention clamped to the supported window.
    pub fn log_retention_days(&self) -> u32 {
        self.log_retention_days
            .clamp(MIN_LOG_RETENTION_DAYS, MAX_LOG_RETENTION_DAYS)
    }

    /// Configured device name, or the host name when none is set.
    pub fn device_name(&self) -> String {
        if let Some(name) = self.device_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "mudband-device".into())
    }
}

#[derive(Debug, Error)]
pub enum ClientConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid api_host: {0}")]
    InvalidApiHost(String),
}

pub async fn load(path: &Path) -> Result<ClientToml, ClientConfigError> {
    debug!(path = %path.display(), "loading config");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: ClientToml = toml::from_str(&contents)?;
            validate(&config)?;
            info!(
                path = %path.display(),
                api_host = %config.api_host,
                state_dir = %config.state_dir.display(),
                "loaded config"
            );
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(ClientToml::default())
        }
        Err(e) => Err(ClientConfigError::Read(e)),
    }
}

fn validate(config: &ClientToml) -> Result<(), ClientConfigError> {
    let host = config.api_host.trim();
    if !(host.starts_with("https://") || host.starts_with("http://")) {
        return Err(ClientConfigError::InvalidApiHost(config.api_host.clone()));
    }
    Ok(())
}
