/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::error::{ConfigError, ConfigResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Path to the config file
    #[arg(short, long, env = "PIERRE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameConfig {
    #[serde(default)]
    pub dsp: DspConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub rack: RackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DspConfig {
    /// Fraction of hardware threads dedicated to DSP workers.
    #[serde(default = "default_concurrency_factor")]
    pub concurrency_factor: f64,
}

impl Default for DspConfig {
    fn default() -> Self {
        DspConfig {
            concurrency_factor: default_concurrency_factor(),
        }
    }
}

impl DspConfig {
    pub fn worker_count(&self) -> usize {
        let hw = std::thread::available_parallelism()
            .map(|it| it.get())
            .unwrap_or(1);
        ((hw as f64 * self.concurrency_factor) as usize).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    /// Window before a frame's due time during which it is dispatched.
    #[serde(default = "default_lead_ns")]
    pub lead_ns: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            lead_ns: default_lead_ns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RackConfig {
    /// Racked frame count at which session reads pause.
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    /// Racked frame count below which session reads resume.
    #[serde(default = "default_low_water")]
    pub low_water: usize,
    #[serde(default = "default_max_frames_per_reel")]
    pub max_frames_per_reel: usize,
    /// How long a racked work-in-progress frame may wait for DSP.
    #[serde(default = "default_wip_timeout_ms")]
    pub wip_timeout_ms: u64,
}

impl Default for RackConfig {
    fn default() -> Self {
        RackConfig {
            high_water: default_high_water(),
            low_water: default_low_water(),
            max_frames_per_reel: default_max_frames_per_reel(),
            wip_timeout_ms: default_wip_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            service_name: default_service_name(),
            device_id: default_device_id(),
        }
    }
}

impl ClockConfig {
    /// Name of the shared memory segment published by the PTP daemon.
    pub fn shm_name(&self) -> String {
        format!("/{}-{}", self.service_name, self.device_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default = "default_remote_host")]
    pub host: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            host: default_remote_host(),
            port: default_remote_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Session cipher key as 64 hex chars, normally provisioned by the
    /// pairing handshake.
    #[serde(default)]
    pub shared_key_hex: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            listen_port: default_listen_port(),
            shared_key_hex: None,
        }
    }
}

impl SessionConfig {
    pub fn shared_key(&self) -> ConfigResult<Option<[u8; 32]>> {
        let Some(hex_key) = &self.shared_key_hex else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key)
            .map_err(|e| ConfigError::InvalidSessionKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidSessionKey("key must be 32 bytes".to_owned()))?;
        Ok(Some(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub db_uri: String,
    #[serde(default = "default_batch_of")]
    pub batch_of: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            enabled: false,
            db_uri: String::new(),
            batch_of: default_batch_of(),
        }
    }
}

impl Config {
    pub async fn load() -> ConfigResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let config = Config::load_from_file(args.config.as_deref()).await?;

        Ok(config)
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> ConfigResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(&path).await?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.yaml";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/pierre/config.yaml";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path).await {
                    Ok(it) => {
                        let config = serde_yaml::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }
}

fn default_concurrency_factor() -> f64 {
    0.4
}

fn default_lead_ns() -> u64 {
    10_000_000
}

fn default_high_water() -> usize {
    1024
}

fn default_low_water() -> usize {
    512
}

fn default_max_frames_per_reel() -> usize {
    64
}

fn default_wip_timeout_ms() -> u64 {
    100
}

fn default_service_name() -> String {
    "pierre".to_owned()
}

fn default_device_id() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn default_remote_host() -> String {
    "dmx".to_owned()
}

fn default_remote_port() -> u16 {
    49152
}

fn default_listen_port() -> u16 {
    7000
}

fn default_batch_of() -> usize {
    150
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(0.4, config.frame.dsp.concurrency_factor);
        assert_eq!(10_000_000, config.frame.render.lead_ns);
        assert!(config.frame.rack.low_water < config.frame.rack.high_water);
        assert!(!config.stats.enabled);
    }

    #[test]
    fn shm_name_has_service_and_device() {
        let clock = ClockConfig {
            service_name: "pierre".to_owned(),
            device_id: "aabbcc".to_owned(),
        };
        assert_eq!("/pierre-aabbcc", clock.shm_name());
    }

    #[test]
    fn shared_key_roundtrip() {
        let session = SessionConfig {
            listen_port: 7000,
            shared_key_hex: Some("00".repeat(32)),
        };
        let key = session.shared_key().expect("valid key");
        assert_eq!(Some([0u8; 32]), key);
    }

    #[test]
    fn shared_key_rejects_wrong_length() {
        let session = SessionConfig {
            listen_port: 7000,
            shared_key_hex: Some("0011".to_owned()),
        };
        assert!(session.shared_key().is_err());
    }
}
