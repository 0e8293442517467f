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

use crate::{
    error::{TimemarkError, TimemarkResult},
    station::Station,
};
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    net::IpAddr,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::info;

/// Startup buffers shorter than this cannot guarantee a minute mark and are
/// rejected at config load.
pub const MIN_STARTUP_BUFFER_SECS: u32 = 60;

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "TIMEMARK_CONFIG")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "timemark".to_owned(),
            instance: InstanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

/// One radiod channel, keyed by SSRC.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub ssrc: u32,
    pub name: String,
    pub frequency_hz: u64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_samples_per_packet")]
    pub samples_per_packet: u32,
    /// Stations receivable on this frequency; the tone detectors only look
    /// for these.
    #[serde(default = "default_stations")]
    pub stations: Vec<Station>,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_samples_per_packet() -> u32 {
    320
}

fn default_stations() -> Vec<Station> {
    Station::ALL.to_vec()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderConfig {
    /// Local interface address used to join the multicast group.
    pub interface_ip: IpAddr,
    /// Multicast group radiod transmits to.
    pub group: IpAddr,
    pub port: u16,
    /// RTP payload types that carry int16 IQ from radiod.
    #[serde(default = "default_payload_types")]
    pub payload_types: Vec<u8>,
    #[serde(default = "default_startup_buffer_secs")]
    pub startup_buffer_secs: u32,
    pub output_dir: PathBuf,
    #[serde(default = "default_recorder_status_file")]
    pub status_file: PathBuf,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    pub channels: Vec<ChannelConfig>,
}

fn default_payload_types() -> Vec<u8> {
    vec![97]
}

fn default_startup_buffer_secs() -> u32 {
    120
}

fn default_recorder_status_file() -> PathBuf {
    PathBuf::from("core-recorder-status.json")
}

fn default_status_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsConfig {
    /// Root of the recorder's per-channel archive directories.
    pub archive_dir: PathBuf,
    /// Root for derived products (decimated archives, CSVs).
    pub output_dir: PathBuf,
    /// Root for persisted per-channel processing state and status files.
    pub state_dir: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    pub channels: Vec<ChannelConfig>,
}

fn default_poll_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    #[serde(default)]
    pub recorder: Option<RecorderConfig>,
    #[serde(default)]
    pub analytics: Option<AnalyticsConfig>,
}

impl Config {
    pub async fn load() -> TimemarkResult<Config> {
        let args = Args::parse();
        info!("Loading config …");
        let config = Config::load_from_file(&args.config).await?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from_file(path: &Path) -> TimemarkResult<Config> {
        let content = fs::read_to_string(&path).await.map_err(|e| {
            TimemarkError::InvalidConfig(format!(
                "could not read config file {}: {e}",
                path.to_string_lossy()
            ))
        })?;
        let config: Config = serde_yaml::from_str(&content)?;
        info!("Config loaded from {}", path.to_string_lossy());
        Ok(config)
    }

    pub fn validate(&self) -> TimemarkResult<()> {
        if let Some(recorder) = &self.recorder {
            if recorder.startup_buffer_secs < MIN_STARTUP_BUFFER_SECS {
                return Err(TimemarkError::InvalidConfig(format!(
                    "startupBufferSecs must be at least {MIN_STARTUP_BUFFER_SECS}, got {}",
                    recorder.startup_buffer_secs
                )));
            }
            validate_channels(&recorder.channels)?;
        }
        if let Some(analytics) = &self.analytics {
            validate_channels(&analytics.channels)?;
        }
        Ok(())
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance.name)
    }
}

fn validate_channels(channels: &[ChannelConfig]) -> TimemarkResult<()> {
    if channels.is_empty() {
        return Err(TimemarkError::InvalidConfig(
            "no channels configured".to_owned(),
        ));
    }
    let mut ssrcs = HashSet::new();
    let mut names = HashSet::new();
    for channel in channels {
        if channel.sample_rate == 0 || channel.samples_per_packet == 0 {
            return Err(TimemarkError::InvalidConfig(format!(
                "channel '{}' has zero sample rate or packet size",
                channel.name
            )));
        }
        if !ssrcs.insert(channel.ssrc) {
            return Err(TimemarkError::InvalidConfig(format!(
                "duplicate SSRC {:#010x}",
                channel.ssrc
            )));
        }
        if !names.insert(channel.name.clone()) {
            return Err(TimemarkError::InvalidConfig(format!(
                "duplicate channel name '{}'",
                channel.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn test_channel(ssrc: u32, name: &str) -> ChannelConfig {
        ChannelConfig {
            ssrc,
            name: name.to_owned(),
            frequency_hz: 10_000_000,
            sample_rate: 16_000,
            samples_per_packet: 320,
            stations: vec![Station::Wwv, Station::Wwvh],
        }
    }

    fn recorder_config(channels: Vec<ChannelConfig>, startup_secs: u32) -> Config {
        Config {
            app: AppConfig::default(),
            recorder: Some(RecorderConfig {
                interface_ip: "127.0.0.1".parse().expect("ip"),
                group: "239.1.2.3".parse().expect("ip"),
                port: 5004,
                payload_types: vec![97],
                startup_buffer_secs: startup_secs,
                output_dir: PathBuf::from("/tmp/archives"),
                status_file: default_recorder_status_file(),
                status_interval_secs: 10,
                channels,
            }),
            analytics: None,
        }
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
recorder:
  interfaceIp: 192.168.1.10
  group: 239.251.200.100
  port: 5004
  outputDir: /data/archives
  channels:
    - ssrc: 271828182
      name: wwv10
      frequencyHz: 10000000
      stations: [WWV, WWVH]
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        config.validate().expect("valid");
        let recorder = config.recorder.expect("recorder section");
        assert_eq!(recorder.startup_buffer_secs, 120);
        assert_eq!(recorder.payload_types, vec![97]);
        let channel = &recorder.channels[0];
        assert_eq!(channel.sample_rate, 16_000);
        assert_eq!(channel.samples_per_packet, 320);
        assert_eq!(channel.stations, vec![Station::Wwv, Station::Wwvh]);
    }

    #[test]
    fn rejects_short_startup_buffer() {
        let config = recorder_config(vec![test_channel(1, "wwv10")], 30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ssrc() {
        let config = recorder_config(
            vec![test_channel(1, "wwv10"), test_channel(1, "chu7")],
            120,
        );
        assert!(config.validate().is_err());
    }
}
