use crate::navigator::{
    check_target, Mission, NavigatorSettings, Waypoint, DEFAULT_APPROACH_SPEED,
    DEFAULT_ARRIVAL_TOLERANCE_DEG,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub navigation: NavigationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub mission: Vec<MissionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_mode_server")]
    pub mode: LinkMode,
    /// Vehicle system id; learned from the first HEARTBEAT when unset.
    pub system_id: Option<u8>,
    #[serde(default = "default_gcs_system_id")]
    pub gcs_system_id: u8,
    #[serde(default = "default_gcs_component_id")]
    pub gcs_component_id: u8,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Requested rate for each telemetry message; 0 leaves the autopilot's
    /// defaults alone.
    #[serde(default = "default_stream_rate_hz")]
    pub stream_rate_hz: f32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            mode: default_mode_server(),
            system_id: None,
            gcs_system_id: default_gcs_system_id(),
            gcs_component_id: default_gcs_component_id(),
            command_timeout_ms: default_command_timeout_ms(),
            stream_rate_hz: default_stream_rate_hz(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Bind `address` and answer whoever sends to it.
    Server,
    /// Send to `address` from an ephemeral port.
    Client,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NavigationConfig {
    #[serde(default = "default_approach_speed")]
    pub approach_speed: f32,
    #[serde(default = "default_arrival_tolerance_deg")]
    pub arrival_tolerance_deg: f64,
    #[serde(default = "default_arrival_timeout_secs")]
    pub arrival_timeout_secs: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            approach_speed: default_approach_speed(),
            arrival_tolerance_deg: default_arrival_tolerance_deg(),
            arrival_timeout_secs: default_arrival_timeout_secs(),
        }
    }
}

impl NavigationConfig {
    pub fn settings(&self) -> NavigatorSettings {
        NavigatorSettings {
            approach_speed: self.approach_speed,
            arrival_tolerance_deg: self.arrival_tolerance_deg,
            arrival_timeout: Duration::from_secs(self.arrival_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_sample_channel_capacity")]
    pub sample_channel_capacity: usize,
    /// Period of the sampling-rate log line; 0 disables it.
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_channel_capacity: default_sample_channel_capacity(),
            log_interval_secs: default_log_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MissionConfig {
    pub name: String,
    #[serde(default)]
    pub return_to_start: bool,
    #[serde(default)]
    pub point: Vec<PointConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PointConfig {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_altitude_agl")]
    pub altitude_agl: f32,
    #[serde(default)]
    pub hover_seconds: f64,
}

impl MissionConfig {
    pub fn to_mission(&self) -> Mission {
        Mission::new(
            self.name.clone(),
            self.point
                .iter()
                .map(|p| Waypoint::new(p.latitude, p.longitude, p.altitude_agl, p.hover_seconds))
                .collect(),
            self.return_to_start,
        )
    }
}

fn default_address() -> String { "0.0.0.0:14540".to_string() }
fn default_mode_server() -> LinkMode { LinkMode::Server }
fn default_gcs_system_id() -> u8 { 255 }
fn default_gcs_component_id() -> u8 { 190 }
fn default_command_timeout_ms() -> u64 { 3000 }
fn default_stream_rate_hz() -> f32 { 10.0 }
fn default_approach_speed() -> f32 { DEFAULT_APPROACH_SPEED }
fn default_arrival_tolerance_deg() -> f64 { DEFAULT_ARRIVAL_TOLERANCE_DEG }
fn default_arrival_timeout_secs() -> u64 { 120 }
fn default_sample_channel_capacity() -> usize { 256 }
fn default_log_interval_secs() -> u64 { 10 }
fn default_altitude_agl() -> f32 { 30.0 }

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await
            .context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml)
            .context("Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.link.address.parse::<std::net::SocketAddr>().is_err() {
            tracing::warn!(
                "Link address {} is not a literal socket address, it will be resolved at startup",
                self.link.address
            );
        }

        if self.link.command_timeout_ms == 0 {
            anyhow::bail!("command_timeout_ms must be positive");
        }
        if !(self.link.stream_rate_hz >= 0.0) {
            anyhow::bail!("stream_rate_hz must not be negative: {}", self.link.stream_rate_hz);
        }

        let nav = &self.navigation;
        if !(nav.arrival_tolerance_deg > 0.0) {
            anyhow::bail!("arrival_tolerance_deg must be positive: {}", nav.arrival_tolerance_deg);
        }
        if nav.arrival_timeout_secs == 0 {
            anyhow::bail!("arrival_timeout_secs must be positive");
        }

        if self.telemetry.sample_channel_capacity < 10 {
            anyhow::bail!(
                "sample_channel_capacity too small: {}",
                self.telemetry.sample_channel_capacity
            );
        }

        let mut names = std::collections::HashSet::new();
        for (i, mission) in self.mission.iter().enumerate() {
            if !names.insert(mission.name.as_str()) {
                anyhow::bail!("Duplicate mission name '{}' (mission {})", mission.name, i + 1);
            }
            if mission.point.is_empty() {
                anyhow::bail!("Mission '{}' has no points", mission.name);
            }
            for (j, p) in mission.point.iter().enumerate() {
                if let Err(e) = check_target(p.latitude, p.longitude, p.altitude_agl) {
                    anyhow::bail!("Mission '{}' point {}: {}", mission.name, j + 1, e);
                }
                if !(p.hover_seconds >= 0.0) {
                    anyhow::bail!(
                        "Mission '{}' point {} has negative hover_seconds",
                        mission.name, j + 1
                    );
                }
            }
        }

        Ok(())
    }

    pub fn missions(&self) -> Vec<Mission> {
        self.mission.iter().map(MissionConfig::to_mission).collect()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_config() {
        let config = Config::parse("").expect("empty config is valid");
        assert_eq!(config.link.mode, LinkMode::Server);
        assert_eq!(config.link.gcs_system_id, 255);
        assert_eq!(config.navigation.arrival_timeout_secs, 120);
        assert_eq!(config.navigation.arrival_tolerance_deg, 0.000003);
        assert!(config.mission.is_empty());
    }

    #[test]
    fn test_mission_parsing() {
        let toml = r#"
[link]
address = "127.0.0.1:14550"
mode = "client"
system_id = 1

[[mission]]
name = "survey"
return_to_start = true

[[mission.point]]
latitude = -35.3632
longitude = 149.1652
altitude_agl = 30.0
hover_seconds = 5

[[mission.point]]
latitude = -35.3640
longitude = 149.1660
"#;
        let config = Config::parse(toml).expect("valid config");
        assert_eq!(config.link.mode, LinkMode::Client);
        assert_eq!(config.link.system_id, Some(1));

        let missions = config.missions();
        assert_eq!(missions.len(), 1);
        let mission = &missions[0];
        assert_eq!(mission.name(), "survey");
        assert!(mission.return_to_start());
        assert_eq!(mission.waypoints().len(), 2);
        assert_eq!(mission.waypoints()[0].hover_seconds(), 5.0);
        assert_eq!(mission.waypoints()[1].altitude_agl(), 30.0);
    }

    #[test]
    fn test_empty_mission_rejected() {
        let toml = r#"
[[mission]]
name = "empty"
"#;
        assert!(Config::parse(toml).is_err(), "Should reject mission without points");
    }

    #[test]
    fn test_out_of_range_point_rejected() {
        let toml = r#"
[[mission]]
name = "bad"
[[mission.point]]
latitude = 95.0
longitude = 10.0
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_duplicate_mission_name_rejected() {
        let toml = r#"
[[mission]]
name = "a"
[[mission.point]]
latitude = 1.0
longitude = 1.0

[[mission]]
name = "a"
[[mission.point]]
latitude = 2.0
longitude = 2.0
"#;
        assert!(Config::parse(toml).is_err(), "Should detect duplicate mission name");
    }

    #[test]
    fn test_settings_conversion() {
        let config = Config::default();
        let settings = config.navigation.settings();
        assert_eq!(settings.arrival_timeout, Duration::from_secs(120));
        assert_eq!(settings.approach_speed, 45.0);
    }
}
