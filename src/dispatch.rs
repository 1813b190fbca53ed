//! Host command dispatch and sample record encoding.
//!
//! [`CommandDispatch`] is the host-facing surface: it turns [`Command`]
//! records into navigator or link calls and reports the result. Samples go
//! the other way as [`SampleRecord`]s, encoded as comma-separated text with
//! one record per line.

use crate::error::DispatchError;
use crate::link::{BodyVelocity, VehicleLink};
use crate::navigator::{check_target, Mission, NavigationOutcome, Waypoint, WaypointNavigator};
use crate::telemetry::TelemetrySample;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Token separator of the text record encoding.
pub const TOKEN_SEPARATOR: char = ',';
/// Block separator of the text record encoding.
pub const BLOCK_SEPARATOR: char = '\n';

/// A host command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Takeoff {
        altitude_agl: f32,
    },
    Location {
        latitude: f64,
        longitude: f64,
        altitude_agl: f32,
        #[serde(default)]
        return_to_start: bool,
        #[serde(default)]
        hover_seconds: f64,
    },
    /// Run a configured mission, selected by name or by 1-based number.
    Mission {
        #[serde(default)]
        number: Option<usize>,
        #[serde(default)]
        name: Option<String>,
        /// Overrides the mission's own flag when present.
        #[serde(default)]
        return_to_start: Option<bool>,
    },
    Land {
        #[serde(default = "default_disarm")]
        disarm: bool,
    },
    Offboard {
        #[serde(default)]
        forward: f32,
        #[serde(default)]
        right: f32,
        #[serde(default)]
        down: f32,
        #[serde(default)]
        yaw_rate: f32,
    },
    Shell {
        command: String,
    },
    Cancel,
}

fn default_disarm() -> bool {
    true
}

/// Routes host commands to one vehicle.
pub struct CommandDispatch<L> {
    missions: Vec<Mission>,
    navigator: watch::Sender<Option<Arc<WaypointNavigator<L>>>>,
}

impl<L: VehicleLink> CommandDispatch<L> {
    pub fn new(missions: Vec<Mission>) -> Self {
        Self {
            missions,
            navigator: watch::channel(None).0,
        }
    }

    /// Connects the dispatcher to a live vehicle. Commands executed before
    /// this are rejected with [`DispatchError::NotInitialized`].
    pub fn attach(&self, navigator: Arc<WaypointNavigator<L>>) {
        self.navigator.send_replace(Some(navigator));
    }

    pub fn is_attached(&self) -> bool {
        self.navigator.borrow().is_some()
    }

    /// Resolves once [`CommandDispatch::attach`] has been called.
    pub async fn wait_attached(&self) {
        let mut rx = self.navigator.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| n.is_some()).await;
    }

    pub fn missions(&self) -> &[Mission] {
        &self.missions
    }

    /// Executes one command to completion.
    ///
    /// Navigation commands return their outcome; a failed outcome becomes
    /// [`DispatchError::Rejected`]. Direct link commands return `Arrived` once
    /// the link accepted them, and `cancel` returns `Cancelled`.
    pub async fn execute(&self, command: Command) -> Result<NavigationOutcome, DispatchError> {
        let navigator = self
            .navigator
            .borrow()
            .clone()
            .ok_or(DispatchError::NotInitialized)?;

        info!(?command, "Executing command");
        check_command(&command).map_err(|e| {
            warn!("Command refused: {}", e);
            DispatchError::InvalidTarget(e)
        })?;
        match command {
            Command::Takeoff { altitude_agl } => settle(navigator.takeoff(altitude_agl).await),
            Command::Location {
                latitude,
                longitude,
                altitude_agl,
                return_to_start,
                hover_seconds,
            } => {
                let target = Waypoint::new(latitude, longitude, altitude_agl, hover_seconds);
                settle(navigator.goto_one(target, return_to_start).await)
            }
            Command::Mission {
                number,
                name,
                return_to_start,
            } => {
                let mut mission = self.find_mission(number, name.as_deref())?.clone();
                if let Some(flag) = return_to_start {
                    mission = mission.with_return_to_start(flag);
                }
                settle(navigator.run_mission(&mission).await)
            }
            Command::Land { disarm } => settle(navigator.land(disarm).await),
            Command::Offboard {
                forward,
                right,
                down,
                yaw_rate,
            } => {
                navigator
                    .link()
                    .set_body_velocity(BodyVelocity {
                        forward_m_s: forward,
                        right_m_s: right,
                        down_m_s: down,
                        yaw_rate_deg_s: yaw_rate,
                    })
                    .await?;
                Ok(NavigationOutcome::Arrived)
            }
            Command::Shell { command } => {
                navigator.link().send_shell(&command).await?;
                Ok(NavigationOutcome::Arrived)
            }
            Command::Cancel => {
                navigator.cancel();
                Ok(NavigationOutcome::Cancelled)
            }
        }
    }

    fn find_mission(&self, number: Option<usize>, name: Option<&str>) -> Result<&Mission, DispatchError> {
        if let Some(name) = name {
            return self
                .missions
                .iter()
                .find(|m| m.name() == name)
                .ok_or_else(|| DispatchError::UnknownMission(name.to_string()));
        }
        let number = number.unwrap_or(1);
        number
            .checked_sub(1)
            .and_then(|i| self.missions.get(i))
            .ok_or_else(|| DispatchError::UnknownMission(number.to_string()))
    }
}

/// Rejects commands whose values cannot be put on the wire.
fn check_command(command: &Command) -> Result<(), String> {
    match command {
        Command::Takeoff { altitude_agl } => {
            if altitude_agl.is_finite() && *altitude_agl > 0.0 {
                Ok(())
            } else {
                Err(format!("takeoff altitude {} must be positive", altitude_agl))
            }
        }
        Command::Location {
            latitude,
            longitude,
            altitude_agl,
            ..
        } => check_target(*latitude, *longitude, *altitude_agl),
        Command::Offboard {
            forward,
            right,
            down,
            yaw_rate,
        } => {
            if [forward, right, down, yaw_rate].iter().all(|v| v.is_finite()) {
                Ok(())
            } else {
                Err("offboard set-point must be finite".to_string())
            }
        }
        _ => Ok(()),
    }
}

fn settle(outcome: NavigationOutcome) -> Result<NavigationOutcome, DispatchError> {
    match outcome {
        NavigationOutcome::Failed(failure) => {
            warn!("Command rejected: {}", failure);
            Err(DispatchError::Rejected(failure))
        }
        other => Ok(other),
    }
}

/// Flat host record of one telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    pub time_s: f64,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_msl_m: f32,
    pub velocity_ned: [f32; 3],
    pub acceleration_frd: [f32; 3],
    pub angular_velocity_frd: [f32; 3],
    pub temperature_degc: f32,
    pub magnetic_field_frd: [f32; 3],
}

impl SampleRecord {
    pub const FIELD_NAMES: [&'static str; 17] = [
        "time",
        "latitude",
        "longitude",
        "altitude",
        "vel_north",
        "vel_east",
        "vel_down",
        "acc_forward",
        "acc_right",
        "acc_down",
        "gyro_forward",
        "gyro_right",
        "gyro_down",
        "temperature",
        "mag_forward",
        "mag_right",
        "mag_down",
    ];
}

impl From<&TelemetrySample> for SampleRecord {
    fn from(s: &TelemetrySample) -> Self {
        let imu = &s.imu;
        Self {
            time_s: s.timestamp_ms as f64 / 1000.0,
            latitude_deg: s.position.latitude_deg,
            longitude_deg: s.position.longitude_deg,
            altitude_msl_m: s.position.absolute_altitude_m,
            velocity_ned: [s.velocity.north_m_s, s.velocity.east_m_s, s.velocity.down_m_s],
            acceleration_frd: [imu.acceleration.forward, imu.acceleration.right, imu.acceleration.down],
            angular_velocity_frd: [
                imu.angular_velocity.forward,
                imu.angular_velocity.right,
                imu.angular_velocity.down,
            ],
            temperature_degc: imu.temperature_degc,
            magnetic_field_frd: [imu.magnetic_field.forward, imu.magnetic_field.right, imu.magnetic_field.down],
        }
    }
}

impl fmt::Display for SampleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = TOKEN_SEPARATOR;
        write!(f, "{}{sep}{}{sep}{}{sep}{}", self.time_s, self.latitude_deg, self.longitude_deg, self.altitude_msl_m)?;
        for group in [&self.velocity_ned, &self.acceleration_frd, &self.angular_velocity_frd] {
            for v in group {
                write!(f, "{sep}{}", v)?;
            }
        }
        write!(f, "{sep}{}", self.temperature_degc)?;
        for v in &self.magnetic_field_frd {
            write!(f, "{sep}{}", v)?;
        }
        Ok(())
    }
}

/// Encodes one sample as a newline-terminated text record.
pub fn encode_text(sample: &TelemetrySample) -> String {
    let mut line = SampleRecord::from(sample).to_string();
    line.push(BLOCK_SEPARATOR);
    line
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::telemetry::{Frd, Imu, Position, VelocityNed};

    fn sample() -> TelemetrySample {
        TelemetrySample {
            timestamp_ms: 1_500,
            position: Position {
                latitude_deg: 47.5,
                longitude_deg: -122.25,
                absolute_altitude_m: 130.5,
                relative_altitude_m: 30.0,
            },
            velocity: VelocityNed {
                north_m_s: 1.0,
                east_m_s: 2.0,
                down_m_s: -0.5,
            },
            imu: Imu {
                acceleration: Frd {
                    forward: 0.1,
                    right: 0.2,
                    down: -9.75,
                },
                angular_velocity: Frd::default(),
                magnetic_field: Frd {
                    forward: 0.25,
                    right: 0.0,
                    down: 0.5,
                },
                temperature_degc: 21.5,
            },
            attitude: None,
        }
    }

    #[test]
    fn test_encode_text_has_seventeen_fields() {
        let text = encode_text(&sample());
        assert!(text.ends_with('\n'));
        let fields: Vec<&str> = text.trim_end().split(',').collect();
        assert_eq!(fields.len(), SampleRecord::FIELD_NAMES.len());
        assert_eq!(fields[0], "1.5");
        assert_eq!(fields[1], "47.5");
        assert_eq!(fields[3], "130.5");
        assert_eq!(fields[9], "-9.75");
        assert_eq!(fields[13], "21.5");
        assert_eq!(fields[16], "0.5");
    }

    #[test]
    fn test_command_deserialization() {
        let cmd: Command = toml::from_str(
            r#"
type = "location"
latitude = 47.1
longitude = 8.2
altitude_agl = 20.0
return_to_start = true
"#,
        )
        .expect("location command");
        assert_eq!(
            cmd,
            Command::Location {
                latitude: 47.1,
                longitude: 8.2,
                altitude_agl: 20.0,
                return_to_start: true,
                hover_seconds: 0.0,
            }
        );

        let cmd: Command = toml::from_str("type = \"land\"").expect("land command");
        assert_eq!(cmd, Command::Land { disarm: true });

        let cmd: Command = toml::from_str("type = \"mission\"\nname = \"survey\"").expect("mission");
        assert_eq!(
            cmd,
            Command::Mission {
                number: None,
                name: Some("survey".to_string()),
                return_to_start: None,
            }
        );
    }
}
