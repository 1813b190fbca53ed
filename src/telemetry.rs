//! Telemetry data model.
//!
//! These are the values a [`crate::link::VehicleLink`] pushes into the
//! aggregator and the merged [`TelemetrySample`] the aggregator hands back
//! out. Units follow the vehicle convention: degrees for geodetic angles,
//! metres, NED for velocity and FRD (forward/right/down) for body-frame IMU
//! vectors.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Global position fix.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    /// Altitude above mean sea level.
    pub absolute_altitude_m: f32,
    /// Altitude above the home/takeoff point.
    pub relative_altitude_m: f32,
}

impl Position {
    /// Difference between MSL altitude and altitude above ground at this fix.
    pub fn terrain_offset_m(&self) -> f32 {
        self.absolute_altitude_m - self.relative_altitude_m
    }
}

/// Velocity in the local North-East-Down frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityNed {
    pub north_m_s: f32,
    pub east_m_s: f32,
    pub down_m_s: f32,
}

/// A body-frame vector in forward/right/down axes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Frd {
    pub forward: f32,
    pub right: f32,
    pub down: f32,
}

/// Raw IMU reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Imu {
    /// m/s²
    pub acceleration: Frd,
    /// rad/s
    pub angular_velocity: Frd,
    /// gauss
    pub magnetic_field: Frd,
    pub temperature_degc: f32,
}

/// Euler attitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attitude {
    pub yaw_deg: f32,
    pub pitch_deg: f32,
    pub roll_deg: f32,
}

/// Landed state as reported by the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LandedState {
    #[default]
    Unknown,
    OnGround,
    InAir,
    TakingOff,
    Landing,
}

/// Vehicle status flags tracked next to the merged sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VehicleStatus {
    pub armed: bool,
    pub healthy: bool,
    pub landed: LandedState,
}

/// One merged, timestamped snapshot of vehicle state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    /// Milliseconds since UNIX epoch, monotonic within a process.
    pub timestamp_ms: u64,
    pub position: Position,
    pub velocity: VelocityNed,
    pub imu: Imu,
    /// Present once an attitude update has been seen.
    pub attitude: Option<Attitude>,
}

/// Get current wall-clock timestamp in milliseconds.
///
/// Captures the UNIX_EPOCH reference once and adds a monotonic elapsed
/// duration to it, so successive calls never go backwards even if the system
/// clock is stepped.
pub fn timestamp_ms() -> u64 {
    static BASE: OnceLock<(Instant, Duration)> = OnceLock::new();
    let (start_instant, start_unix) = BASE.get_or_init(|| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (Instant::now(), now)
    });

    let total = start_unix.saturating_add(start_instant.elapsed());
    total.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terrain_offset() {
        let pos = Position {
            latitude_deg: -35.36,
            longitude_deg: 149.16,
            absolute_altitude_m: 614.0,
            relative_altitude_m: 30.0,
        };
        assert_eq!(pos.terrain_offset_m(), 584.0);
    }

    #[test]
    fn test_timestamp_ms_monotonic_walltime() {
        let t1 = timestamp_ms();
        let t2 = timestamp_ms();
        assert!(t2 >= t1);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let tolerance = 5_000;
        assert!(t2 + tolerance >= now);
        assert!(t2 <= now + tolerance);
    }
}
