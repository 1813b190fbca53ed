//! The vehicle link capability.
//!
//! A [`VehicleLink`] is a live connection to one vehicle. It pushes telemetry
//! through per-stream broadcast channels and accepts motion commands, each of
//! which resolves once the vehicle has acknowledged (or refused) it.
//!
//! Implementations own a [`TelemetryFeed`] and publish into it from whatever
//! task decodes the wire traffic; consumers call [`VehicleLink::telemetry`]
//! to get a fresh set of receivers.

use crate::error::LinkError;
use crate::telemetry::{Attitude, Imu, LandedState, Position, VelocityNed};
use std::future::Future;
use tokio::sync::broadcast;

/// Offboard velocity set-point in the body frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BodyVelocity {
    pub forward_m_s: f32,
    pub right_m_s: f32,
    pub down_m_s: f32,
    pub yaw_rate_deg_s: f32,
}

/// Motion and telemetry interface to one vehicle.
///
/// Every command future completes with `Ok(())` when the vehicle accepted
/// the command. Acceptance does not mean the motion is finished; callers
/// that care about spatial arrival must watch telemetry.
pub trait VehicleLink: Send + Sync + 'static {
    /// Fresh receivers for every telemetry stream.
    fn telemetry(&self) -> TelemetryStreams;

    fn arm(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn disarm(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Altitude above ground used by the next [`VehicleLink::takeoff`].
    fn set_takeoff_altitude(
        &self,
        altitude_m: f32,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn takeoff(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn land(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Reposition to a global location at an MSL altitude.
    fn goto_location(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_msl_m: f32,
        approach_speed_m_s: f32,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn set_body_velocity(
        &self,
        velocity: BodyVelocity,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Send one line of text to the autopilot's system shell.
    fn send_shell(&self, command: &str) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// Receiving half of every telemetry stream.
pub struct TelemetryStreams {
    pub position: broadcast::Receiver<Position>,
    pub velocity: broadcast::Receiver<VelocityNed>,
    pub imu: broadcast::Receiver<Imu>,
    pub attitude: broadcast::Receiver<Attitude>,
    pub armed: broadcast::Receiver<bool>,
    pub health: broadcast::Receiver<bool>,
    pub landed: broadcast::Receiver<LandedState>,
}

/// Sending half of every telemetry stream.
///
/// Publishing never blocks: a stream with no subscribers simply drops the
/// value, and slow subscribers lag.
#[derive(Clone)]
pub struct TelemetryFeed {
    position: broadcast::Sender<Position>,
    velocity: broadcast::Sender<VelocityNed>,
    imu: broadcast::Sender<Imu>,
    attitude: broadcast::Sender<Attitude>,
    armed: broadcast::Sender<bool>,
    health: broadcast::Sender<bool>,
    landed: broadcast::Sender<LandedState>,
}

impl TelemetryFeed {
    /// Creates a feed whose streams each buffer up to `capacity` values.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            position: broadcast::channel(capacity).0,
            velocity: broadcast::channel(capacity).0,
            imu: broadcast::channel(capacity).0,
            attitude: broadcast::channel(capacity).0,
            armed: broadcast::channel(capacity).0,
            health: broadcast::channel(capacity).0,
            landed: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe(&self) -> TelemetryStreams {
        TelemetryStreams {
            position: self.position.subscribe(),
            velocity: self.velocity.subscribe(),
            imu: self.imu.subscribe(),
            attitude: self.attitude.subscribe(),
            armed: self.armed.subscribe(),
            health: self.health.subscribe(),
            landed: self.landed.subscribe(),
        }
    }

    pub fn publish_position(&self, position: Position) {
        let _ = self.position.send(position);
    }

    pub fn publish_velocity(&self, velocity: VelocityNed) {
        let _ = self.velocity.send(velocity);
    }

    pub fn publish_imu(&self, imu: Imu) {
        let _ = self.imu.send(imu);
    }

    pub fn publish_attitude(&self, attitude: Attitude) {
        let _ = self.attitude.send(attitude);
    }

    pub fn publish_armed(&self, armed: bool) {
        let _ = self.armed.send(armed);
    }

    pub fn publish_health(&self, healthy: bool) {
        let _ = self.health.send(healthy);
    }

    pub fn publish_landed(&self, landed: LandedState) {
        let _ = self.landed.send(landed);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_fans_out_to_every_subscriber() {
        let feed = TelemetryFeed::new(16);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        feed.publish_armed(true);

        assert!(a.armed.recv().await.expect("stream a"));
        assert!(b.armed.recv().await.expect("stream b"));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let feed = TelemetryFeed::new(1);
        feed.publish_position(Position::default());
        feed.publish_landed(LandedState::OnGround);
    }
}
