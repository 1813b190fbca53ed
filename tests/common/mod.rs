#![allow(dead_code)]
#![allow(clippy::expect_used)]

//! Scripted in-process vehicle used by the integration tests.

use mavdrive::error::LinkError;
use mavdrive::telemetry::{Imu, LandedState, Position, VelocityNed};
use mavdrive::{
    BodyVelocity, NavigatorSettings, TelemetryAggregator, TelemetryFeed, TelemetryStreams,
    VehicleLink, WaypointNavigator,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HOME: (f64, f64) = (47.0, 8.0);
/// MSL altitude of the ground under the fake vehicle.
pub const GROUND_MSL: f32 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Arm,
    Disarm,
    SetTakeoffAltitude(f32),
    Takeoff,
    Land,
    Goto {
        latitude: f64,
        longitude: f64,
        altitude_msl: f32,
        speed: f32,
    },
    Velocity(BodyVelocity),
    Shell(String),
}

/// How the fake vehicle reacts to commands.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Goto calls (1-based count) that move the vehicle to the target.
    pub fly_gotos: usize,
    /// Delay between a goto's completion and the position update.
    pub travel_time: Duration,
    /// Fail the n-th goto call with this error.
    pub fail_goto: Option<(usize, LinkError)>,
    /// Goto commands never complete.
    pub hang_goto: bool,
    /// Climb to the takeoff altitude after `takeoff`.
    pub climb: bool,
    /// Report `OnGround` after `land`.
    pub touch_down: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            fly_gotos: usize::MAX,
            travel_time: Duration::from_millis(200),
            fail_goto: None,
            hang_goto: false,
            climb: true,
            touch_down: true,
        }
    }
}

pub struct FakeLink {
    feed: TelemetryFeed,
    behavior: Behavior,
    calls: Mutex<Vec<Call>>,
    takeoff_altitude: Mutex<f32>,
}

impl FakeLink {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            feed: TelemetryFeed::new(64),
            behavior,
            calls: Mutex::new(Vec::new()),
            takeoff_altitude: Mutex::new(0.0),
        }
    }

    pub fn feed(&self) -> &TelemetryFeed {
        &self.feed
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn gotos(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Goto { .. }))
            .collect()
    }

    /// Publishes a full set of telemetry with the vehicle on the ground at
    /// [`HOME`].
    pub fn publish_home(&self) {
        self.feed.publish_velocity(VelocityNed::default());
        self.feed.publish_imu(Imu::default());
        self.feed.publish_armed(false);
        self.feed.publish_landed(LandedState::OnGround);
        self.feed.publish_position(position_at(HOME.0, HOME.1, GROUND_MSL));
    }

    fn record(&self, call: Call) -> usize {
        let mut calls = self.calls.lock();
        calls.push(call);
        calls.iter().filter(|c| matches!(c, Call::Goto { .. })).count()
    }

    fn after(&self, delay: Duration, publish: impl FnOnce(&TelemetryFeed) + Send + 'static) {
        let feed = self.feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            publish(&feed);
        });
    }
}

pub fn position_at(latitude_deg: f64, longitude_deg: f64, altitude_msl: f32) -> Position {
    Position {
        latitude_deg,
        longitude_deg,
        absolute_altitude_m: altitude_msl,
        relative_altitude_m: altitude_msl - GROUND_MSL,
    }
}

impl VehicleLink for FakeLink {
    fn telemetry(&self) -> TelemetryStreams {
        self.feed.subscribe()
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.record(Call::Arm);
        self.feed.publish_armed(true);
        Ok(())
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        self.record(Call::Disarm);
        self.feed.publish_armed(false);
        Ok(())
    }

    async fn set_takeoff_altitude(&self, altitude_m: f32) -> Result<(), LinkError> {
        self.record(Call::SetTakeoffAltitude(altitude_m));
        *self.takeoff_altitude.lock() = altitude_m;
        Ok(())
    }

    async fn takeoff(&self) -> Result<(), LinkError> {
        self.record(Call::Takeoff);
        if self.behavior.climb {
            let altitude = GROUND_MSL + *self.takeoff_altitude.lock();
            self.after(self.behavior.travel_time, move |feed| {
                feed.publish_landed(LandedState::InAir);
                feed.publish_position(position_at(HOME.0, HOME.1, altitude));
            });
        }
        Ok(())
    }

    async fn land(&self) -> Result<(), LinkError> {
        self.record(Call::Land);
        if self.behavior.touch_down {
            self.after(self.behavior.travel_time, |feed| {
                feed.publish_landed(LandedState::OnGround);
            });
        }
        Ok(())
    }

    async fn goto_location(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_msl_m: f32,
        approach_speed_m_s: f32,
    ) -> Result<(), LinkError> {
        let n = self.record(Call::Goto {
            latitude: latitude_deg,
            longitude: longitude_deg,
            altitude_msl: altitude_msl_m,
            speed: approach_speed_m_s,
        });
        if let Some((failing, err)) = &self.behavior.fail_goto {
            if *failing == n {
                return Err(err.clone());
            }
        }
        if self.behavior.hang_goto {
            std::future::pending::<()>().await;
        }
        if n <= self.behavior.fly_gotos {
            let pos = position_at(latitude_deg, longitude_deg, altitude_msl_m);
            self.after(self.behavior.travel_time, move |feed| feed.publish_position(pos));
        }
        Ok(())
    }

    async fn set_body_velocity(&self, velocity: BodyVelocity) -> Result<(), LinkError> {
        self.record(Call::Velocity(velocity));
        Ok(())
    }

    async fn send_shell(&self, command: &str) -> Result<(), LinkError> {
        self.record(Call::Shell(command.to_string()));
        Ok(())
    }
}

/// A navigator wired to a [`FakeLink`] with one complete sample already
/// emitted.
pub struct Harness {
    pub link: Arc<FakeLink>,
    pub telemetry: Arc<TelemetryAggregator>,
    pub navigator: Arc<WaypointNavigator<FakeLink>>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn new(behavior: Behavior) -> Self {
        Self::with_settings(behavior, NavigatorSettings::default()).await
    }

    pub async fn with_settings(behavior: Behavior, settings: NavigatorSettings) -> Self {
        let link = Arc::new(FakeLink::new(behavior));
        let telemetry = Arc::new(TelemetryAggregator::default());
        let token = CancellationToken::new();
        let handles = telemetry.attach(link.telemetry(), token.clone());

        let mut samples = telemetry.subscribe();
        link.publish_home();
        tokio::time::timeout(Duration::from_secs(5), samples.recv())
            .await
            .expect("first sample in time")
            .expect("sample channel open");

        let navigator = Arc::new(WaypointNavigator::new(
            link.clone(),
            telemetry.clone(),
            settings,
        ));

        Self {
            link,
            telemetry,
            navigator,
            token,
            handles,
        }
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        for h in self.handles {
            h.await.expect("ingest task");
        }
    }
}
