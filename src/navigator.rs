//! Waypoint and mission navigation.
//!
//! [`WaypointNavigator`] drives a vehicle through a chain of motion goals.
//! Each operation (`goto_one`, `run_mission`, `takeoff`, `land`) runs as a
//! sequence of asynchronous steps:
//!
//! ```text
//! Idle -> Arming? -> EnRoute -> Hovering? -> ReturningHome? -> Done
//! ```
//!
//! A motion command's completion only means the vehicle accepted it, so
//! outbound legs are additionally gated on live telemetry: the leg ends on
//! the first sample emitted after the command completed whose latitude and
//! longitude are each within the arrival tolerance of the target. Return
//! legs only wait for command completion.
//!
//! Every wait is bounded by the arrival timeout and unblocks immediately on
//! [`WaypointNavigator::cancel`]. Failures never escape as errors; they are
//! reported through [`NavigationOutcome`].
//!
//! Operations are serialized. A request made while another operation is in
//! flight waits for it to finish.

use crate::aggregator::TelemetryAggregator;
use crate::error::LinkError;
use crate::link::VehicleLink;
use crate::telemetry::{LandedState, Position, TelemetrySample};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-axis latitude/longitude tolerance for declaring arrival, in degrees.
pub const DEFAULT_ARRIVAL_TOLERANCE_DEG: f64 = 0.000003;
/// Speed passed with every goto command.
pub const DEFAULT_APPROACH_SPEED: f32 = 45.0;
/// Upper bound on any single wait for command completion or arrival.
pub const DEFAULT_ARRIVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// A navigation target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    latitude_deg: f64,
    longitude_deg: f64,
    altitude_agl_m: f32,
    hover_seconds: f64,
}

impl Waypoint {
    /// Negative or non-finite hover durations are treated as no hover.
    pub fn new(latitude_deg: f64, longitude_deg: f64, altitude_agl_m: f32, hover_seconds: f64) -> Self {
        let hover_seconds = if hover_seconds.is_finite() && hover_seconds > 0.0 {
            hover_seconds
        } else {
            0.0
        };
        Self {
            latitude_deg,
            longitude_deg,
            altitude_agl_m,
            hover_seconds,
        }
    }

    pub fn latitude_deg(&self) -> f64 {
        self.latitude_deg
    }

    pub fn longitude_deg(&self) -> f64 {
        self.longitude_deg
    }

    pub fn altitude_agl(&self) -> f32 {
        self.altitude_agl_m
    }

    pub fn hover_seconds(&self) -> f64 {
        self.hover_seconds
    }

    /// Rejects targets that cannot be sent to a vehicle.
    pub fn check(&self) -> Result<(), String> {
        check_target(self.latitude_deg, self.longitude_deg, self.altitude_agl_m)
    }

    fn hover_duration(&self) -> Option<Duration> {
        (self.hover_seconds > 0.0).then(|| Duration::from_secs_f64(self.hover_seconds))
    }
}

/// An ordered list of waypoints with an optional final leg back to the
/// position the vehicle started from.
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    name: String,
    waypoints: Vec<Waypoint>,
    return_to_start: bool,
}

impl Mission {
    pub fn new(name: impl Into<String>, waypoints: Vec<Waypoint>, return_to_start: bool) -> Self {
        Self {
            name: name.into(),
            waypoints,
            return_to_start,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn return_to_start(&self) -> bool {
        self.return_to_start
    }

    /// Same mission with a different return-to-start flag.
    pub fn with_return_to_start(mut self, return_to_start: bool) -> Self {
        self.return_to_start = return_to_start;
        self
    }
}

/// Range check for a geodetic target.
///
/// Latitude must lie in [-90, 90] and longitude in [-180, 180]; NaN and
/// infinities fail both. The altitude must be finite.
pub fn check_target(latitude_deg: f64, longitude_deg: f64, altitude_agl_m: f32) -> Result<(), String> {
    if !(-90.0..=90.0).contains(&latitude_deg) {
        return Err(format!("latitude {} out of range", latitude_deg));
    }
    if !(-180.0..=180.0).contains(&longitude_deg) {
        return Err(format!("longitude {} out of range", longitude_deg));
    }
    if !altitude_agl_m.is_finite() {
        return Err(format!("altitude {} is not finite", altitude_agl_m));
    }
    Ok(())
}

/// Where the vehicle was when an operation started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomePosition {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

impl From<&Position> for HomePosition {
    fn from(pos: &Position) -> Self {
        Self {
            latitude_deg: pos.latitude_deg,
            longitude_deg: pos.longitude_deg,
        }
    }
}

/// Returns `true` when `position` is within `tolerance_deg` of the target on
/// both the latitude and the longitude axis.
pub fn within_tolerance(
    position: &Position,
    latitude_deg: f64,
    longitude_deg: f64,
    tolerance_deg: f64,
) -> bool {
    (position.latitude_deg - latitude_deg).abs() <= tolerance_deg
        && (position.longitude_deg - longitude_deg).abs() <= tolerance_deg
}

/// Why a navigation operation failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavFailure {
    #[error("no telemetry sample available yet")]
    NotReady,

    #[error("{0}")]
    LinkFailure(LinkError),

    #[error("arrival or completion not observed in time")]
    Timeout,

    #[error("no vehicle link attached")]
    NotInitialized,

    #[error("mission has no waypoints")]
    EmptyMission,

    /// A mission leg failed. `index` is 1-based.
    #[error("leg {index} failed: {cause}")]
    Leg { index: usize, cause: Box<NavFailure> },
}

impl NavFailure {
    /// Vendor code of the underlying link failure, if any.
    pub fn link_code(&self) -> Option<u32> {
        match self {
            NavFailure::LinkFailure(e) => Some(e.code()),
            NavFailure::Leg { cause, .. } => cause.link_code(),
            _ => None,
        }
    }

    /// 1-based index of the failing mission leg, if any.
    pub fn leg_index(&self) -> Option<usize> {
        match self {
            NavFailure::Leg { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Terminal result of a navigation operation.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationOutcome {
    Arrived,
    Cancelled,
    Failed(NavFailure),
}

impl NavigationOutcome {
    pub fn is_arrived(&self) -> bool {
        matches!(self, NavigationOutcome::Arrived)
    }
}

impl fmt::Display for NavigationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigationOutcome::Arrived => write!(f, "arrived"),
            NavigationOutcome::Cancelled => write!(f, "cancelled"),
            NavigationOutcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Observable navigation state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NavState {
    #[default]
    Idle,
    Arming,
    TakingOff,
    /// Flying an outbound leg; `leg` is 1-based.
    EnRoute { leg: usize },
    Hovering,
    ReturningHome,
    Landing,
    Done(NavigationOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigatorSettings {
    pub approach_speed: f32,
    pub arrival_tolerance_deg: f64,
    pub arrival_timeout: Duration,
}

impl Default for NavigatorSettings {
    fn default() -> Self {
        Self {
            approach_speed: DEFAULT_APPROACH_SPEED,
            arrival_tolerance_deg: DEFAULT_ARRIVAL_TOLERANCE_DEG,
            arrival_timeout: DEFAULT_ARRIVAL_TIMEOUT,
        }
    }
}

/// Early exit from an operation's step chain.
enum Interrupt {
    Cancelled,
    Failed(NavFailure),
}

impl Interrupt {
    fn in_leg(self, index: usize) -> Self {
        match self {
            Interrupt::Failed(cause) => Interrupt::Failed(NavFailure::Leg {
                index,
                cause: Box::new(cause),
            }),
            other => other,
        }
    }
}

impl From<LinkError> for Interrupt {
    fn from(err: LinkError) -> Self {
        Interrupt::Failed(NavFailure::LinkFailure(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    /// Command completion plus telemetry proximity.
    Proximity,
    /// Command completion only.
    CommandOnly,
}

/// Sequences motion commands against one vehicle.
pub struct WaypointNavigator<L> {
    link: Arc<L>,
    telemetry: Arc<TelemetryAggregator>,
    settings: NavigatorSettings,
    queue: tokio::sync::Mutex<()>,
    current: parking_lot::Mutex<CancellationToken>,
    state: watch::Sender<NavState>,
}

impl<L: VehicleLink> WaypointNavigator<L> {
    pub fn new(link: Arc<L>, telemetry: Arc<TelemetryAggregator>, settings: NavigatorSettings) -> Self {
        let (state, _) = watch::channel(NavState::Idle);
        Self {
            link,
            telemetry,
            settings,
            queue: tokio::sync::Mutex::new(()),
            current: parking_lot::Mutex::new(CancellationToken::new()),
            state,
        }
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    pub fn settings(&self) -> &NavigatorSettings {
        &self.settings
    }

    pub fn state(&self) -> NavState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NavState> {
        self.state.subscribe()
    }

    /// Stop observing the in-flight operation.
    ///
    /// Pending waits unblock and the operation ends `Cancelled`. Commands
    /// already sent to the vehicle are not retracted.
    pub fn cancel(&self) {
        info!("Navigation cancel requested");
        self.current.lock().cancel();
    }

    /// Fly to `target`, hover if requested, then optionally fly back to the
    /// position the vehicle started from.
    pub async fn goto_one(&self, target: Waypoint, return_to_start: bool) -> NavigationOutcome {
        let (_guard, token) = self.begin().await;
        let result = self.goto_one_steps(&target, return_to_start, &token).await;
        self.finish("goto", result)
    }

    /// Fly every waypoint of `mission` in order.
    pub async fn run_mission(&self, mission: &Mission) -> NavigationOutcome {
        let (_guard, token) = self.begin().await;
        let result = self.mission_steps(mission, &token).await;
        self.finish("mission", result)
    }

    /// Arm, take off and climb to `altitude_agl` metres above home.
    pub async fn takeoff(&self, altitude_agl: f32) -> NavigationOutcome {
        let (_guard, token) = self.begin().await;
        let result = self.takeoff_steps(altitude_agl, &token).await;
        self.finish("takeoff", result)
    }

    /// Land, wait for touchdown and optionally disarm.
    pub async fn land(&self, disarm: bool) -> NavigationOutcome {
        let (_guard, token) = self.begin().await;
        let result = self.land_steps(disarm, &token).await;
        self.finish("land", result)
    }

    async fn begin(&self) -> (tokio::sync::MutexGuard<'_, ()>, CancellationToken) {
        let guard = self.queue.lock().await;
        let token = CancellationToken::new();
        *self.current.lock() = token.clone();
        (guard, token)
    }

    fn finish(&self, op: &str, result: Result<(), Interrupt>) -> NavigationOutcome {
        let outcome = match result {
            Ok(()) => NavigationOutcome::Arrived,
            Err(Interrupt::Cancelled) => NavigationOutcome::Cancelled,
            Err(Interrupt::Failed(e)) => NavigationOutcome::Failed(e),
        };
        match &outcome {
            NavigationOutcome::Failed(e) => warn!("Navigation {} failed: {}", op, e),
            other => info!("Navigation {} {}", op, other),
        }
        self.state.send_replace(NavState::Done(outcome.clone()));
        outcome
    }

    fn set_state(&self, state: NavState) {
        debug!(?state, "Navigation state");
        self.state.send_replace(state);
    }

    async fn goto_one_steps(
        &self,
        target: &Waypoint,
        return_to_start: bool,
        token: &CancellationToken,
    ) -> Result<(), Interrupt> {
        let sample = self.current_sample()?;
        let terrain_offset = sample.position.terrain_offset_m();
        let altitude_msl = target.altitude_agl() + terrain_offset;
        let home = return_to_start.then(|| HomePosition::from(&sample.position));

        info!(
            lat = target.latitude_deg(),
            lon = target.longitude_deg(),
            altitude_msl,
            terrain_offset,
            "Going to location"
        );

        self.set_state(NavState::EnRoute { leg: 1 });
        self.fly_leg(
            target.latitude_deg(),
            target.longitude_deg(),
            altitude_msl,
            Arrival::Proximity,
            token,
        )
        .await?;
        self.hover(target, token).await?;

        if let Some(home) = home {
            self.return_home(home, altitude_msl, token).await?;
        }
        Ok(())
    }

    async fn mission_steps(&self, mission: &Mission, token: &CancellationToken) -> Result<(), Interrupt> {
        let first = mission
            .waypoints()
            .first()
            .ok_or(Interrupt::Failed(NavFailure::EmptyMission))?;
        let sample = self.current_sample()?;
        let home = HomePosition::from(&sample.position);
        // Fixed for the whole mission from the first waypoint.
        let altitude_msl = first.altitude_agl() + sample.position.terrain_offset_m();

        info!(
            mission = mission.name(),
            legs = mission.waypoints().len(),
            altitude_msl,
            "Starting mission"
        );

        for (i, point) in mission.waypoints().iter().enumerate() {
            let index = i + 1;
            self.set_state(NavState::EnRoute { leg: index });
            let leg = async {
                self.fly_leg(
                    point.latitude_deg(),
                    point.longitude_deg(),
                    altitude_msl,
                    Arrival::Proximity,
                    token,
                )
                .await?;
                self.hover(point, token).await
            };
            leg.await.map_err(|e| e.in_leg(index))?;
            info!(mission = mission.name(), leg = index, "Mission leg reached");
        }

        if mission.return_to_start() {
            self.return_home(home, altitude_msl, token).await?;
        }
        Ok(())
    }

    async fn takeoff_steps(&self, altitude_agl: f32, token: &CancellationToken) -> Result<(), Interrupt> {
        self.current_sample()?;
        let deadline = Instant::now() + self.settings.arrival_timeout;

        self.set_state(NavState::Arming);
        self.bounded(token, deadline, async { Ok(self.link.arm().await?) }).await?;
        self.bounded(token, deadline, async {
            Ok(self.link.set_takeoff_altitude(altitude_agl).await?)
        })
        .await?;

        self.set_state(NavState::TakingOff);
        self.bounded(token, deadline, async { Ok(self.link.takeoff().await?) }).await?;

        let reached = |s: &TelemetrySample| s.position.relative_altitude_m >= altitude_agl;
        let rx = self.telemetry.subscribe();
        if !self.telemetry.latest().is_some_and(|s| reached(&s)) {
            self.bounded(token, deadline, wait_for_sample(rx, reached)).await?;
        }
        info!(altitude_agl, "Reached takeoff altitude");
        Ok(())
    }

    async fn land_steps(&self, disarm: bool, token: &CancellationToken) -> Result<(), Interrupt> {
        let deadline = Instant::now() + self.settings.arrival_timeout;

        self.set_state(NavState::Landing);
        let mut status = self.telemetry.subscribe_status();
        self.bounded(token, deadline, async { Ok(self.link.land().await?) }).await?;
        self.bounded(token, deadline, async {
            status
                .wait_for(|s| s.landed == LandedState::OnGround)
                .await
                .map(|_| ())
                .map_err(|_| Interrupt::Failed(NavFailure::LinkFailure(LinkError::NotConnected)))
        })
        .await?;
        info!("Landed");

        if disarm && self.telemetry.status().armed {
            info!("Disarming after landing");
            self.bounded(token, deadline, async { Ok(self.link.disarm().await?) }).await?;
        }
        Ok(())
    }

    fn current_sample(&self) -> Result<TelemetrySample, Interrupt> {
        self.telemetry
            .latest()
            .ok_or(Interrupt::Failed(NavFailure::NotReady))
    }

    async fn fly_leg(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_msl: f32,
        arrival: Arrival,
        token: &CancellationToken,
    ) -> Result<(), Interrupt> {
        let deadline = Instant::now() + self.settings.arrival_timeout;
        let speed = self.settings.approach_speed;

        self.bounded(token, deadline, async {
            Ok(self
                .link
                .goto_location(latitude_deg, longitude_deg, altitude_msl, speed)
                .await?)
        })
        .await?;

        if arrival == Arrival::Proximity {
            let tolerance = self.settings.arrival_tolerance_deg;
            let rx = self.telemetry.subscribe();
            self.bounded(
                token,
                deadline,
                wait_for_sample(rx, move |s| {
                    within_tolerance(&s.position, latitude_deg, longitude_deg, tolerance)
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn hover(&self, point: &Waypoint, token: &CancellationToken) -> Result<(), Interrupt> {
        if let Some(duration) = point.hover_duration() {
            self.set_state(NavState::Hovering);
            debug!("Hovering for {:?}", duration);
            cancellable(token, async {
                tokio::time::sleep(duration).await;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn return_home(
        &self,
        home: HomePosition,
        altitude_msl: f32,
        token: &CancellationToken,
    ) -> Result<(), Interrupt> {
        info!(lat = home.latitude_deg, lon = home.longitude_deg, "Returning to start");
        self.set_state(NavState::ReturningHome);
        self.fly_leg(
            home.latitude_deg,
            home.longitude_deg,
            altitude_msl,
            Arrival::CommandOnly,
            token,
        )
        .await
    }

    async fn bounded<T>(
        &self,
        token: &CancellationToken,
        deadline: Instant,
        fut: impl Future<Output = Result<T, Interrupt>>,
    ) -> Result<T, Interrupt> {
        cancellable(token, async {
            match tokio::time::timeout_at(deadline, fut).await {
                Ok(res) => res,
                Err(_) => Err(Interrupt::Failed(NavFailure::Timeout)),
            }
        })
        .await
    }
}

async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, Interrupt>>,
) -> Result<T, Interrupt> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Interrupt::Cancelled),
        res = fut => res,
    }
}

async fn wait_for_sample<F>(
    mut rx: broadcast::Receiver<TelemetrySample>,
    predicate: F,
) -> Result<TelemetrySample, Interrupt>
where
    F: Fn(&TelemetrySample) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(sample) if predicate(&sample) => return Ok(sample),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => debug!("Navigation fell behind telemetry by {} samples", n),
            Err(RecvError::Closed) => {
                return Err(Interrupt::Failed(NavFailure::LinkFailure(LinkError::NotConnected)))
            }
        }
    }
}
