//! Telemetry aggregation.
//!
//! The vehicle link delivers position, velocity, IMU and attitude on
//! independent streams at independent rates. [`TelemetryAggregator`] folds
//! the latest value of each into one in-progress sample and, once position,
//! velocity and IMU have all been seen, emits a merged [`TelemetrySample`] on
//! every subsequent update.
//!
//! All mutable telemetry state lives behind a single mutex: the merge, the
//! interval bookkeeping and the publication of a sample happen inside the
//! same critical section, so no sample is ever assembled from a half-applied
//! update and subscribers observe samples in completion order. Publication
//! goes through a `broadcast` channel and never blocks the producer.

use crate::history::SamplingHistory;
use crate::link::TelemetryStreams;
use crate::telemetry::{
    self, Attitude, Imu, LandedState, Position, TelemetrySample, VehicleStatus, VelocityNed,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default capacity of the sample broadcast channel.
pub const DEFAULT_SAMPLE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct AggregatorState {
    position: Option<Position>,
    velocity: Option<VelocityNed>,
    imu: Option<Imu>,
    attitude: Option<Attitude>,
    latest: Option<TelemetrySample>,
    history: SamplingHistory,
    emitted: u64,
}

/// Current best-known vehicle state for one connection.
pub struct TelemetryAggregator {
    state: Mutex<AggregatorState>,
    samples: broadcast::Sender<TelemetrySample>,
    status: watch::Sender<VehicleStatus>,
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CHANNEL_CAPACITY)
    }
}

impl TelemetryAggregator {
    /// Creates an empty aggregator whose subscribers may fall up to
    /// `capacity` samples behind before lagging.
    pub fn new(capacity: usize) -> Self {
        let (samples, _) = broadcast::channel(capacity.max(1));
        let (status, _) = watch::channel(VehicleStatus::default());
        Self {
            state: Mutex::new(AggregatorState::default()),
            samples,
            status,
        }
    }

    // The wall-clock variants stamp inside the critical section so sample
    // timestamps never go backwards in emission order.

    pub fn on_position_update(&self, position: Position) {
        self.merge(None, |state| state.position = Some(position));
    }

    pub fn on_velocity_update(&self, velocity: VelocityNed) {
        self.merge(None, |state| state.velocity = Some(velocity));
    }

    pub fn on_imu_update(&self, imu: Imu) {
        self.merge(None, |state| state.imu = Some(imu));
    }

    pub fn on_attitude_update(&self, attitude: Attitude) {
        self.merge(None, |state| state.attitude = Some(attitude));
    }

    pub fn on_position_update_at(&self, position: Position, timestamp_ms: u64) {
        self.merge(Some(timestamp_ms), |state| state.position = Some(position));
    }

    pub fn on_velocity_update_at(&self, velocity: VelocityNed, timestamp_ms: u64) {
        self.merge(Some(timestamp_ms), |state| state.velocity = Some(velocity));
    }

    pub fn on_imu_update_at(&self, imu: Imu, timestamp_ms: u64) {
        self.merge(Some(timestamp_ms), |state| state.imu = Some(imu));
    }

    pub fn on_attitude_update_at(&self, attitude: Attitude, timestamp_ms: u64) {
        self.merge(Some(timestamp_ms), |state| state.attitude = Some(attitude));
    }

    pub fn on_armed_update(&self, armed: bool) {
        self.status.send_modify(|s| s.armed = armed);
    }

    pub fn on_health_update(&self, healthy: bool) {
        self.status.send_modify(|s| s.healthy = healthy);
    }

    pub fn on_landed_state_update(&self, landed: LandedState) {
        self.status.send_modify(|s| s.landed = landed);
    }

    /// Snapshot of the most recently emitted sample.
    pub fn latest(&self) -> Option<TelemetrySample> {
        self.state.lock().latest
    }

    /// Mean interval between emitted samples, in seconds.
    ///
    /// `None` until at least two samples have been emitted.
    pub fn average_sampling_period(&self) -> Option<f64> {
        self.state.lock().history.average()
    }

    /// Number of intervals currently retained in the sampling history.
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Intervals currently retained, oldest first.
    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.iter().copied().collect()
    }

    /// Total number of samples emitted so far.
    pub fn sample_count(&self) -> u64 {
        self.state.lock().emitted
    }

    /// Receive every sample emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySample> {
        self.samples.subscribe()
    }

    pub fn status(&self) -> VehicleStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<VehicleStatus> {
        self.status.subscribe()
    }

    /// Spawns one ingest task per telemetry stream.
    ///
    /// Each task folds its stream into this aggregator until `token` is
    /// cancelled or the stream closes.
    pub fn attach(
        self: &Arc<Self>,
        streams: TelemetryStreams,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let TelemetryStreams {
            position,
            velocity,
            imu,
            attitude,
            armed,
            health,
            landed,
        } = streams;

        let agg = self.clone();
        let mut handles = vec![spawn_ingest("position", position, token.clone(), move |p| {
            agg.on_position_update(p)
        })];
        let agg = self.clone();
        handles.push(spawn_ingest("velocity", velocity, token.clone(), move |v| {
            agg.on_velocity_update(v)
        }));
        let agg = self.clone();
        handles.push(spawn_ingest("imu", imu, token.clone(), move |i| {
            agg.on_imu_update(i)
        }));
        let agg = self.clone();
        handles.push(spawn_ingest("attitude", attitude, token.clone(), move |a| {
            agg.on_attitude_update(a)
        }));
        let agg = self.clone();
        handles.push(spawn_ingest("armed", armed, token.clone(), move |a| {
            agg.on_armed_update(a)
        }));
        let agg = self.clone();
        handles.push(spawn_ingest("health", health, token.clone(), move |h| {
            agg.on_health_update(h)
        }));
        let agg = self.clone();
        handles.push(spawn_ingest("landed", landed, token, move |l| {
            agg.on_landed_state_update(l)
        }));
        handles
    }

    fn merge(&self, timestamp: Option<u64>, apply: impl FnOnce(&mut AggregatorState)) {
        let mut state = self.state.lock();
        apply(&mut state);

        let (Some(position), Some(velocity), Some(imu)) = (state.position, state.velocity, state.imu)
        else {
            return;
        };
        let timestamp_ms = timestamp.unwrap_or_else(telemetry::timestamp_ms);

        if let Some(prev) = state.latest {
            let interval_ms = timestamp_ms.saturating_sub(prev.timestamp_ms);
            state.history.push(interval_ms as f64 / 1000.0);
        }

        let sample = TelemetrySample {
            timestamp_ms,
            position,
            velocity,
            imu,
            attitude: state.attitude,
        };
        state.latest = Some(sample);
        state.emitted += 1;

        // Sent under the lock so subscribers see samples in completion order.
        if self.samples.send(sample).is_err() {
            trace!("No sample subscribers");
        }
    }
}

fn spawn_ingest<T, F>(
    name: &'static str,
    mut rx: broadcast::Receiver<T>,
    token: CancellationToken,
    apply: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                res = rx.recv() => match res {
                    Ok(value) => apply(value),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Telemetry stream {} lagged: missed {} updates", name, n);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Telemetry stream {} closed", name);
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::link::TelemetryFeed;
    use std::time::Duration;

    fn pos(lat: f64, lon: f64) -> Position {
        Position {
            latitude_deg: lat,
            longitude_deg: lon,
            absolute_altitude_m: 100.0,
            relative_altitude_m: 10.0,
        }
    }

    #[test]
    fn test_no_sample_until_complete() {
        let agg = TelemetryAggregator::default();
        let mut rx = agg.subscribe();

        agg.on_position_update_at(pos(1.0, 2.0), 0);
        agg.on_attitude_update_at(Attitude::default(), 5);
        agg.on_velocity_update_at(VelocityNed::default(), 10);
        assert!(agg.latest().is_none());
        assert!(rx.try_recv().is_err());

        agg.on_imu_update_at(Imu::default(), 20);
        let sample = rx.try_recv().expect("first complete sample");
        assert_eq!(sample.timestamp_ms, 20);
        assert!(sample.attitude.is_some());
        assert!(rx.try_recv().is_err());
        assert_eq!(agg.sample_count(), 1);
        assert_eq!(agg.average_sampling_period(), None);
    }

    #[test]
    fn test_interval_tracking() {
        let agg = TelemetryAggregator::default();
        agg.on_position_update_at(pos(1.0, 2.0), 0);
        agg.on_velocity_update_at(VelocityNed::default(), 0);
        agg.on_imu_update_at(Imu::default(), 1000);
        agg.on_position_update_at(pos(1.0, 2.0), 1200);
        agg.on_position_update_at(pos(1.0, 2.0), 1600);

        assert_eq!(agg.history(), vec![0.2, 0.4]);
        let avg = agg.average_sampling_period().expect("two intervals");
        assert!((avg - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_attitude_absent_until_seen() {
        let agg = TelemetryAggregator::default();
        agg.on_position_update_at(pos(1.0, 2.0), 0);
        agg.on_velocity_update_at(VelocityNed::default(), 0);
        agg.on_imu_update_at(Imu::default(), 0);
        assert_eq!(agg.latest().expect("sample").attitude, None);

        let att = Attitude {
            yaw_deg: 90.0,
            pitch_deg: 1.0,
            roll_deg: -1.0,
        };
        agg.on_attitude_update_at(att, 10);
        assert_eq!(agg.latest().expect("sample").attitude, Some(att));
    }

    #[test]
    fn test_status_updates() {
        let agg = TelemetryAggregator::default();
        let rx = agg.subscribe_status();
        agg.on_armed_update(true);
        agg.on_landed_state_update(LandedState::InAir);
        assert!(agg.status().armed);
        assert_eq!(rx.borrow().landed, LandedState::InAir);
        assert!(!agg.status().healthy);
    }

    #[tokio::test]
    async fn test_attach_folds_streams() {
        let feed = TelemetryFeed::new(16);
        let agg = Arc::new(TelemetryAggregator::default());
        let token = CancellationToken::new();
        let handles = agg.attach(feed.subscribe(), token.clone());
        let mut rx = agg.subscribe();
        let mut status_rx = agg.subscribe_status();

        feed.publish_position(pos(3.0, 4.0));
        feed.publish_velocity(VelocityNed::default());
        feed.publish_imu(Imu::default());
        feed.publish_armed(true);

        let sample = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(s) = rx.recv().await {
                    return s;
                }
            }
        })
        .await
        .expect("sample emitted");
        assert_eq!(sample.position.latitude_deg, 3.0);

        tokio::time::timeout(Duration::from_secs(1), status_rx.wait_for(|s| s.armed))
            .await
            .expect("armed flag applied")
            .expect("status channel open");

        token.cancel();
        for h in handles {
            h.await.expect("ingest task");
        }
    }
}
