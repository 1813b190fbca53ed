//! High-level API for starting and managing a vehicle driver.
//!
//! This module provides a simplified interface for library users who want to
//! embed mavdrive in their applications without wiring the link, aggregator,
//! navigator and dispatcher by hand.
//!
//! # Example
//!
//! ```no_run
//! use mavdrive::{Command, Driver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Driver::from_str(r#"
//! [link]
//! address = "0.0.0.0:14540"
//! "#).await?;
//!
//! if driver.wait_connected(std::time::Duration::from_secs(30)).await {
//!     driver.dispatch().execute(Command::Takeoff { altitude_agl: 10.0 }).await?;
//! }
//! driver.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::aggregator::TelemetryAggregator;
use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::dispatch::CommandDispatch;
use crate::error::Result;
use crate::link::VehicleLink;
use crate::mavlink_link::MavlinkVehicle;
use crate::navigator::WaypointNavigator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A handle to a running driver.
///
/// Call [`Driver::stop`] to shut down the link and every background task.
pub struct Driver {
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    vehicle: Arc<MavlinkVehicle>,
    telemetry: Arc<TelemetryAggregator>,
    navigator: Arc<WaypointNavigator<MavlinkVehicle>>,
    dispatch: Arc<CommandDispatch<MavlinkVehicle>>,
}

impl Driver {
    /// Starts a driver from a [`Config`] instance.
    ///
    /// Binds the link socket, spawns the link, telemetry ingest and
    /// sampling-rate tasks, and attaches the dispatcher once the vehicle
    /// has been heard from.
    ///
    /// # Errors
    ///
    /// Returns an error if the link socket cannot be bound.
    pub async fn start(config: Config) -> Result<Self> {
        let cancel_token = CancellationToken::new();
        let mut handles = Vec::new();
        let capacity = config.telemetry.sample_channel_capacity;

        let vehicle = Arc::new(MavlinkVehicle::bind(&config.link, capacity).await?);

        let telemetry = Arc::new(TelemetryAggregator::new(capacity));
        handles.extend(telemetry.attach(vehicle.telemetry(), cancel_token.child_token()));

        let link_token = cancel_token.child_token();
        let link_vehicle = vehicle.clone();
        handles.push(tokio::spawn(supervise(
            format!("MAVLink link ({})", config.link.address),
            link_token.clone(),
            move || link_vehicle.clone().run(link_token.clone()),
        )));

        if config.telemetry.log_interval_secs > 0 {
            handles.push(tokio::spawn(log_sampling_rate(
                telemetry.clone(),
                Duration::from_secs(config.telemetry.log_interval_secs),
                cancel_token.child_token(),
            )));
        }

        let navigator = Arc::new(WaypointNavigator::new(
            vehicle.clone(),
            telemetry.clone(),
            config.navigation.settings(),
        ));
        let dispatch = Arc::new(CommandDispatch::new(config.missions()));

        let attach_token = cancel_token.child_token();
        let mut connected = vehicle.connected();
        let (attach_nav, attach_dispatch) = (navigator.clone(), dispatch.clone());
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = attach_token.cancelled() => {}
                res = connected.wait_for(|c| *c) => {
                    if res.is_ok() {
                        attach_dispatch.attach(attach_nav);
                        info!("Command dispatch attached to vehicle");
                    }
                }
            }
        }));

        info!(
            "Driver started with {} mission(s) and {} background task(s)",
            dispatch.missions().len(),
            handles.len()
        );

        Ok(Self {
            cancel_token,
            handles,
            vehicle,
            telemetry,
            navigator,
            dispatch,
        })
    }

    /// Starts a driver from a TOML configuration string.
    pub async fn from_str(toml: &str) -> Result<Self> {
        let config = Config::parse(toml)?;
        Self::start(config).await
    }

    /// Starts a driver by loading configuration from a file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config::load(path).await?;
        Self::start(config).await
    }

    /// Waits until the vehicle has been identified and the dispatcher is
    /// usable. Returns `false` on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        if !self.vehicle.wait_connected(timeout).await {
            return false;
        }
        tokio::time::timeout(timeout, self.dispatch.wait_attached())
            .await
            .is_ok()
    }

    /// Stops the in-flight navigation operation, then every background task.
    pub async fn stop(self) {
        info!("Driver stopping...");
        self.navigator.cancel();
        self.cancel_token.cancel();

        for res in futures::future::join_all(self.handles).await {
            if let Err(e) = res {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Driver stopped");
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn vehicle(&self) -> &Arc<MavlinkVehicle> {
        &self.vehicle
    }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    pub fn navigator(&self) -> &Arc<WaypointNavigator<MavlinkVehicle>> {
        &self.navigator
    }

    pub fn dispatch(&self) -> &Arc<CommandDispatch<MavlinkVehicle>> {
        &self.dispatch
    }

    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }
}

async fn log_sampling_rate(
    telemetry: Arc<TelemetryAggregator>,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let status = telemetry.status();
                match telemetry.average_sampling_period() {
                    Some(avg) if avg > 0.0 => info!(
                        samples = telemetry.sample_count(),
                        armed = status.armed,
                        landed = ?status.landed,
                        "Telemetry avg period {:.3}s ({:.1} Hz)",
                        avg,
                        1.0 / avg
                    ),
                    _ => info!(samples = telemetry.sample_count(), "Telemetry: no sampling data yet"),
                }
            }
        }
    }
}

/// Restarts a task with exponential backoff until cancelled.
async fn supervise<F, Fut>(name: String, cancel_token: CancellationToken, task_factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);

    loop {
        let start_time = std::time::Instant::now();
        let result = tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor for {} shutting down", name);
                break;
            }
            result = task_factory() => result,
        };

        if start_time.elapsed() > Duration::from_secs(60) {
            backoff.reset();
        }
        match result {
            Ok(()) if cancel_token.is_cancelled() => break,
            Ok(()) => warn!("Task {} finished cleanly (unexpected). Restarting...", name),
            Err(e) => error!("Task {} failed: {:#}. Restarting...", name, e),
        }

        let wait = backoff.next_backoff();
        info!("Waiting {:.1?} before restarting {}", wait, name);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {},
            _ = cancel_token.cancelled() => {
                info!("Supervisor for {} shutting down during backoff", name);
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, DriverError};
    use crate::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_driver_rejects_invalid_config() {
        let result = Driver::from_str("[link]\ncommand_timeout_ms = 0").await;
        assert!(matches!(result, Err(DriverError::Config(_))));
    }

    #[tokio::test]
    async fn test_driver_start_and_stop() {
        let driver = Driver::from_str("[link]\naddress = \"127.0.0.1:0\"")
            .await
            .expect("should start");
        assert!(driver.is_running());
        assert!(!driver.vehicle().is_connected());
        assert!(!driver.wait_connected(Duration::from_millis(50)).await);
        driver.stop().await;
    }

    #[tokio::test]
    async fn test_driver_reports_bind_failure_as_network_error() {
        let taken = tokio::net::UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = taken.local_addr().expect("local addr").to_string();

        let result = Driver::from_str(&format!("[link]\naddress = \"{}\"", addr)).await;
        match result {
            Err(DriverError::Network { endpoint, .. }) => assert_eq!(endpoint, addr),
            Err(e) => panic!("expected network error, got {}", e),
            Ok(_) => panic!("second bind on {} should fail", addr),
        }
    }

    #[tokio::test]
    async fn test_dispatch_not_initialized_before_connection() {
        let driver = Driver::from_str("[link]\naddress = \"127.0.0.1:0\"")
            .await
            .expect("should start");
        let result = driver.dispatch().execute(Command::Cancel).await;
        assert_eq!(result, Err(DispatchError::NotInitialized));
        driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_restarts_failed_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let counter = runs.clone();
        let handle = tokio::spawn(supervise("flaky".to_string(), token.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("boom"))
            }
        }));

        // Backoff waits 1s, 2s, 4s between attempts.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.expect("supervisor");
    }
}
