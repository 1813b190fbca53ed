#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

pub mod aggregator;
pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod history;
pub mod link;
pub mod mavlink_link;
pub mod navigator;
pub mod telemetry;

pub use aggregator::TelemetryAggregator;
pub use dispatch::{encode_text, Command, CommandDispatch, SampleRecord};
pub use driver::Driver;
pub use link::{BodyVelocity, TelemetryFeed, TelemetryStreams, VehicleLink};
pub use mavlink_link::MavlinkVehicle;
pub use navigator::{
    Mission, NavFailure, NavState, NavigationOutcome, NavigatorSettings, Waypoint,
    WaypointNavigator,
};
pub use telemetry::TelemetrySample;
