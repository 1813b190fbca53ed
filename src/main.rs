#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use anyhow::Result;
use clap::Parser;
use mavdrive::config::Config;
use mavdrive::{encode_text, Command, Driver};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mavdrive.toml")]
    config: String,

    /// Take off to this altitude (metres above ground) once connected
    #[arg(long)]
    takeoff: Option<f32>,

    /// Fly a configured mission, by name or 1-based number
    #[arg(long)]
    mission: Option<String>,

    /// Land and disarm after the other commands complete
    #[arg(long)]
    land: bool,

    /// Print every telemetry sample to stdout as a text record
    #[arg(long)]
    records: bool,

    /// Seconds to wait for the vehicle before giving up on scripted commands
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
}

impl Args {
    fn script(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        if let Some(altitude_agl) = self.takeoff {
            commands.push(Command::Takeoff { altitude_agl });
        }
        if let Some(mission) = &self.mission {
            let (number, name) = match mission.parse::<usize>() {
                Ok(n) => (Some(n), None),
                Err(_) => (None, Some(mission.clone())),
            };
            commands.push(Command::Mission {
                number,
                name,
                return_to_start: None,
            });
        }
        if self.land {
            commands.push(Command::Land { disarm: true });
        }
        commands
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting mavdrive with config: {}", args.config);

    let config = match Config::load(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading config: {:#}", e);
            return Err(e);
        }
    };

    info!(
        "Loaded configuration with {} mission(s), link {} ({:?})",
        config.mission.len(),
        config.link.address,
        config.link.mode
    );

    let driver = Driver::start(config).await?;

    if args.records {
        tokio::spawn(print_records(driver.telemetry().clone(), driver.cancel_token()));
    }

    let script = args.script();
    let run_script = async {
        if script.is_empty() {
            return std::future::pending::<()>().await;
        }
        if !driver
            .wait_connected(Duration::from_secs(args.connect_timeout))
            .await
        {
            warn!("No vehicle after {}s; skipping scripted commands", args.connect_timeout);
            return std::future::pending::<()>().await;
        }
        for command in script {
            match driver.dispatch().execute(command).await {
                Ok(outcome) => info!("Command finished: {}", outcome),
                Err(e) => {
                    error!("Command failed: {}", e);
                    break;
                }
            }
        }
        info!("Scripted commands complete");
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received. Initiating graceful shutdown...");
        }
        _ = run_script => {}
    }

    driver.stop().await;
    info!("Shutdown complete.");

    Ok(())
}

async fn print_records(
    telemetry: std::sync::Arc<mavdrive::TelemetryAggregator>,
    token: CancellationToken,
) {
    let mut rx = telemetry.subscribe();
    let mut stdout = tokio::io::stdout();
    loop {
        let sample = tokio::select! {
            _ = token.cancelled() => break,
            res = rx.recv() => match res {
                Ok(sample) => sample,
                Err(RecvError::Lagged(n)) => {
                    warn!("Record output lagged: dropped {} samples", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        };
        if let Err(e) = stdout.write_all(encode_text(&sample).as_bytes()).await {
            error!("Failed to write record: {}", e);
            break;
        }
    }
}
