use std::time::Duration;

use clap::Parser;
use dronelink::{ConnectionParams, LinkConfig, Notification, StreamRates, Vehicle};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

/// Connect to a vehicle and print its telemetry.
#[derive(Debug, Parser)]
struct Args {
    /// `udp`, `udp:<port>` or `serial:<device>[:<baud>]`
    #[arg(default_value = "udp:14550")]
    connection: ConnectionParams,

    /// Telemetry rate requested for every stream, in Hz
    #[arg(long, default_value_t = StreamRates::DEFAULT_HZ)]
    rate: u16,

    /// Switch to this mode once connected, e.g. `Loiter`
    #[arg(long)]
    mode: Option<String>,

    /// Stop after this many seconds
    #[arg(long, default_value_t = 30)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dronelink=info")),
        )
        .init();

    let vehicle = Vehicle::new(LinkConfig {
        stream_rates: StreamRates::uniform(args.rate),
        ..LinkConfig::default()
    });
    let notifications = vehicle.notifications();

    vehicle.connect(args.connection.clone())?.await?;
    tracing::info!(connection = %args.connection, "connected");

    if let Some(mode) = &args.mode {
        let labels: Vec<_> = vehicle.available_modes().iter().map(|m| m.label()).collect();
        tracing::info!(?labels, "available modes");
        match vehicle.set_mode(mode) {
            Ok(handle) => {
                let result = handle.await;
                tracing::info!(?result, %mode, "set mode");
            }
            Err(e) => tracing::warn!(error = %e, "set mode"),
        }
    }

    let stop = tokio::time::sleep(Duration::from_secs(args.seconds));
    let mut notifications = Box::pin(notifications.take_until(stop));
    while let Some(notification) = notifications.next().await {
        match notification {
            Notification::PositionUpdated { position, is_gps_valid } => {
                println!(
                    "position {:.7} {:.7} gps {}",
                    position.lat, position.lon, is_gps_valid
                );
                if let Ok(distance) = vehicle.distance_from_home() {
                    println!("distance from home {:.2}", distance);
                }
            }
            Notification::AltitudeUpdated { altitude } => println!("altitude {:.1} m", altitude),
            Notification::SpeedUpdated { ground_speed } => {
                println!("ground speed {:.1} m/s", ground_speed)
            }
            Notification::HomeUpdated { home } => {
                println!("home {:.7} {:.7} {:.1}", home.lat, home.lon, home.alt)
            }
            Notification::ModeChanged {
                vehicle_type,
                mode,
                is_armed,
            } => println!(
                "{} mode {} armed {}",
                vehicle_type,
                mode.map(|m| m.label()).unwrap_or("unknown"),
                is_armed
            ),
            Notification::ConnectionStateChanged(state) => println!("link {:?}", state),
        }
    }

    vehicle.disconnect().await;
    Ok(())
}
