//! # dronelink
//!
//! Session core for a single remote vehicle (copter, plane or rover) that
//! speaks MAVLink over a serial radio or UDP.
//!
//! The library keeps one link open, keeps the last known vehicle state up to
//! date, sends commands and tells you when a command was acknowledged,
//! rejected or never answered. It does not draw anything; a UI (or the
//! `monitor` demo, `cargo run --example monitor -- udp:14550`) sits on top.
//!
//! ## Communication
//!
//! After `connect` the transport is opened and the link waits for the first
//! heartbeat of the vehicle. Only then the state becomes `Connected` and the
//! configured telemetry stream rates are requested. Without a heartbeat
//! within the handshake timeout (5 seconds by default) the link fails.
//!
//! Every inbound frame updates the [`VehicleState`]. Interested code either
//! reads a snapshot at any time, registers an [`Observer`] or consumes the
//! notifications as a stream. Commands return a [`CommandHandle`], a future
//! that resolves once with the outcome.
//!
//! ### Example
//!
//! ```no_run
//! use dronelink::{ConnectionParams, LinkConfig, Notification, Vehicle};
//!
//! #[tokio::main]
//! async fn main() -> dronelink::Result<()> {
//!     let vehicle = Vehicle::new(LinkConfig::default());
//!     vehicle.subscribe(|n: &Notification| {
//!         if let Notification::AltitudeUpdated { altitude } = n {
//!             println!("altitude {:.1} m", altitude);
//!         }
//!     });
//!
//!     vehicle.connect(ConnectionParams::udp(14550))?.await?;
//!     vehicle.set_mode("Loiter")?.await?;
//!     vehicle.arm()?.await?;
//!
//!     println!("{:?}", vehicle.snapshot());
//!     vehicle.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::Stream;

mod connection;
mod dispatcher;
mod error;
mod event_bus;
mod mode;
mod telemetry;

pub mod config;
pub mod protocol;
pub mod transport;

pub use config::{ConnectionParams, LinkConfig, StreamChannel, StreamRates, TransportKind};
pub use connection::{ConnectHandle, ConnectionManager, ConnectionState};
pub use dispatcher::{Command, CommandDispatcher, CommandHandle};
pub use error::{Error, Result};
pub use event_bus::{EventBus, Notification, NotificationKind, Observer, SubscriptionId};
pub use mode::{VehicleMode, VehicleType};
pub use protocol::AckResult;
pub use telemetry::{HomePosition, Position, TelemetryStore, VehicleState};
pub use transport::{Connector, Link, LinkPeer, QueuedConnector, SystemConnector};

/// Connection, telemetry and commands for one vehicle
///
/// Must be created inside a Tokio runtime. All methods take `&self`, so the
/// vehicle can be shared behind an `Arc` between tasks.
#[derive(Debug)]
pub struct Vehicle {
    bus: EventBus,
    telemetry: Arc<TelemetryStore>,
    dispatcher: CommandDispatcher,
    connection: ConnectionManager,
}

impl Vehicle {
    /// Vehicle reachable over real serial ports and UDP sockets.
    pub fn new(config: LinkConfig) -> Vehicle {
        Self::with_connector(config, SystemConnector)
    }

    /// Vehicle whose transports are opened by `connector`, e.g. an
    /// in-process simulator.
    pub fn with_connector(config: LinkConfig, connector: impl Connector) -> Vehicle {
        let bus = EventBus::new();
        let telemetry = Arc::new(TelemetryStore::new(bus.clone()));
        let dispatcher = CommandDispatcher::new(config.command_timeout);
        let connection = ConnectionManager::new(
            config,
            connector,
            bus.clone(),
            Arc::clone(&telemetry),
            dispatcher.clone(),
        );
        Vehicle {
            bus,
            telemetry,
            dispatcher,
            connection,
        }
    }

    /// Opens the link. The returned handle resolves on the first heartbeat.
    pub fn connect(&self, params: ConnectionParams) -> Result<ConnectHandle> {
        self.connection.connect(params)
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }

    /// Consistent copy of the last known vehicle state.
    pub fn snapshot(&self) -> VehicleState {
        self.telemetry.snapshot()
    }

    pub fn watch_telemetry(&self) -> watch::Receiver<VehicleState> {
        self.telemetry.watch()
    }

    /// Flat distance between home and the vehicle, see
    /// [`VehicleState::distance_from_home`].
    pub fn distance_from_home(&self) -> Result<f64> {
        self.telemetry.distance_from_home()
    }

    pub fn subscribe(&self, observer: impl Observer) -> SubscriptionId {
        self.bus.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// All notifications from now on as a stream.
    pub fn notifications(&self) -> impl Stream<Item = Notification> {
        self.bus.stream()
    }

    /// convert the command into a frame and send it to the vehicle.
    pub fn send(&self, command: Command) -> Result<CommandHandle> {
        self.dispatcher.send(command)
    }

    /// Switch to the mode with the given label (or number), looked up in the
    /// mode table of the currently reported vehicle type.
    pub fn set_mode(&self, mode: &str) -> Result<CommandHandle> {
        let vehicle_type = self.telemetry.snapshot().vehicle_type;
        self.send(Command::set_mode(vehicle_type, mode)?)
    }

    pub fn arm(&self) -> Result<CommandHandle> {
        self.send(Command::Arm)
    }

    pub fn disarm(&self) -> Result<CommandHandle> {
        self.send(Command::Disarm)
    }

    pub fn set_stream_rates(&self, rates: StreamRates) -> Result<()> {
        self.dispatcher.set_stream_rates(rates)
    }

    /// Modes the current vehicle type supports, empty until the first
    /// heartbeat told us the type.
    pub fn available_modes(&self) -> &'static [VehicleMode] {
        self.telemetry.snapshot().vehicle_type.modes()
    }

    /// Commands still waiting for an acknowledgement.
    pub fn outstanding_commands(&self) -> usize {
        self.dispatcher.outstanding()
    }
}
