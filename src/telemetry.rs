use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::trace;

use crate::error::{Error, Result};
use crate::event_bus::{EventBus, Notification};
use crate::mode::{VehicleMode, VehicleType};
use crate::protocol::{is_usable_fix, Event};

/// Horizontal vehicle position in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

/// Reference point for distance and return calculations, usually the
/// takeoff location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomePosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

///
/// Last known state of the vehicle. Every field holds the last value
/// received for it, or nothing if it was never reported.
///
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VehicleState {
    pub position: Option<Position>,
    /// meters
    pub altitude: Option<f64>,
    /// m/s
    pub ground_speed: Option<f64>,
    pub home: Option<HomePosition>,
    pub vehicle_type: VehicleType,
    pub mode: Option<VehicleMode>,
    pub is_armed: bool,
    pub is_gps_valid: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl VehicleState {
    /// Straight-line distance between home and the vehicle, treating
    /// (lat, lon, alt) as a flat 3-vector.
    ///
    /// Degrees and meters are mixed without any geodesic correction. A
    /// missing altitude counts as 0.
    pub fn distance_from_home(&self) -> Result<f64> {
        match (self.position, self.home) {
            (Some(position), Some(home)) if self.is_gps_valid => {
                let dx = home.lat - position.lat;
                let dy = home.lon - position.lon;
                let dz = home.alt - self.altitude.unwrap_or(0.0);
                Ok((dx * dx + dy * dy + dz * dz).sqrt())
            }
            _ => Err(Error::PositionUnavailable),
        }
    }
}

/// Holds the live [`VehicleState`].
///
/// Written only by inbound message processing, read by anyone. Each update
/// replaces the whole state at once, so readers never see half an update.
#[derive(Debug)]
pub struct TelemetryStore {
    state: watch::Sender<VehicleState>,
    bus: EventBus,
}

impl TelemetryStore {
    pub fn new(bus: EventBus) -> Self {
        let (state, _) = watch::channel(VehicleState::default());
        Self { state, bus }
    }

    /// applies the event to the current state.
    /// Events that carry no telemetry (acks) are ignored. One notification
    /// is published per field group that changed.
    pub fn apply_event(&self, event: &Event) {
        let mut touched: Vec<Notification> = Vec::new();

        self.state.send_if_modified(|state| match *event {
            Event::Heartbeat {
                vehicle_type,
                custom_mode,
                armed,
            } => {
                state.last_heartbeat = Some(Utc::now());
                let mode = vehicle_type.mode(custom_mode);
                // heartbeats repeat the status every second, only report changes
                if (state.vehicle_type, state.mode, state.is_armed) != (vehicle_type, mode, armed)
                {
                    state.vehicle_type = vehicle_type;
                    state.mode = mode;
                    state.is_armed = armed;
                    touched.push(Notification::ModeChanged {
                        vehicle_type,
                        mode,
                        is_armed: armed,
                    });
                }
                true
            }
            Event::Position { lat, lon, fix_type } => {
                let position = Position { lat, lon };
                state.position = Some(position);
                state.is_gps_valid = is_usable_fix(fix_type);
                touched.push(Notification::PositionUpdated {
                    position,
                    is_gps_valid: state.is_gps_valid,
                });
                true
            }
            Event::Altitude { altitude } => {
                state.altitude = Some(altitude as f64);
                touched.push(Notification::AltitudeUpdated {
                    altitude: altitude as f64,
                });
                true
            }
            Event::Speed { ground_speed } => {
                state.ground_speed = Some(ground_speed as f64);
                touched.push(Notification::SpeedUpdated {
                    ground_speed: ground_speed as f64,
                });
                true
            }
            Event::HomePosition { lat, lon, alt } => {
                let home = HomePosition {
                    lat,
                    lon,
                    alt: alt as f64,
                };
                state.home = Some(home);
                touched.push(Notification::HomeUpdated { home });
                true
            }
            Event::CommandAck { command, .. } => {
                trace!(command, "acknowledgement carries no telemetry");
                false
            }
        });

        for notification in touched {
            self.bus.publish(notification);
        }
    }

    /// copy of the current state
    pub fn snapshot(&self) -> VehicleState {
        self.state.borrow().clone()
    }

    pub fn distance_from_home(&self) -> Result<f64> {
        self.state.borrow().distance_from_home()
    }

    /// Receiver that is marked changed on every update.
    pub fn watch(&self) -> watch::Receiver<VehicleState> {
        self.state.subscribe()
    }
}
