//! Runtime link configuration.
//!
//! These types describe how to reach the vehicle and how the session
//! behaves once connected. They are built by the caller and handed in;
//! the core never reads configuration files.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Baud rate of the common 3DR/SiK telemetry radios.
pub const DEFAULT_USB_BAUD_RATE: u32 = 57_600;
/// Port a ground station conventionally listens on.
pub const DEFAULT_UDP_PORT: u16 = 14_550;

const STANDARD_BAUD_RATES: [u32; 12] = [
    1_200, 2_400, 4_800, 9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800, 500_000,
    921_600,
];

/// Physical link to the vehicle, with the fields each kind requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// USB / serial telemetry radio.
    Serial { device: String, baud_rate: u32 },
    /// UDP server socket the vehicle (or a router) sends to.
    Network { port: u16 },
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial { device, baud_rate } => {
                write!(f, "serial:{}:{}", device, baud_rate)
            }
            TransportKind::Network { port } => write!(f, "udp:{}", port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub transport: TransportKind,
}

impl ConnectionParams {
    pub fn usb(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            transport: TransportKind::Serial {
                device: device.into(),
                baud_rate,
            },
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            transport: TransportKind::Network { port },
        }
    }

    /// Checks the kind specific fields. Called by `connect` before any state
    /// changes.
    pub fn validate(&self) -> Result<()> {
        match &self.transport {
            TransportKind::Serial { device, .. } if device.trim().is_empty() => {
                Err(Error::invalid_parameter("serial device path is empty"))
            }
            TransportKind::Serial { baud_rate, .. } if !STANDARD_BAUD_RATES.contains(baud_rate) => {
                Err(Error::invalid_parameter(format!(
                    "unsupported baud rate {}",
                    baud_rate
                )))
            }
            TransportKind::Network { port: 0 } => {
                Err(Error::invalid_parameter("network port must not be 0"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.transport.fmt(f)
    }
}

/// Parses `udp`, `udp:<port>`, `serial:<device>` or `serial:<device>:<baud>`
/// (`usb` is accepted as an alias of `serial`).
impl FromStr for ConnectionParams {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = s.split_once(':').unwrap_or((s, ""));
        let params = match kind.to_ascii_lowercase().as_str() {
            "udp" if rest.is_empty() => ConnectionParams::udp(DEFAULT_UDP_PORT),
            "udp" => {
                let port = rest
                    .parse::<u16>()
                    .map_err(|_| Error::invalid_parameter(format!("invalid port {:?}", rest)))?;
                ConnectionParams::udp(port)
            }
            "serial" | "usb" => match rest.rsplit_once(':') {
                Some((device, baud)) if baud.chars().all(|c| c.is_ascii_digit()) => {
                    let baud = baud.parse::<u32>().map_err(|_| {
                        Error::invalid_parameter(format!("invalid baud rate {:?}", baud))
                    })?;
                    ConnectionParams::usb(device, baud)
                }
                _ => ConnectionParams::usb(rest, DEFAULT_USB_BAUD_RATE),
            },
            other => {
                return Err(Error::invalid_parameter(format!(
                    "unknown transport {:?}",
                    other
                )))
            }
        };
        params.validate()?;
        Ok(params)
    }
}

/// Telemetry groups the vehicle can be asked to stream. The discriminant is
/// the stream id sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum StreamChannel {
    RawSensors = 1,
    ExtendedStatus = 2,
    RcChannels = 3,
    RawController = 4,
    Position = 6,
    Extra1 = 10,
    Extra2 = 11,
    Extra3 = 12,
}

impl StreamChannel {
    pub const ALL: [StreamChannel; 8] = [
        StreamChannel::RawSensors,
        StreamChannel::ExtendedStatus,
        StreamChannel::RcChannels,
        StreamChannel::RawController,
        StreamChannel::Position,
        StreamChannel::Extra1,
        StreamChannel::Extra2,
        StreamChannel::Extra3,
    ];
}

/// Requested update frequency (Hz) per telemetry channel.
///
/// Sending consumes the value, so a rate set cannot change after it went
/// out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRates {
    rates: BTreeMap<StreamChannel, u16>,
}

impl StreamRates {
    pub const DEFAULT_HZ: u16 = 2;

    /// same rate for every channel
    pub fn uniform(hz: u16) -> Self {
        Self {
            rates: StreamChannel::ALL.iter().map(|c| (*c, hz)).collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            rates: BTreeMap::new(),
        }
    }

    pub fn with(mut self, channel: StreamChannel, hz: u16) -> Self {
        self.rates.insert(channel, hz);
        self
    }

    pub fn get(&self, channel: StreamChannel) -> Option<u16> {
        self.rates.get(&channel).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamChannel, u16)> + '_ {
        self.rates.iter().map(|(c, hz)| (*c, *hz))
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl Default for StreamRates {
    fn default() -> Self {
        Self::uniform(Self::DEFAULT_HZ)
    }
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long to wait for the first heartbeat after opening the transport.
    pub handshake_timeout: Duration,
    /// How long a command may stay unacknowledged.
    pub command_timeout: Duration,
    /// Requested from the vehicle as soon as the link is up.
    pub stream_rates: StreamRates,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(3),
            stream_rates: StreamRates::default(),
        }
    }
}
