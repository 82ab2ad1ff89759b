//! MAVLink framing and the subset of messages the session understands.
//!
//! Frames are parsed and written by the `mavlink` crate (common dialect).
//! Outbound frames are always MAVLink 2; inbound frames may be either
//! version, radios and older autopilots still send MAVLink 1.
//!
//! On a serial line frames arrive in arbitrary chunks, possibly with line
//! noise in between, so [`FrameDecoder`] buffers bytes, re-synchronises on
//! the start markers and hands each complete frame to the crate's reader.

use std::fmt;
use std::io::{self, Cursor};

use mavlink::common::{GpsFixType, MavAutopilot, MavModeFlag};
use mavlink::peek_reader::PeekReader;
use mavlink::error::MessageReadError;
use thiserror::Error;

pub use mavlink::common::MavMessage;
pub use mavlink::MavHeader;

use crate::mode::VehicleType;

/// Ground control station ids used in the header of every outbound frame.
pub const GCS_SYSTEM_ID: u8 = 255;
pub const GCS_COMPONENT_ID: u8 = 190;

pub const STX_V1: u8 = 0xfe;
pub const STX_V2: u8 = 0xfd;
const HEADER_LEN_V1: usize = 6;
const HEADER_LEN_V2: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
/// incompat_flags bit of a signed MAVLink 2 frame
const IFLAG_SIGNED: u8 = 0x01;

/// Outcome reported by the vehicle in a command acknowledgement, numbered
/// like `MAV_RESULT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckResult {
    Accepted = 0,
    TemporarilyRejected = 1,
    Denied = 2,
    Unsupported = 3,
    Failed = 4,
    /// the command keeps running, a final ack follows
    InProgress = 5,
    Cancelled = 6,
}

impl From<u8> for AckResult {
    fn from(value: u8) -> AckResult {
        match value {
            0 => AckResult::Accepted,
            1 => AckResult::TemporarilyRejected,
            2 => AckResult::Denied,
            3 => AckResult::Unsupported,
            5 => AckResult::InProgress,
            6 => AckResult::Cancelled,
            _ => AckResult::Failed,
        }
    }
}

impl fmt::Display for AckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AckResult::Accepted => "accepted",
            AckResult::TemporarilyRejected => "temporarily rejected",
            AckResult::Denied => "denied",
            AckResult::Unsupported => "unsupported",
            AckResult::Failed => "failed",
            AckResult::InProgress => "in progress",
            AckResult::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// What an inbound message means for the session.
///
/// Messages that matter neither for telemetry nor for command tracking have
/// no event and are dropped by [`Event::from_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Heartbeat {
        vehicle_type: VehicleType,
        custom_mode: u32,
        armed: bool,
    },
    /// GPS_RAW_INT
    Position { lat: f64, lon: f64, fix_type: u8 },
    /// GLOBAL_POSITION_INT, height above home in meters
    Altitude { altitude: f32 },
    /// VFR_HUD
    Speed { ground_speed: f32 },
    HomePosition { lat: f64, lon: f64, alt: f32 },
    CommandAck { command: u32, result: AckResult },
}

fn from_e7(value: i32) -> f64 {
    value as f64 / 1e7
}

impl Event {
    pub fn from_message(message: &MavMessage) -> Option<Event> {
        let event = match message {
            // ground stations announce themselves with an invalid autopilot
            MavMessage::HEARTBEAT(data) if data.autopilot == MavAutopilot::MAV_AUTOPILOT_INVALID => {
                return None
            }
            MavMessage::HEARTBEAT(data) => Event::Heartbeat {
                vehicle_type: VehicleType::from(data.mavtype as u8),
                custom_mode: data.custom_mode,
                armed: data
                    .base_mode
                    .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
            },
            MavMessage::GPS_RAW_INT(data) => Event::Position {
                lat: from_e7(data.lat),
                lon: from_e7(data.lon),
                fix_type: data.fix_type as u8,
            },
            MavMessage::GLOBAL_POSITION_INT(data) => Event::Altitude {
                altitude: data.relative_alt as f32 / 1000.0,
            },
            MavMessage::VFR_HUD(data) => Event::Speed {
                ground_speed: data.groundspeed,
            },
            MavMessage::HOME_POSITION(data) => Event::HomePosition {
                lat: from_e7(data.latitude),
                lon: from_e7(data.longitude),
                alt: data.altitude as f32 / 1000.0,
            },
            MavMessage::COMMAND_ACK(data) => Event::CommandAck {
                command: data.command as u32,
                result: AckResult::from(data.result as u8),
            },
            _ => return None,
        };
        Some(event)
    }
}

/// A 2D fix or better yields a usable horizontal position.
pub fn is_usable_fix(fix_type: u8) -> bool {
    fix_type >= GpsFixType::GPS_FIX_TYPE_2D_FIX as u8
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is {len} bytes, shorter than its header announces")]
    TooShort { len: usize },
    #[error("frame checksum mismatch")]
    Checksum,
    #[error("unsupported message: {0}")]
    Unsupported(String),
}

impl From<MessageReadError> for DecodeError {
    fn from(e: MessageReadError) -> Self {
        match e {
            // on a complete frame the reader only runs dry when the crc failed
            MessageReadError::Io(_) => DecodeError::Checksum,
            MessageReadError::Parse(e) => DecodeError::Unsupported(format!("{e:?}")),
        }
    }
}

/// A message together with the header it travelled with.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MavHeader,
    pub message: MavMessage,
}

impl Frame {
    pub fn new(header: MavHeader, message: MavMessage) -> Frame {
        Frame { header, message }
    }

    /// Frame sent by this ground station with the given sequence number.
    pub fn outbound(sequence: u8, message: MavMessage) -> Frame {
        Frame::new(
            MavHeader {
                system_id: GCS_SYSTEM_ID,
                component_id: GCS_COMPONENT_ID,
                sequence,
            },
            message,
        )
    }

    /// serialise as MAVLink 2
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::with_capacity(280));
        mavlink::write_v2_msg(&mut buf, self.header, &self.message)
            .map_err(|e| io::Error::other(format!("{e:?}")))?;
        Ok(buf.into_inner())
    }

    /// Decodes the first frame of `data`, e.g. a single UDP datagram.
    pub fn decode(data: &[u8]) -> Result<Frame, DecodeError> {
        let mut decoder = FrameDecoder::new();
        decoder.push(data);
        decoder
            .next_frame()
            .unwrap_or(Err(DecodeError::TooShort { len: data.len() }))
    }
}

fn frame_len(buffer: &[u8]) -> Option<usize> {
    match buffer {
        [STX_V2, len, flags, ..] => {
            let signature = if flags & IFLAG_SIGNED != 0 {
                SIGNATURE_LEN
            } else {
                0
            };
            Some(HEADER_LEN_V2 + *len as usize + CHECKSUM_LEN + signature)
        }
        [STX_V1, len, ..] => Some(HEADER_LEN_V1 + *len as usize + CHECKSUM_LEN),
        _ => None,
    }
}

/// Turns an arbitrary chunked byte stream into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, `None` when more bytes are needed.
    ///
    /// A corrupted frame yields an `Err` and is dropped as a whole, so
    /// callers should keep calling until `None`.
    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        match self
            .buffer
            .iter()
            .position(|b| *b == STX_V1 || *b == STX_V2)
        {
            Some(0) => (),
            Some(skip) => {
                self.buffer.drain(..skip);
            }
            None => {
                self.buffer.clear();
                return None;
            }
        }

        let total = frame_len(&self.buffer)?;
        if self.buffer.len() < total {
            return None;
        }

        let mut reader = PeekReader::new(Cursor::new(&self.buffer[..total]));
        let result = if self.buffer[0] == STX_V2 {
            mavlink::read_v2_msg::<MavMessage, _>(&mut reader)
        } else {
            mavlink::read_v1_msg::<MavMessage, _>(&mut reader)
        };

        match result {
            Ok((header, message)) => {
                self.buffer.drain(..total);
                Some(Ok(Frame { header, message }))
            }
            Err(e) => {
                self.buffer.drain(..total);
                Some(Err(DecodeError::from(e)))
            }
        }
    }
}

/// Vehicle-side messages for tests.
#[cfg(test)]
pub(crate) mod testing {
    use mavlink::common::{
        MavCmd, MavResult, MavState, MavType, COMMAND_ACK_DATA, GLOBAL_POSITION_INT_DATA,
        GPS_RAW_INT_DATA, HEARTBEAT_DATA, HOME_POSITION_DATA, VFR_HUD_DATA,
    };

    use super::*;

    pub const VEHICLE_SYSTEM_ID: u8 = 1;
    pub const VEHICLE_COMPONENT_ID: u8 = 1;

    pub fn vehicle_frame(message: MavMessage) -> Frame {
        Frame::new(
            MavHeader {
                system_id: VEHICLE_SYSTEM_ID,
                component_id: VEHICLE_COMPONENT_ID,
                sequence: 0,
            },
            message,
        )
    }

    pub fn heartbeat(mavtype: MavType, custom_mode: u32, armed: bool) -> MavMessage {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    pub fn copter_heartbeat(custom_mode: u32, armed: bool) -> MavMessage {
        heartbeat(MavType::MAV_TYPE_QUADROTOR, custom_mode, armed)
    }

    pub fn gps(lat: f64, lon: f64, fix_type: GpsFixType) -> MavMessage {
        MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
            time_usec: 0,
            lat: (lat * 1e7).round() as i32,
            lon: (lon * 1e7).round() as i32,
            alt: 0,
            eph: u16::MAX,
            epv: u16::MAX,
            vel: 0,
            cog: 0,
            fix_type,
            satellites_visible: 10,
            alt_ellipsoid: 0,
            h_acc: 0,
            v_acc: 0,
            vel_acc: 0,
            hdg_acc: 0,
            yaw: 0,
        })
    }

    pub fn altitude(meters: f32) -> MavMessage {
        MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 0,
            lat: 0,
            lon: 0,
            alt: 0,
            relative_alt: (meters * 1000.0) as i32,
            vx: 0,
            vy: 0,
            vz: 0,
            hdg: 0,
        })
    }

    pub fn ground_speed(speed: f32) -> MavMessage {
        MavMessage::VFR_HUD(VFR_HUD_DATA {
            airspeed: speed,
            groundspeed: speed,
            alt: 0.0,
            climb: 0.0,
            heading: 0,
            throttle: 0,
        })
    }

    pub fn home(lat: f64, lon: f64, alt: f32) -> MavMessage {
        MavMessage::HOME_POSITION(HOME_POSITION_DATA {
            latitude: (lat * 1e7).round() as i32,
            longitude: (lon * 1e7).round() as i32,
            altitude: (alt * 1000.0) as i32,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            q: [1.0, 0.0, 0.0, 0.0],
            approach_x: 0.0,
            approach_y: 0.0,
            approach_z: 0.0,
            time_usec: 0,
        })
    }

    pub fn command_ack(command: MavCmd, result: MavResult) -> MavMessage {
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command,
            result,
            progress: 0,
            result_param2: 0,
            target_system: GCS_SYSTEM_ID,
            target_component: GCS_COMPONENT_ID,
        })
    }

    pub fn encoded(message: MavMessage) -> Vec<u8> {
        vehicle_frame(message).encode().unwrap()
    }
}
