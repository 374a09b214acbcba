//! # MSP Flight-Controller Link
//!
//! Client side of the MultiWii Serial Protocol as spoken by INAV over the
//! SITL TCP port.
//!
//! This module handles:
//! - Encoding MSPv2 request frames (and v1/v2 frames of any direction for
//!   testing fake peers)
//! - Streaming decode of MSPv1 and MSPv2 replies from the same byte stream
//! - The startup handshake, mission upload and the steady-state run loop
//!
//! ## Wire formats
//!
//! ```text
//! v1: '$' 'M' dir len  cmd            payload  xor(len, cmd, payload)
//! v2: '$' 'X' dir flag cmd_lo cmd_hi len_lo len_hi payload  crc8(flag..payload)
//! ```
//!
//! `dir` is `<` for requests, `>` for replies and `!` for error replies.

pub mod codec;
pub mod handshake;
pub mod link;
pub mod mission;
pub mod status;

pub use codec::{encode_request, MspParser};
pub use handshake::FcInfo;
pub use link::{spawn_link, LinkCommand, LinkEvent, LinkSettings};
pub use mission::{Waypoint, WaypointAction};
pub use status::{LinkStatus, StatusTracker};

/// MSP API version query
pub const MSP_API_VERSION: u16 = 1;

/// Firmware identifier, e.g. `INAV`
pub const MSP_FC_VARIANT: u16 = 2;

/// Firmware semantic version
pub const MSP_FC_VERSION: u16 = 3;

/// Board identifier and target name
pub const MSP_BOARD_INFO: u16 = 4;

/// Build date, time and git revision
pub const MSP_BUILD_INFO: u16 = 5;

/// Craft name
pub const MSP_NAME: u16 = 10;

/// Mode activation conditions
pub const MSP_MODE_RANGES: u16 = 34;

/// Receiver channel order
pub const MSP_RX_MAP: u16 = 64;

/// `;`-separated list of the firmware's box names
pub const MSP_BOXNAMES: u16 = 116;

/// Push link RSSI to the flight controller
pub const MSP_SET_TX_INFO: u16 = 186;

/// Raw RC channel values
pub const MSP_SET_RAW_RC: u16 = 200;

/// Store one mission waypoint
pub const MSP_SET_WP: u16 = 209;

/// Read one named setting
pub const MSP2_COMMON_SETTING: u16 = 0x1003;

/// Extended INAV status (arming flags, active boxes)
pub const MSP2_INAV_STATUS: u16 = 0x2000;

/// Largest payload accepted from the wire
pub const MSP_MAX_PAYLOAD: usize = 4096;

/// Setting whose value decides the yaw-bypass arming behaviour
pub const ARMING_SAFETY_SETTING: &str = "nav_extra_arming_safety";

/// Frame direction byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `<`, host to flight controller
    Request,
    /// `>`, flight controller to host
    Reply,
    /// `!`, the flight controller rejected the command
    Error,
}

impl Direction {
    /// Wire byte for this direction
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::Request => b'<',
            Direction::Reply => b'>',
            Direction::Error => b'!',
        }
    }

    /// Parse a direction byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'<' => Some(Direction::Request),
            b'>' => Some(Direction::Reply),
            b'!' => Some(Direction::Error),
            _ => None,
        }
    }
}

/// One decoded MSP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspFrame {
    /// Command id (v1 ids widened to 16 bits)
    pub cmd: u16,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Direction byte the frame carried
    pub direction: Direction,
}

impl MspFrame {
    /// A frame is valid when the flight controller accepted the command
    pub fn is_ok(&self) -> bool {
        self.direction == Direction::Reply
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for zero-length payloads
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
