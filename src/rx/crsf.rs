//! # CRSF Encoder
//!
//! RC channels packed frame for Crossfire / ExpressLRS receivers.

use super::packing::{pack_pulse_widths, PACKED_CHANNELS_SIZE};
use super::{FrameEncoder, RcChannels};
use crate::crc::crc8_dvb_s2;

/// CRSF device address of the flight controller (also the sync byte)
pub const CRSF_ADDRESS_FLIGHT_CONTROLLER: u8 = 0xC8;

/// RC Channels packet type
pub const CRSF_FRAMETYPE_RC_CHANNELS_PACKED: u8 = 0x16;

/// RC channels frame length (type + payload + crc)
pub const CRSF_RC_CHANNELS_FRAME_LENGTH: u8 = 0x18; // 24 bytes

/// Complete frame: address + length + type + payload + crc
pub const CRSF_RC_FRAME_SIZE: usize = 26;

/// CRSF frame encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct CrsfEncoder;

impl FrameEncoder for CrsfEncoder {
    const NAME: &'static str = "CRSF";

    fn encode(&self, channels: &RcChannels, _nchan: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(CRSF_RC_FRAME_SIZE);
        frame.push(CRSF_ADDRESS_FLIGHT_CONTROLLER);
        frame.push(CRSF_RC_CHANNELS_FRAME_LENGTH);
        frame.push(CRSF_FRAMETYPE_RC_CHANNELS_PACKED);
        frame.extend_from_slice(&pack_pulse_widths(channels));

        // CRC covers Type + Payload
        let crc = crc8_dvb_s2(&frame[2..3 + PACKED_CHANNELS_SIZE]);
        frame.push(crc);
        frame
    }
}
