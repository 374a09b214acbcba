//! # Jeti EX Bus Encoder
//!
//! Channel frame with an explicit channel count, values in 1/8µs units
//! written little-endian, and a CRC16 trailer.
//!
//! Every channel frame (packet type 3) is followed by a fixed auxiliary
//! frame which the reference receiver expects on the wire. Its meaning is
//! undocumented; it is sent verbatim.

use super::{FrameEncoder, RcChannels, RC_NUM_CHANNELS};
use crate::crc::crc16_jeti;

/// Header byte of a channel frame
pub const JETI_HEADER: u8 = 0x3E;

/// Packet type for channel data
pub const JETI_PACKET_CHANNELS: u8 = 0x03;

/// Packet id byte
pub const JETI_PACKET_ID: u8 = 0x06;

/// Data identifier for channel values
pub const JETI_DATA_CHANNELS: u8 = 0x31;

/// Header bytes before the channel values
const JETI_HEADER_SIZE: usize = 6;

/// Trailing CRC16
const JETI_TRAILER_SIZE: usize = 2;

/// Fixed frame sent after every channel frame
pub static JETI_AUX_FRAME: [u8; 8] = [0x3D, 0x01, 0x08, 0x06, 0x3A, 0x00, 0x98, 0x81];

/// Jeti EX Bus frame encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct JetiEncoder;

impl FrameEncoder for JetiEncoder {
    const NAME: &'static str = "JETI";

    fn encode(&self, channels: &RcChannels, nchan: usize) -> Vec<u8> {
        let nchan = nchan.min(RC_NUM_CHANNELS);
        let size = JETI_HEADER_SIZE + 2 * nchan + JETI_TRAILER_SIZE;

        let mut frame = Vec::with_capacity(size);
        frame.push(JETI_HEADER);
        frame.push(JETI_PACKET_CHANNELS);
        frame.push(size as u8);
        frame.push(JETI_PACKET_ID);
        frame.push(JETI_DATA_CHANNELS);
        frame.push((2 * nchan) as u8);
        for &us in channels.iter().take(nchan) {
            frame.extend_from_slice(&us.wrapping_mul(8).to_le_bytes());
        }

        let crc = crc16_jeti(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn follow_up(&self, frame: &[u8]) -> Option<&'static [u8]> {
        (frame.get(1) == Some(&JETI_PACKET_CHANNELS)).then_some(&JETI_AUX_FRAME[..])
    }
}
