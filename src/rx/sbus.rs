//! # SBUS Encoder
//!
//! 25-byte frame: start byte, 22 bytes of packed channels, flag byte, end byte.

use super::packing::pack_pulse_widths;
use super::{FrameEncoder, RcChannels};

/// SBUS start byte
pub const SBUS_START_BYTE: u8 = 0x0F;

/// Flag byte sent with every frame (digital channels 17/18 set)
pub const SBUS_FLAGS: u8 = 0x03;

/// SBUS end byte
pub const SBUS_END_BYTE: u8 = 0x00;

/// Total SBUS frame size
pub const SBUS_FRAME_SIZE: usize = 25;

/// SBUS frame encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct SbusEncoder;

impl FrameEncoder for SbusEncoder {
    const NAME: &'static str = "SBUS";

    fn encode(&self, channels: &RcChannels, _nchan: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(SBUS_FRAME_SIZE);
        frame.push(SBUS_START_BYTE);
        frame.extend_from_slice(&pack_pulse_widths(channels));
        frame.push(SBUS_FLAGS);
        frame.push(SBUS_END_BYTE);
        frame
    }
}
