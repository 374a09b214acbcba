//! # IBUS Encoder
//!
//! FlySky IBUS servo frame. Channels are carried as raw microseconds in
//! 12-bit little-endian slots; channels beyond the 14th are spread over
//! the high nibbles of the first slots.

use super::{FrameEncoder, RcChannels, RC_NUM_CHANNELS};

/// IBUS frame size (and first byte)
pub const IBUS_FRAME_SIZE: usize = 32;

/// Command byte for servo frames
pub const IBUS_COMMAND_SERVO: u8 = 0x40;

/// Number of full 12-bit slots
pub const IBUS_MAX_SLOT: usize = 14;

/// Checksum seed
pub const IBUS_CRC_BASE: u16 = 0xFFFF;

/// IBUS frame encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct IbusEncoder;

impl IbusEncoder {
    fn pack_channels(channels: &RcChannels, buf: &mut [u8; IBUS_FRAME_SIZE]) {
        let mut k = 2;
        for &us in channels.iter().take(IBUS_MAX_SLOT) {
            buf[k] = (us & 0xFF) as u8;
            buf[k + 1] = ((us >> 8) & 0x0F) as u8;
            k += 2;
        }

        let mut k = 3;
        for &us in channels.iter().take(RC_NUM_CHANNELS).skip(IBUS_MAX_SLOT) {
            buf[k] |= ((us & 0x0F) << 4) as u8;
            buf[k + 2] |= (us & 0xF0) as u8;
            buf[k + 4] |= (((us >> 8) & 0x0F) << 4) as u8;
            k += 6;
        }
    }
}

/// `0xFFFF` minus the sum of every byte before the trailer.
pub fn ibus_checksum(body: &[u8]) -> u16 {
    body.iter()
        .fold(IBUS_CRC_BASE, |crc, &b| crc.wrapping_sub(u16::from(b)))
}

impl FrameEncoder for IbusEncoder {
    const NAME: &'static str = "IBUS";

    fn encode(&self, channels: &RcChannels, _nchan: usize) -> Vec<u8> {
        let mut buf = [0u8; IBUS_FRAME_SIZE];
        buf[0] = IBUS_FRAME_SIZE as u8;
        buf[1] = IBUS_COMMAND_SERVO;
        Self::pack_channels(channels, &mut buf);

        let crc = ibus_checksum(&buf[..IBUS_FRAME_SIZE - 2]);
        buf[IBUS_FRAME_SIZE - 2..].copy_from_slice(&crc.to_le_bytes());
        buf.to_vec()
    }
}
