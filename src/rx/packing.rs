//! # 11-bit Channel Packing
//!
//! Shared bit packing for SBUS and CRSF: 16 channels, 11 bits each,
//! packed as a continuous LSB-first bitstream into 22 bytes.

use super::{RcChannels, RC_NUM_CHANNELS};

/// Packed payload size (16 channels × 11 bits)
pub const PACKED_CHANNELS_SIZE: usize = 22;

/// Largest 11-bit channel value
pub const PACKED_VALUE_MAX: u16 = 2047;

/// Lowest pulse width represented on the 11-bit scale (µs)
pub const PULSE_OFFSET_US: u16 = 880;

/// Rescale a pulse width in microseconds to the 11-bit receiver scale.
///
/// `(us - 880) * 8 / 5`, clamped to 0..=2047, so 1500µs maps to 992.
pub fn scale_to_11bit(us: u16) -> u16 {
    let scaled = u32::from(us.saturating_sub(PULSE_OFFSET_US)) * 8 / 5;
    scaled.min(u32::from(PACKED_VALUE_MAX)) as u16
}

/// Pack 16 channels into the 22-byte payload
///
/// # Algorithm
///
/// Each channel is 11 bits (0-2047). Channels are packed LSB-first:
/// ```text
/// Byte 0: Ch1[0:7]
/// Byte 1: Ch1[8:10] | Ch2[0:4]
/// Byte 2: Ch2[5:10] | Ch3[0:1]
/// ...
/// ```
pub fn pack_channels(values: &[u16; RC_NUM_CHANNELS]) -> [u8; PACKED_CHANNELS_SIZE] {
    let mut payload = [0u8; PACKED_CHANNELS_SIZE];
    let mut bit_index = 0;

    for &channel in values.iter() {
        let value = channel.min(PACKED_VALUE_MAX);

        for bit in 0..11 {
            if (value >> bit) & 1 == 1 {
                payload[bit_index / 8] |= 1 << (bit_index % 8);
            }
            bit_index += 1;
        }
    }

    payload
}

/// Rescale then pack a frame of pulse widths.
pub fn pack_pulse_widths(channels: &RcChannels) -> [u8; PACKED_CHANNELS_SIZE] {
    let mut scaled = [0u16; RC_NUM_CHANNELS];
    for (out, &us) in scaled.iter_mut().zip(channels.iter()) {
        *out = scale_to_11bit(us);
    }
    pack_channels(&scaled)
}


#[cfg(test)]
mod tests {
    use super::reference::*;
    use super::*;

    #[test]
    fn test_scale_known_points() {
        assert_eq!(scale_to_11bit(880), 0);
        assert_eq!(scale_to_11bit(1000), 192);
        assert_eq!(scale_to_11bit(1500), 992);
        assert_eq!(scale_to_11bit(2000), 1792);
    }

    #[test]
    fn test_scale_clamps() {
        assert_eq!(scale_to_11bit(0), 0);
        assert_eq!(scale_to_11bit(879), 0);
        assert_eq!(scale_to_11bit(2880), PACKED_VALUE_MAX);
        assert_eq!(scale_to_11bit(u16::MAX), PACKED_VALUE_MAX);
    }

    #[test]
    fn test_pack_all_zeros() {
        assert_eq!(pack_channels(&[0u16; 16]), [0u8; 22]);
    }

    #[test]
    fn test_pack_all_max() {
        assert_eq!(pack_channels(&[PACKED_VALUE_MAX; 16]), [0xFFu8; 22]);
    }

    #[test]
    fn test_pack_single_channel() {
        let mut values = [0u16; 16];
        values[0] = 0x7FF;
        let payload = pack_channels(&values);
        assert_eq!(payload[0], 0xFF);
        assert_eq!(payload[1], 0x07);
        assert!(payload[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pack_matches_reference_unpacker() {
        let values = [
            0, 1, 2, 1023, 1024, 2047, 7, 100, 1500, 999, 3, 2046, 512, 256, 128, 64,
        ];
        assert_eq!(unpack_channels(&pack_channels(&values)), values);
    }

    #[test]
    fn test_pulse_width_round_trip_within_quantization() {
        // One 11-bit step is 0.625µs
        for us in PULSE_OFFSET_US..=2159 {
            let mut channels = [1500u16; 16];
            channels[(us as usize) % 16] = us;
            let decoded = unpack_channels(&pack_pulse_widths(&channels));
            for (i, &v) in decoded.iter().enumerate() {
                let diff = (to_pulse_width(v) - f64::from(channels[i])).abs();
                assert!(diff < 0.625 + f64::EPSILON, "ch{} {}µs -> {}", i, channels[i], v);
            }
        }
    }
}
