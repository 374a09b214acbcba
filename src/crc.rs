//! # Checksums
//!
//! CRC8-DVB-S2 (MSP v2 and CRSF) and the CCITT-style CRC16 used by the
//! Jeti EX Bus receiver.
//!
//! **CRC8 polynomial**: 0xD5 (x^8 + x^7 + x^6 + x^4 + x^2 + 1), initial value 0x00

/// CRC-8-DVB-S2 polynomial
const CRC8_POLY: u8 = 0xD5;

/// Precomputed CRC8 lookup table for fast calculation
const CRC8_TABLE: [u8; 256] = generate_crc8_table();

/// Generate CRC8 lookup table at compile time
const fn generate_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Fold one byte into a running CRC8-DVB-S2 value.
///
/// The streaming MSP parser calls this once per received byte.
#[inline]
pub fn crc8_dvb_s2_update(crc: u8, byte: u8) -> u8 {
    CRC8_TABLE[(crc ^ byte) as usize]
}

/// Calculate CRC8-DVB-S2 checksum over a byte slice
///
/// # Examples
///
/// ```
/// use fl2sitl::crc::crc8_dvb_s2;
///
/// assert_eq!(crc8_dvb_s2(b"123456789"), 0xBC);
/// ```
pub fn crc8_dvb_s2(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, &byte| crc8_dvb_s2_update(crc, byte))
}

/// Fold one byte into the Jeti CRC16.
///
/// Nibble-swapping CCITT update (reflected polynomial 0x8408); equivalent
/// to CRC-16/KERMIT when started from zero.
#[inline]
pub fn crc16_ccitt_update(crc: u16, byte: u8) -> u16 {
    let mut d = byte ^ (crc as u8);
    d ^= d << 4;
    ((u16::from(d) << 8) | (crc >> 8)) ^ u16::from(d >> 4) ^ (u16::from(d) << 3)
}

/// CRC16 over a complete Jeti frame body (everything but the trailer).
pub fn crc16_jeti(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &byte| crc16_ccitt_update(crc, byte))
}
