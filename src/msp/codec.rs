//! # MSP Frame Codec
//!
//! Outbound frame encoding and an incremental inbound parser.
//!
//! The parser is a byte-at-a-time state machine so that frames split
//! across socket reads decode identically to frames read whole.

use tracing::warn;

use super::{Direction, MspFrame, MSP_MAX_PAYLOAD};
use crate::crc::{crc8_dvb_s2, crc8_dvb_s2_update};

/// Frame preamble
pub const MSP_PREAMBLE: u8 = b'$';

/// Protocol marker for MSPv1
pub const MSP_V1_MARKER: u8 = b'M';

/// Protocol marker for MSPv2
pub const MSP_V2_MARKER: u8 = b'X';

/// Fixed bytes in a v2 frame besides the payload
pub const MSP_V2_OVERHEAD: usize = 9;

/// Encode an MSPv2 request (`$X<`)
///
/// # Arguments
///
/// * `cmd` - 16-bit command id
/// * `payload` - Request payload (may be empty)
///
/// # Returns
///
/// * `Vec<u8>` - Complete frame, CRC8-DVB-S2 over flags, id, length and payload
///
/// # Examples
///
/// ```
/// use fl2sitl::msp::encode_request;
///
/// let frame = encode_request(0x2000, &[]);
/// assert_eq!(frame, [0x24, 0x58, 0x3C, 0x00, 0x00, 0x20, 0x00, 0x00, 0x32]);
/// ```
pub fn encode_request(cmd: u16, payload: &[u8]) -> Vec<u8> {
    encode_v2_frame(Direction::Request, cmd, payload)
}

/// Encode an MSPv2 frame with any direction byte
pub fn encode_v2_frame(direction: Direction, cmd: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MSP_V2_OVERHEAD + payload.len());
    frame.push(MSP_PREAMBLE);
    frame.push(MSP_V2_MARKER);
    frame.push(direction.as_byte());
    frame.push(0); // flags
    frame.extend_from_slice(&cmd.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = crc8_dvb_s2(&frame[3..]);
    frame.push(crc);
    frame
}

/// Encode an MSPv1 frame (XOR checksum, 8-bit id and length)
///
/// Payloads longer than 255 bytes are truncated.
pub fn encode_v1_frame(direction: Direction, cmd: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(u8::MAX as usize)];
    let len = payload.len() as u8;

    let mut frame = Vec::with_capacity(6 + payload.len());
    frame.push(MSP_PREAMBLE);
    frame.push(MSP_V1_MARKER);
    frame.push(direction.as_byte());
    frame.push(len);
    frame.push(cmd);
    frame.extend_from_slice(payload);

    let checksum = payload.iter().fold(len ^ cmd, |acc, &b| acc ^ b);
    frame.push(checksum);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Marker,
    V1Direction,
    V1Length,
    V1Command,
    V1Payload,
    V1Checksum,
    V2Direction,
    V2Flags,
    V2CommandLo,
    V2CommandHi,
    V2LengthLo,
    V2LengthHi,
    V2Payload,
    V2Checksum,
}

/// Incremental MSP v1/v2 frame parser
///
/// State persists between calls; feed bytes as they arrive.
#[derive(Debug)]
pub struct MspParser {
    state: State,
    direction: Direction,
    cmd: u16,
    expected_len: usize,
    payload: Vec<u8>,
    checksum: u8,
    crc_errors: u64,
}

impl Default for MspParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MspParser {
    /// Create a parser waiting for a preamble
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            direction: Direction::Reply,
            cmd: 0,
            expected_len: 0,
            payload: Vec::new(),
            checksum: 0,
            crc_errors: 0,
        }
    }

    /// Number of frames dropped for a bad checksum
    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    /// Parse every complete frame contained in `data`
    pub fn feed(&mut self, data: &[u8]) -> Vec<MspFrame> {
        data.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Advance the state machine by one byte
    ///
    /// # Returns
    ///
    /// * `Option<MspFrame>` - A frame when `byte` completed one with a valid checksum
    pub fn push(&mut self, byte: u8) -> Option<MspFrame> {
        match self.state {
            State::Idle => {
                if byte == MSP_PREAMBLE {
                    self.state = State::Marker;
                }
            }
            State::Marker => {
                self.state = match byte {
                    MSP_V1_MARKER => State::V1Direction,
                    MSP_V2_MARKER => State::V2Direction,
                    MSP_PREAMBLE => State::Marker,
                    _ => State::Idle,
                };
            }
            State::V1Direction | State::V2Direction => match Direction::from_byte(byte) {
                Some(direction) => {
                    self.direction = direction;
                    self.state = if self.state == State::V1Direction {
                        State::V1Length
                    } else {
                        State::V2Flags
                    };
                }
                None if byte == MSP_PREAMBLE => self.state = State::Marker,
                None => self.state = State::Idle,
            },

            State::V1Length => {
                self.expected_len = byte as usize;
                self.checksum = byte;
                self.state = State::V1Command;
            }
            State::V1Command => {
                self.cmd = u16::from(byte);
                self.checksum ^= byte;
                self.begin_payload(State::V1Payload, State::V1Checksum);
            }
            State::V1Payload => {
                self.checksum ^= byte;
                self.payload.push(byte);
                if self.payload.len() == self.expected_len {
                    self.state = State::V1Checksum;
                }
            }
            State::V1Checksum => return self.finish(byte),

            State::V2Flags => {
                self.checksum = crc8_dvb_s2_update(0, byte);
                self.state = State::V2CommandLo;
            }
            State::V2CommandLo => {
                self.checksum = crc8_dvb_s2_update(self.checksum, byte);
                self.cmd = u16::from(byte);
                self.state = State::V2CommandHi;
            }
            State::V2CommandHi => {
                self.checksum = crc8_dvb_s2_update(self.checksum, byte);
                self.cmd |= u16::from(byte) << 8;
                self.state = State::V2LengthLo;
            }
            State::V2LengthLo => {
                self.checksum = crc8_dvb_s2_update(self.checksum, byte);
                self.expected_len = byte as usize;
                self.state = State::V2LengthHi;
            }
            State::V2LengthHi => {
                self.checksum = crc8_dvb_s2_update(self.checksum, byte);
                self.expected_len |= (byte as usize) << 8;
                if self.expected_len > MSP_MAX_PAYLOAD {
                    warn!(
                        "MSP frame {} announces {} byte payload, resyncing",
                        self.cmd, self.expected_len
                    );
                    self.state = State::Idle;
                } else {
                    self.begin_payload(State::V2Payload, State::V2Checksum);
                }
            }
            State::V2Payload => {
                self.checksum = crc8_dvb_s2_update(self.checksum, byte);
                self.payload.push(byte);
                if self.payload.len() == self.expected_len {
                    self.state = State::V2Checksum;
                }
            }
            State::V2Checksum => return self.finish(byte),
        }
        None
    }

    fn begin_payload(&mut self, payload_state: State, checksum_state: State) {
        self.payload = Vec::with_capacity(self.expected_len);
        self.state = if self.expected_len > 0 {
            payload_state
        } else {
            checksum_state
        };
    }

    fn finish(&mut self, received: u8) -> Option<MspFrame> {
        self.state = State::Idle;
        if received != self.checksum {
            self.crc_errors += 1;
            warn!(
                "MSP checksum error on command {}: expected 0x{:02X}, got 0x{:02X}",
                self.cmd, self.checksum, received
            );
            return None;
        }
        Some(MspFrame {
            cmd: self.cmd,
            payload: std::mem::take(&mut self.payload),
            direction: self.direction,
        })
    }
}
