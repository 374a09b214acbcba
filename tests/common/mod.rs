//! Scripted flight controller for integration tests.
//!
//! Answers the handshake with a fixed identity, acknowledges channel and
//! RSSI frames, and reports itself armed while the ARM switch (AUX1) sits
//! in its range.

#![allow(dead_code)]

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use fl2sitl::msp::codec::encode_v2_frame;
use fl2sitl::msp::{
    Direction, MspParser, MSP2_COMMON_SETTING, MSP2_INAV_STATUS, MSP_API_VERSION, MSP_BOARD_INFO,
    MSP_BOXNAMES, MSP_BUILD_INFO, MSP_FC_VARIANT, MSP_FC_VERSION, MSP_MODE_RANGES, MSP_NAME,
    MSP_RX_MAP, MSP_SET_RAW_RC, MSP_SET_TX_INFO, MSP_SET_WP,
};

/// ARM on AUX1 (1700..2100), ANGLE on AUX2 (1400..1700)
pub const MODE_RANGES: [u8; 8] = [0, 0, 32, 48, 1, 1, 20, 32];

/// Lowest PWM that activates the ARM range
pub const ARM_RANGE_START: u16 = 1700;

/// What the fake saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FcRecord {
    RawRc(Vec<u16>),
    Rssi(u8),
    Status { armed: bool },
    Waypoint(Vec<u8>),
}

/// Commands the fake answers with an error reply or not at all
#[derive(Debug, Clone, Default)]
pub struct FcScript {
    pub reject: Vec<u16>,
    pub silent: Vec<u16>,
    /// Once armed, never report disarmed again
    pub hold_armed: bool,
}

fn build_info() -> Vec<u8> {
    let mut build = b"Jan 01 2024 12:00:00".to_vec();
    build.truncate(19);
    build.extend_from_slice(b"a1b2c3d");
    build
}

fn status_payload(armed: bool) -> Vec<u8> {
    let mut payload = vec![0u8; 21];
    let (arm_flags, box_flags) = if armed { (1u32 << 2, 1u64) } else { (0, 0) };
    payload[9..13].copy_from_slice(&arm_flags.to_le_bytes());
    payload[13..21].copy_from_slice(&box_flags.to_le_bytes());
    payload
}

/// Serve one MSP connection until it closes
pub async fn serve_fc<S>(stream: S, script: FcScript, records: mpsc::UnboundedSender<FcRecord>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut parser = MspParser::new();
    let mut buf = [0u8; 512];
    let mut armed = false;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for request in parser.feed(&buf[..n]) {
            let cmd = request.cmd;
            if script.silent.contains(&cmd) {
                continue;
            }
            if cmd == MSP_SET_WP {
                let _ = records.send(FcRecord::Waypoint(request.payload.to_vec()));
            }
            if script.reject.contains(&cmd) {
                let frame = encode_v2_frame(Direction::Error, cmd, &[]);
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
                continue;
            }

            let payload: Vec<u8> = match cmd {
                MSP_API_VERSION => vec![0, 2, 5],
                MSP_FC_VARIANT => b"INAV".to_vec(),
                MSP_FC_VERSION => vec![7, 1, 2],
                MSP_BUILD_INFO => build_info(),
                MSP_BOARD_INFO => b"SITL".to_vec(),
                MSP2_COMMON_SETTING => vec![1],
                MSP_RX_MAP => vec![0, 1, 2, 3],
                MSP_NAME => b"replay".to_vec(),
                MSP_MODE_RANGES => MODE_RANGES.to_vec(),
                MSP_BOXNAMES => b"ARM;ANGLE;".to_vec(),
                MSP_SET_RAW_RC => {
                    let channels: Vec<u16> = request
                        .payload
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect();
                    let switch_on =
                        channels.get(4).map_or(false, |&v| v >= ARM_RANGE_START && v <= 2100);
                    armed = switch_on || (script.hold_armed && armed);
                    let _ = records.send(FcRecord::RawRc(channels));
                    Vec::new()
                }
                MSP_SET_TX_INFO => {
                    let _ = records.send(FcRecord::Rssi(request.payload[0]));
                    Vec::new()
                }
                MSP2_INAV_STATUS => {
                    let _ = records.send(FcRecord::Status { armed });
                    status_payload(armed)
                }
                _ => Vec::new(),
            };

            let frame = encode_v2_frame(Direction::Reply, cmd, &payload);
            if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}
