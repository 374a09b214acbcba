//! # Startup Handshake
//!
//! What the bridge learns about the flight controller before replay
//! starts, and how each handshake reply is decoded.
//!
//! Every reply is optional: a missing or malformed reply leaves the
//! corresponding default in place.

use std::fmt;

use tracing::{debug, info, warn};

use super::{
    MspFrame, ARMING_SAFETY_SETTING, MSP2_COMMON_SETTING, MSP_API_VERSION, MSP_BOARD_INFO,
    MSP_BOXNAMES, MSP_BUILD_INFO, MSP_FC_VARIANT, MSP_FC_VERSION, MSP_MODE_RANGES, MSP_NAME,
    MSP_RX_MAP,
};
use crate::modes::{parse_mode_ranges, ChannelMap, FlightMode, ModeRange};

/// Firmware major version that reports the arming-safety setting one low
pub const SETTING_OFFSET_FW_MAJOR: u8 = 6;

/// Setting value that allows arming with navigation unsafe (yaw bypass)
pub const ARMING_SAFETY_BYPASS: u8 = 2;

/// Offset of the git revision in `MSP_BUILD_INFO`
const BUILD_INFO_GITREV_OFFSET: usize = 19;

/// Offset of the target name in a long `MSP_BOARD_INFO`
const BOARD_INFO_NAME_OFFSET: usize = 9;

/// Handshake commands, in the order they are sent
pub const HANDSHAKE_SEQUENCE: [u16; 10] = [
    MSP_API_VERSION,
    MSP_FC_VARIANT,
    MSP_FC_VERSION,
    MSP_BUILD_INFO,
    MSP_BOARD_INFO,
    MSP2_COMMON_SETTING,
    MSP_RX_MAP,
    MSP_NAME,
    MSP_MODE_RANGES,
    MSP_BOXNAMES,
];

/// Everything learned during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FcInfo {
    pub api_version: (u8, u8),
    pub variant: String,
    pub version: (u8, u8, u8),
    pub git_rev: String,
    pub board: String,
    pub arming_safety: Option<u8>,
    /// Arming needs the yaw-bypass stick position
    pub bypass: bool,
    pub channel_map: ChannelMap,
    pub craft_name: String,
    pub mode_ranges: Vec<ModeRange>,
    pub box_names: Vec<String>,
}

impl fmt::Display for FcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}.{}.{} {} ({}) API {}.{}",
            self.variant,
            self.version.0,
            self.version.1,
            self.version.2,
            self.board,
            self.git_rev,
            self.api_version.0,
            self.api_version.1
        )
    }
}

/// Request payload for a handshake command
pub fn request_payload(cmd: u16) -> Vec<u8> {
    if cmd == MSP2_COMMON_SETTING {
        let mut payload = ARMING_SAFETY_SETTING.as_bytes().to_vec();
        payload.push(0);
        payload
    } else {
        Vec::new()
    }
}

fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

impl FcInfo {
    /// Apply one handshake reply
    ///
    /// Unexpected or short payloads are logged and leave the defaults.
    pub fn apply(&mut self, frame: &MspFrame) {
        let p = &frame.payload;
        match frame.cmd {
            MSP_API_VERSION if p.len() >= 3 => self.api_version = (p[1], p[2]),
            MSP_FC_VARIANT if p.len() >= 4 => self.variant = text(&p[..4]),
            MSP_FC_VERSION if p.len() >= 3 => self.version = (p[0], p[1], p[2]),
            MSP_BUILD_INFO if p.len() > BUILD_INFO_GITREV_OFFSET => {
                self.git_rev = text(&p[BUILD_INFO_GITREV_OFFSET..])
            }
            MSP_BOARD_INFO if p.len() >= 4 => {
                self.board = if p.len() >= BOARD_INFO_NAME_OFFSET {
                    text(&p[BOARD_INFO_NAME_OFFSET..])
                } else {
                    text(&p[..4])
                };
                info!("{}", self);
            }
            MSP2_COMMON_SETTING if !p.is_empty() => {
                let mut value = p[0];
                if self.version.0 == SETTING_OFFSET_FW_MAJOR {
                    value = value.wrapping_add(1);
                }
                self.arming_safety = Some(value);
                self.bypass = value == ARMING_SAFETY_BYPASS;
                info!("{}: {} (bypass {})", ARMING_SAFETY_SETTING, value, self.bypass);
            }
            MSP_RX_MAP => match ChannelMap::from_rx_map(p) {
                Some(map) => {
                    self.channel_map = map;
                    info!("RX map {}", map.label());
                }
                None => warn!("Invalid RX map {:?}, assuming AERT", p),
            },
            MSP_NAME => {
                self.craft_name = text(p);
                if !self.craft_name.is_empty() {
                    info!("Craft name \"{}\"", self.craft_name);
                }
            }
            MSP_MODE_RANGES => {
                self.mode_ranges = parse_mode_ranges(p);
                debug!("{} mode ranges configured", self.mode_ranges.len());
                for r in &self.mode_ranges {
                    let name = FlightMode::from_box(u16::from(r.box_id))
                        .map(FlightMode::name)
                        .unwrap_or("-");
                    debug!("    {:?} {}", r, name);
                }
            }
            MSP_BOXNAMES => {
                self.box_names = text(p)
                    .split(';')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                debug!("Boxes: {}", self.box_names.join(";"));
            }
            cmd => warn!("Short or unexpected handshake reply {} ({} bytes)", cmd, p.len()),
        }
    }
}
