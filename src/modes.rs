//! # Flight Modes and Arming
//!
//! Maps the replayed log's flight-mode codes onto INAV mode boxes and
//! drives the AUX channels that activate them.
//!
//! AUX channel `n` (0-based in the mode-range table) is RC channel
//! `MODE_CHANNEL_OFFSET + n`. A mode is switched on by placing the channel
//! at the midpoint of its activation range, and off by placing it just
//! below the lowest range configured on that channel.

use std::fmt;

use tracing::{debug, info, warn};

use crate::rx::{RcChannels, RC_NUM_CHANNELS};

/// First AUX channel index
pub const MODE_CHANNEL_OFFSET: usize = 4;

/// Maximum number of mode activation conditions INAV reports
pub const MAX_MODE_ACTIVATION_COUNT: usize = 40;

/// Bytes per mode activation entry
const MODE_RANGE_ENTRY_SIZE: usize = 4;

/// INAV permanent box ids used by the mode table
pub mod boxes {
    pub const ARM: u16 = 0;
    pub const ANGLE: u16 = 1;
    pub const HORIZON: u16 = 2;
    pub const NAV_ALTHOLD: u16 = 3;
    pub const NAV_RTH: u16 = 10;
    pub const NAV_POSHOLD: u16 = 11;
    pub const MANUAL: u16 = 12;
    pub const BEEPER: u16 = 13;
    pub const FAILSAFE: u16 = 27;
    pub const NAV_WP: u16 = 28;
    pub const GCS_NAV: u16 = 31;
    pub const NAV_LAUNCH: u16 = 36;
    pub const NAV_CRUISE: u16 = 45;
    pub const MSP_RC_OVERRIDE: u16 = 50;
    /// No box active (acro)
    pub const NONE: u16 = 0xFFFF;
    /// Emergency landing has no switchable box
    pub const EMERGENCY: u16 = 0xFFFE;
}

/// Flight modes as recorded in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlightMode {
    Acro,
    Manual,
    Horizon,
    Angle,
    Launch,
    Rth,
    Waypoint,
    Cruise3D,
    Cruise2D,
    PosHold,
    AltHold,
    Emergency,
    Failsafe,
    Land,
    MspOverride,
    GcsNav,
    Beeper,
    Arm,
    /// Also marks the end of a replay stream
    Unknown,
}

impl FlightMode {
    /// Numeric code used in logs
    pub fn code(self) -> u16 {
        match self {
            FlightMode::Acro => 0,
            FlightMode::Manual => 1,
            FlightMode::Horizon => 2,
            FlightMode::Angle => 3,
            FlightMode::Launch => 4,
            FlightMode::Rth => 5,
            FlightMode::Waypoint => 6,
            FlightMode::Cruise3D => 7,
            FlightMode::Cruise2D => 8,
            FlightMode::PosHold => 9,
            FlightMode::AltHold => 10,
            FlightMode::Emergency => 11,
            FlightMode::Failsafe => 12,
            FlightMode::Land => 13,
            FlightMode::MspOverride => 14,
            FlightMode::GcsNav => 15,
            FlightMode::Beeper => 0xBEEB,
            FlightMode::Arm => 0xF00D,
            FlightMode::Unknown => 0xD0D0,
        }
    }

    /// Inverse of [`FlightMode::code`]
    pub fn from_code(code: u16) -> Option<Self> {
        let mode = match code {
            0 => FlightMode::Acro,
            1 => FlightMode::Manual,
            2 => FlightMode::Horizon,
            3 => FlightMode::Angle,
            4 => FlightMode::Launch,
            5 => FlightMode::Rth,
            6 => FlightMode::Waypoint,
            7 => FlightMode::Cruise3D,
            8 => FlightMode::Cruise2D,
            9 => FlightMode::PosHold,
            10 => FlightMode::AltHold,
            11 => FlightMode::Emergency,
            12 => FlightMode::Failsafe,
            13 => FlightMode::Land,
            14 => FlightMode::MspOverride,
            15 => FlightMode::GcsNav,
            0xBEEB => FlightMode::Beeper,
            0xF00D => FlightMode::Arm,
            0xD0D0 => FlightMode::Unknown,
            _ => return None,
        };
        Some(mode)
    }

    /// INAV boxes that implement this mode (empty if none does)
    pub fn boxes(self) -> &'static [u16] {
        MODE_TABLE
            .iter()
            .find(|entry| entry.mode == self)
            .map(|entry| entry.boxes)
            .unwrap_or(&[])
    }

    /// Display name
    pub fn name(self) -> &'static str {
        MODE_TABLE
            .iter()
            .find(|entry| entry.mode == self)
            .map(|entry| entry.name)
            .unwrap_or("Unknown")
    }

    /// First mode that a box id belongs to
    pub fn from_box(box_id: u16) -> Option<Self> {
        MODE_TABLE
            .iter()
            .find(|entry| entry.boxes.contains(&box_id))
            .map(|entry| entry.mode)
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct ModeEntry {
    mode: FlightMode,
    boxes: &'static [u16],
    name: &'static str,
}

static MODE_TABLE: &[ModeEntry] = &[
    ModeEntry { mode: FlightMode::Acro, boxes: &[boxes::NONE], name: "Acro" },
    ModeEntry { mode: FlightMode::Manual, boxes: &[boxes::MANUAL], name: "Manual" },
    ModeEntry { mode: FlightMode::Horizon, boxes: &[boxes::HORIZON], name: "Horizon" },
    ModeEntry { mode: FlightMode::Angle, boxes: &[boxes::ANGLE], name: "Angle" },
    ModeEntry { mode: FlightMode::Launch, boxes: &[boxes::NAV_LAUNCH], name: "Launch" },
    ModeEntry { mode: FlightMode::Rth, boxes: &[boxes::NAV_RTH], name: "RTH" },
    ModeEntry { mode: FlightMode::Waypoint, boxes: &[boxes::NAV_WP], name: "WP" },
    ModeEntry { mode: FlightMode::Cruise3D, boxes: &[boxes::NAV_CRUISE], name: "Cruise3D" },
    ModeEntry { mode: FlightMode::Cruise2D, boxes: &[boxes::NAV_CRUISE], name: "Cruise2D" },
    ModeEntry { mode: FlightMode::PosHold, boxes: &[boxes::NAV_POSHOLD], name: "PosHold" },
    ModeEntry { mode: FlightMode::AltHold, boxes: &[boxes::NAV_ALTHOLD], name: "AltHold" },
    ModeEntry { mode: FlightMode::Emergency, boxes: &[boxes::EMERGENCY], name: "Emergency" },
    ModeEntry { mode: FlightMode::Failsafe, boxes: &[boxes::FAILSAFE], name: "Failsafe" },
    ModeEntry { mode: FlightMode::Arm, boxes: &[boxes::ARM], name: "Arm" },
    ModeEntry { mode: FlightMode::MspOverride, boxes: &[boxes::MSP_RC_OVERRIDE], name: "Override" },
    ModeEntry { mode: FlightMode::Beeper, boxes: &[boxes::BEEPER], name: "Beeper" },
    ModeEntry { mode: FlightMode::GcsNav, boxes: &[boxes::GCS_NAV], name: "GCS Nav" },
];

/// One mode activation condition
///
/// `start` and `end` are in INAV steps: `pwm = 900 + 25 * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRange {
    pub box_id: u8,
    /// AUX channel (0 = AUX1)
    pub channel: u8,
    pub start: u8,
    pub end: u8,
}

impl ModeRange {
    /// RC channel index this range listens on
    pub fn rc_channel(&self) -> usize {
        MODE_CHANNEL_OFFSET + self.channel as usize
    }

    /// PWM at the middle of the range
    pub fn on_value(&self) -> u16 {
        (u16::from(self.start) + u16::from(self.end)) * 25 / 2 + 900
    }
}

/// Decode `MSP_MODE_RANGES`, keeping only configured entries
///
/// The result is sorted by (channel, start) so overlapping ranges on one
/// channel resolve the same way every time.
pub fn parse_mode_ranges(payload: &[u8]) -> Vec<ModeRange> {
    let mut ranges: Vec<ModeRange> = payload
        .chunks_exact(MODE_RANGE_ENTRY_SIZE)
        .take(MAX_MODE_ACTIVATION_COUNT)
        .filter(|e| e[2] != 0 && e[3] != 0)
        .map(|e| ModeRange {
            box_id: e[0],
            channel: e[1],
            start: e[2],
            end: e[3],
        })
        .collect();
    ranges.sort_by_key(|r| (r.channel, r.start));
    ranges
}

/// PWM that is below every range configured on `range`'s channel
pub fn off_value(ranges: &[ModeRange], range: &ModeRange) -> u16 {
    let lowest = ranges
        .iter()
        .filter(|r| r.channel == range.channel)
        .map(|r| r.start)
        .min()
        .unwrap_or(4);
    u16::from(lowest).saturating_sub(1) * 25 + 910
}

/// Switch the AUX channels from mode `from` to mode `to`
///
/// Boxes of `from` are switched off first, then boxes of `to` switched on,
/// so a box shared by both modes ends up on.
pub fn change_mode(channels: &mut RcChannels, ranges: &[ModeRange], from: FlightMode, to: FlightMode) {
    debug!("Mode change <{}> => <{}>", from, to);

    for &box_id in from.boxes() {
        for r in ranges.iter().filter(|r| u16::from(r.box_id) == box_id) {
            if let Some(slot) = channels.get_mut(r.rc_channel()) {
                *slot = off_value(ranges, r);
            }
        }
    }

    for &box_id in to.boxes() {
        for r in ranges.iter().filter(|r| u16::from(r.box_id) == box_id) {
            if let Some(slot) = channels.get_mut(r.rc_channel()) {
                *slot = r.on_value();
            }
        }
    }
}

/// Receiver channel order from `MSP_RX_MAP`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    pub aileron: usize,
    pub elevator: usize,
    pub rudder: usize,
    pub throttle: usize,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            aileron: 0,
            elevator: 1,
            rudder: 2,
            throttle: 3,
        }
    }
}

impl ChannelMap {
    /// Decode the four-byte RX map; `None` unless it is a permutation of 0..4
    pub fn from_rx_map(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }
        let mut seen = [false; 4];
        for &slot in payload {
            let slot = slot as usize;
            if slot >= 4 || seen[slot] {
                return None;
            }
            seen[slot] = true;
        }
        Some(Self {
            aileron: payload[0] as usize,
            elevator: payload[1] as usize,
            rudder: payload[2] as usize,
            throttle: payload[3] as usize,
        })
    }

    /// Map string, e.g. `AERT` or `TAER`
    pub fn label(&self) -> String {
        let mut map = ['?'; 4];
        map[self.aileron] = 'A';
        map[self.elevator] = 'E';
        map[self.rudder] = 'R';
        map[self.throttle] = 'T';
        map.iter().collect()
    }

    /// Stick letter for a channel slot, if it is a stick
    pub fn stick_name(&self, index: usize) -> Option<char> {
        if index == self.aileron {
            Some('A')
        } else if index == self.elevator {
            Some('E')
        } else if index == self.rudder {
            Some('R')
        } else if index == self.throttle {
            Some('T')
        } else {
            None
        }
    }

    /// Write aileron/elevator/rudder/throttle into their slots
    pub fn place_sticks(&self, channels: &mut RcChannels, sticks: [u16; 4]) {
        channels[self.aileron] = sticks[0];
        channels[self.elevator] = sticks[1];
        channels[self.rudder] = sticks[2];
        channels[self.throttle] = sticks[3];
    }
}

/// Render a channel frame as `[A:1500, E:1500, ..., 5:1001, ...]`
pub fn format_channels(channels: &RcChannels, map: &ChannelMap) -> String {
    let items: Vec<String> = channels
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let label = map
                .stick_name(i)
                .map(String::from)
                .unwrap_or_else(|| (i + 1).to_string());
            match v {
                crate::rx::CHANNEL_NO_PULSE => format!("{}:F/S", label),
                crate::rx::CHANNEL_UNCHANGED => format!("{}:-", label),
                _ => format!("{}:{}", label, v),
            }
        })
        .collect();
    format!("[{}]", items.join(", "))
}

/// PWM that moves the arm switch out of its range
pub const ARM_SWITCH_OFF: u16 = 1002;

/// Yaw while armed; high yaw also satisfies the arming-safety bypass
pub const ARM_YAW: u16 = 1997;

/// Throttle used while arming
pub const ARM_THROTTLE: u16 = 999;

/// Throttle after disarming
pub const DISARM_THROTTLE: u16 = 998;

/// Centred stick
pub const STICK_CENTER: u16 = 1500;

/// The channel and PWM that activate the ARM box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmSwitch {
    pub channel: usize,
    pub value: u16,
}

impl ArmSwitch {
    /// Find the first ARM range; `None` if arming is not switch-configured
    pub fn discover(ranges: &[ModeRange]) -> Option<Self> {
        ranges
            .iter()
            .find(|r| u16::from(r.box_id) == boxes::ARM)
            .filter(|r| r.rc_channel() < RC_NUM_CHANNELS)
            .map(|r| Self {
                channel: r.rc_channel(),
                value: r.on_value(),
            })
    }
}

/// Drive sticks and the arm switch to arm (`true`) or disarm (`false`)
///
/// # Returns
///
/// * `bool` - false if no arm switch is known, in which case nothing changes
pub fn arm_action(
    channels: &mut RcChannels,
    switch: Option<ArmSwitch>,
    map: &ChannelMap,
    arm: bool,
) -> bool {
    let Some(switch) = switch else {
        warn!("No arming switch configured; cannot {}", if arm { "arm" } else { "disarm" });
        return false;
    };

    if arm {
        channels[map.rudder] = ARM_YAW;
        channels[map.throttle] = ARM_THROTTLE;
        channels[switch.channel] = switch.value;
        info!("Arming on channel {} at {}", switch.channel + 1, switch.value);
    } else {
        channels[switch.channel] = ARM_SWITCH_OFF;
        channels[map.rudder] = STICK_CENTER;
        channels[map.throttle] = DISARM_THROTTLE;
        info!("Disarming on channel {} at {}", switch.channel + 1, ARM_SWITCH_OFF);
    }
    true
}
