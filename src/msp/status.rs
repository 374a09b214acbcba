//! # Arming Status Tracking
//!
//! Interprets `MSP2_INAV_STATUS` replies and reduces them to the three
//! transitions the bridge cares about, each reported once per edge.

use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Arming flags below this value only carry informational bits
pub const ARMING_BLOCKED_THRESHOLD: u32 = 0x80;

/// Arming flag: the craft is armed
pub const ARMING_FLAG_ARMED: u32 = 1 << 2;

/// Box flag bit 0 mirrors ARM
pub const BOX_FLAG_ARM: u64 = 1;

const STATUS_ARM_FLAGS_OFFSET: usize = 9;
const STATUS_BOX_FLAGS_OFFSET: usize = 13;
const STATUS_MIN_PAYLOAD: usize = 21;

/// Human-readable names for each arming flag bit (empty = not shown)
const ARMING_FLAG_NAMES: [&str; 32] = [
    "", "", "Armed", "Ever armed", "", "", "", "F/S", "Level", "Calibrate", "Overload",
    "NavUnsafe", "MagCal", "AccCal", "ArmSwitch", "H/WFail", "BoxF/S", "BoxKill", "RCLink",
    "Throttle", "CLI", "CMS", "OSD", "Roll/Pitch", "Autotrim", "OOM", "Settings", "PWM Out",
    "PreArm", "DSHOTBeep", "Land", "Other",
];

/// Transition reported to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Disarmed and nothing blocks arming
    ReadyToArm,
    /// ARM box went from active to inactive
    Disarmed,
    /// ARM box went from inactive to active
    Armed,
}

/// The fields of a status reply the bridge uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReport {
    pub arm_flags: u32,
    pub box_flags: u64,
}

impl StatusReport {
    /// Extract arming and box flags from an `MSP2_INAV_STATUS` payload
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Msp`] if the payload is shorter than 21 bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < STATUS_MIN_PAYLOAD {
            return Err(BridgeError::Msp(format!(
                "status payload too short: {} bytes",
                payload.len()
            )));
        }
        let mut arm = [0u8; 4];
        arm.copy_from_slice(&payload[STATUS_ARM_FLAGS_OFFSET..STATUS_BOX_FLAGS_OFFSET]);
        let mut boxes = [0u8; 8];
        boxes.copy_from_slice(&payload[STATUS_BOX_FLAGS_OFFSET..STATUS_MIN_PAYLOAD]);

        Ok(Self {
            arm_flags: u32::from_le_bytes(arm),
            box_flags: u64::from_le_bytes(boxes),
        })
    }

    /// ARM box active
    pub fn is_armed(&self) -> bool {
        self.box_flags & BOX_FLAG_ARM != 0
    }

    /// No blocking arming flag set
    pub fn can_arm(&self) -> bool {
        self.arm_flags < ARMING_BLOCKED_THRESHOLD
    }
}

/// Render arming flags as a blocker list, e.g. `RCLink Throttle (0xc0080)`
pub fn describe_arming_flags(flags: u32) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if flags < ARMING_BLOCKED_THRESHOLD {
        if flags & ARMING_FLAG_ARMED != 0 {
            parts.push(ARMING_FLAG_NAMES[2]);
        } else {
            parts.push("Ready to arm");
        }
    } else {
        parts.extend(
            ARMING_FLAG_NAMES
                .iter()
                .enumerate()
                .filter(|(bit, name)| flags & (1 << bit) != 0 && !name.is_empty())
                .map(|(_, name)| *name),
        );
    }
    format!("{} (0x{:x})", parts.join(" "), flags)
}

/// Edge detector over successive status replies
#[derive(Debug, Default)]
pub struct StatusTracker {
    previous: StatusReport,
    reported: Option<LinkStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last transition reported
    pub fn last_reported(&self) -> Option<LinkStatus> {
        self.reported
    }

    /// Feed one status reply
    ///
    /// # Returns
    ///
    /// * `Vec<LinkStatus>` - Transitions to report, in order (usually none)
    pub fn update(&mut self, report: StatusReport) -> Vec<LinkStatus> {
        let mut out = Vec::new();

        if report != self.previous {
            debug!(
                "Box flags 0x{:x}, arming flags: {}",
                report.box_flags,
                describe_arming_flags(report.arm_flags)
            );
        }

        if !report.is_armed() && report.can_arm() {
            self.report(LinkStatus::ReadyToArm, &mut out);
        }

        if report.is_armed() != self.previous.is_armed() {
            info!(
                "ARM box changed 0x{:x} -> 0x{:x} ({})",
                self.previous.box_flags,
                report.box_flags,
                describe_arming_flags(report.arm_flags)
            );
            let edge = if report.is_armed() {
                LinkStatus::Armed
            } else {
                LinkStatus::Disarmed
            };
            self.report(edge, &mut out);
        }

        self.previous = report;
        out
    }

    fn report(&mut self, status: LinkStatus, out: &mut Vec<LinkStatus>) {
        if self.reported != Some(status) {
            self.reported = Some(status);
            out.push(status);
        }
    }
}
