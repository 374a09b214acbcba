//! # Replay Controller
//!
//! The session state machine, free of I/O. The orchestrator feeds it
//! link status, replayed samples and operator requests; it answers with
//! [`Action`]s for the orchestrator to carry out. It owns the RC channel
//! frame and the arming state.

use std::fmt;

use tracing::{debug, info, warn};

use crate::config::FailsafeMode;
use crate::modes::{arm_action, change_mode, ArmSwitch, ChannelMap, FlightMode, ModeRange};
use crate::msp::link::initial_channels;
use crate::msp::{FcInfo, LinkStatus};
use crate::replay::SimulationSample;
use crate::rx::{RcChannels, CHANNEL_NO_PULSE, CHANNEL_UNCHANGED, RC_NUM_CHANNELS};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Init,
    AwaitingHandshake,
    Connected,
    ReadyToArm,
    Armed,
    Disarming,
    Terminated,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Init => "init",
            SessionPhase::AwaitingHandshake => "awaiting handshake",
            SessionPhase::Connected => "connected",
            SessionPhase::ReadyToArm => "ready to arm",
            SessionPhase::Armed => "armed",
            SessionPhase::Disarming => "disarming",
            SessionPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Something the orchestrator must do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Let the replay scheduler proceed past its first sample
    OpenGate,
    /// Send this channel frame to the link
    Channels(RcChannels),
    /// Send this RSSI (percent) to the link
    Rssi(u8),
}

/// Arming, failsafe and flight-mode state for one replay session
#[derive(Debug)]
pub struct ReplayController {
    auto_arm: bool,
    failsafe: FailsafeMode,
    phase: SessionPhase,
    channels: RcChannels,
    channel_map: ChannelMap,
    ranges: Vec<ModeRange>,
    arm_switch: Option<ArmSwitch>,
    mode: FlightMode,
    gate_open: bool,
    armed: bool,
    in_failsafe: bool,
    log_armed: bool,
    rssi: Option<u8>,
}

impl ReplayController {
    pub fn new(auto_arm: bool, failsafe: FailsafeMode) -> Self {
        Self {
            auto_arm,
            failsafe,
            phase: SessionPhase::Init,
            channels: [CHANNEL_UNCHANGED; RC_NUM_CHANNELS],
            channel_map: ChannelMap::default(),
            ranges: Vec::new(),
            arm_switch: None,
            mode: FlightMode::Acro,
            gate_open: false,
            armed: false,
            in_failsafe: false,
            log_armed: false,
            rssi: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Current channel frame
    pub fn channels(&self) -> &RcChannels {
        &self.channels
    }

    /// Move to `phase`, logging the transition
    pub fn set_phase(&mut self, phase: SessionPhase) {
        if phase != self.phase {
            info!("Session {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// Flight controller handshake finished
    pub fn on_connected(&mut self, fc: &FcInfo) -> Vec<Action> {
        info!("Connected to {}", fc);
        info!(
            "RX map {}, {} mode ranges{}",
            fc.channel_map.label(),
            fc.mode_ranges.len(),
            if fc.bypass { ", arming bypass" } else { "" }
        );

        self.channel_map = fc.channel_map;
        self.ranges = fc.mode_ranges.clone();
        self.channels = initial_channels(fc);
        self.arm_switch = ArmSwitch::discover(&self.ranges);
        match self.arm_switch {
            Some(switch) => debug!(
                "Arm switch on channel {} at {}",
                switch.channel + 1,
                switch.value
            ),
            None => warn!("No ARM mode range configured; arming is disabled"),
        }

        change_mode(&mut self.channels, &self.ranges, FlightMode::Acro, self.mode);
        self.set_phase(SessionPhase::Connected);
        vec![Action::Channels(self.channels)]
    }

    /// Arming status transition from the link
    pub fn on_status(&mut self, status: LinkStatus) -> Vec<Action> {
        let mut actions = Vec::new();
        match status {
            LinkStatus::ReadyToArm => {
                if self.phase < SessionPhase::ReadyToArm {
                    self.set_phase(SessionPhase::ReadyToArm);
                }
                if !self.gate_open {
                    self.gate_open = true;
                    actions.push(Action::OpenGate);
                }
                if self.auto_arm && self.log_armed && !self.armed {
                    actions.extend(self.arm(true));
                }
            }
            LinkStatus::Armed => {
                self.armed = true;
                info!("Armed");
                if self.phase != SessionPhase::Disarming {
                    self.set_phase(SessionPhase::Armed);
                }
            }
            LinkStatus::Disarmed => {
                self.armed = false;
                info!("Disarmed");
                if self.phase == SessionPhase::Disarming {
                    self.set_phase(SessionPhase::Terminated);
                } else {
                    // Keep the switch off so the FC does not re-arm by itself
                    if arm_action(&mut self.channels, self.arm_switch, &self.channel_map, false) {
                        actions.push(Action::Channels(self.channels));
                    }
                    self.set_phase(SessionPhase::ReadyToArm);
                }
            }
        }
        actions
    }

    /// One replayed sample
    pub fn on_sample(&mut self, sample: &SimulationSample) -> Vec<Action> {
        let mut actions = Vec::new();
        if sample.is_end() || self.phase < SessionPhase::Connected {
            self.log_armed = sample.is_armed();
            return actions;
        }

        if sample.mode != self.mode {
            info!("Flight mode {} -> {}", self.mode, sample.mode);
            change_mode(&mut self.channels, &self.ranges, self.mode, sample.mode);
            self.mode = sample.mode;
        }

        let was_log_armed = self.log_armed;
        self.log_armed = sample.is_armed();
        if self.auto_arm && self.phase != SessionPhase::Disarming {
            if self.log_armed && !was_log_armed && !self.armed {
                actions.extend(self.arm(true));
            } else if !self.log_armed && was_log_armed && self.armed {
                actions.extend(self.arm(false));
            }
        }

        // Once disarming, the disarm frame stays put until the FC confirms
        let live = self.armed && self.phase != SessionPhase::Disarming;
        let failsafe = self.failsafe != FailsafeMode::Ignore && sample.is_failsafe();
        if live && failsafe && !self.in_failsafe {
            self.in_failsafe = true;
            let throttle = match self.failsafe {
                FailsafeMode::Throttle(pwm) => pwm,
                FailsafeMode::NoPulse | FailsafeMode::Ignore => CHANNEL_NO_PULSE,
            };
            self.channels[self.channel_map.throttle] = throttle;
            warn!("Failsafe set, RC frozen ({})", self.failsafe);
            self.push_rssi(0, &mut actions);
        } else if self.in_failsafe && !failsafe {
            self.in_failsafe = false;
            info!("Failsafe cleared");
        }

        if live && !self.in_failsafe {
            self.channel_map.place_sticks(&mut self.channels, sample.sticks);
            self.push_rssi(sample.rssi, &mut actions);
        }

        actions.push(Action::Channels(self.channels));
        actions
    }

    /// Operator or auto-arm request
    pub fn arm(&mut self, arm: bool) -> Vec<Action> {
        if arm && self.phase < SessionPhase::ReadyToArm {
            warn!("Flight controller not ready to arm ({})", self.phase);
            return Vec::new();
        }
        if arm_action(&mut self.channels, self.arm_switch, &self.channel_map, arm) {
            vec![Action::Channels(self.channels)]
        } else {
            Vec::new()
        }
    }

    /// Start ending the session
    ///
    /// While armed this disarms and moves to [`SessionPhase::Disarming`];
    /// the session is over once [`ReplayController::phase`] reaches
    /// [`SessionPhase::Terminated`].
    pub fn begin_shutdown(&mut self) -> Vec<Action> {
        if self.phase >= SessionPhase::Disarming {
            return Vec::new();
        }
        if self.armed {
            self.set_phase(SessionPhase::Disarming);
            let actions = self.arm(false);
            if actions.is_empty() {
                self.set_phase(SessionPhase::Terminated);
            }
            actions
        } else {
            self.set_phase(SessionPhase::Terminated);
            Vec::new()
        }
    }

    fn push_rssi(&mut self, rssi: u8, actions: &mut Vec<Action>) {
        if self.rssi != Some(rssi) {
            self.rssi = Some(rssi);
            actions.push(Action::Rssi(rssi));
        }
    }
}
