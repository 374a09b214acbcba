//! # fl2sitl Library
//!
//! Replay a recorded flight log into a live INAV flight controller running
//! as SITL (or HITL).
//!
//! The bridge plays simulator to the firmware, feeding it position and
//! attitude from the log over X-Plane datarefs, and plays pilot, driving
//! the RC channels over MSP or an emulated SBUS/IBUS/CRSF/Jeti receiver so
//! the logged flight modes, arming and failsafe are reproduced.

pub mod bridge;
pub mod config;
pub mod crc;
pub mod error;
pub mod logsource;
pub mod modes;
pub mod msp;
pub mod replay;
pub mod rx;
pub mod sim;
