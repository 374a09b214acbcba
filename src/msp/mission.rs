//! # Waypoint Mission
//!
//! Waypoints carried by the log, uploaded one `MSP_SET_WP` frame at a time
//! after the handshake so the flight controller flies the same mission
//! the log was recorded with.

use serde::Deserialize;

/// Size of one `MSP_SET_WP` payload
pub const WAYPOINT_PAYLOAD_SIZE: usize = 21;

/// Flag marking the last waypoint of a mission
pub const WAYPOINT_FLAG_LAST: u8 = 0xA5;

/// INAV has room for this many waypoints
pub const MAX_WAYPOINTS: usize = 120;

/// Waypoint action, by INAV name (`"WAYPOINT"`, `"RTH"`, ...)
///
/// Names INAV does not know are flown as plain waypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaypointAction {
    PosholdUnlim,
    PosholdTime,
    Rth,
    SetPoi,
    Jump,
    SetHead,
    Land,
    #[default]
    #[serde(other)]
    Waypoint,
}

impl WaypointAction {
    /// Wire code
    pub fn code(self) -> u8 {
        match self {
            WaypointAction::Waypoint => 1,
            WaypointAction::PosholdUnlim => 2,
            WaypointAction::PosholdTime => 3,
            WaypointAction::Rth => 4,
            WaypointAction::SetPoi => 5,
            WaypointAction::Jump => 6,
            WaypointAction::SetHead => 7,
            WaypointAction::Land => 8,
        }
    }
}

/// One mission item
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct Waypoint {
    pub action: WaypointAction,
    pub lat: f64,
    pub lon: f64,
    /// Metres, relative to home
    pub alt: i32,
    pub p1: i16,
    pub p2: i16,
    pub p3: i16,
    pub flag: u8,
}

/// `MSP_SET_WP` payload for waypoint number `no` (1-based)
///
/// The last waypoint always carries [`WAYPOINT_FLAG_LAST`].
pub fn encode_waypoint(no: u8, wp: &Waypoint, last: bool) -> [u8; WAYPOINT_PAYLOAD_SIZE] {
    let mut buf = [0u8; WAYPOINT_PAYLOAD_SIZE];
    buf[0] = no;
    buf[1] = wp.action.code();
    buf[2..6].copy_from_slice(&((wp.lat * 1e7) as i32).to_le_bytes());
    buf[6..10].copy_from_slice(&((wp.lon * 1e7) as i32).to_le_bytes());
    buf[10..14].copy_from_slice(&wp.alt.saturating_mul(100).to_le_bytes());
    buf[14..16].copy_from_slice(&wp.p1.to_le_bytes());
    buf[16..18].copy_from_slice(&wp.p2.to_le_bytes());
    buf[18..20].copy_from_slice(&wp.p3.to_le_bytes());
    buf[20] = if last { WAYPOINT_FLAG_LAST } else { wp.flag };
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_waypoint() {
        let wp = Waypoint {
            action: WaypointAction::PosholdTime,
            lat: 54.1,
            lon: -4.7,
            alt: 50,
            p1: 30,
            ..Waypoint::default()
        };
        let buf = encode_waypoint(2, &wp, false);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], 3);
        assert_eq!(i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]), 541_000_000);
        assert_eq!(i32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]), -47_000_000);
        assert_eq!(i32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]), 5000);
        assert_eq!(&buf[14..20], &[30, 0, 0, 0, 0, 0]);
        assert_eq!(buf[20], 0);
    }

    #[test]
    fn test_last_waypoint_flag() {
        let wp = Waypoint::default();
        assert_eq!(encode_waypoint(1, &wp, true)[20], WAYPOINT_FLAG_LAST);
    }

    #[test]
    fn test_action_names() {
        let wps: Vec<Waypoint> = serde_json::from_str(
            r#"[{"action":"RTH"},{"action":"LAND","alt":0},{"action":"SOMETHING_NEW"},{}]"#,
        )
        .unwrap();
        let codes: Vec<u8> = wps.iter().map(|wp| wp.action.code()).collect();
        assert_eq!(codes, vec![4, 8, 1, 1]);
    }
}
