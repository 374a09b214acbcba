//! # X-Plane Datarefs
//!
//! The SITL firmware talks to the simulator with X-Plane's `RREF`
//! protocol. It first subscribes to every dataref it wants (one datagram
//! per dataref, carrying the id it wants the values tagged with), and then
//! expects `RREF` datagrams of `(id, f32)` pairs.
//!
//! ```text
//! subscribe: "RREF" 0x00 freq:u32le id:u32le path\0...
//! update:    "RREF" 0x00 (id:u32le value:f32le)*
//! ```

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::replay::SimulationSample;

/// Datagram tag for subscriptions and updates
pub const RREF_HEADER: &[u8; 5] = b"RREF\0";

/// Last dataref the firmware subscribes to
pub const HANDSHAKE_SENTINEL: &str = "has_joystick";

const SUBSCRIBE_FREQ_OFFSET: usize = 5;
const SUBSCRIBE_ID_OFFSET: usize = 9;
const SUBSCRIBE_NAME_OFFSET: usize = 13;

/// Standard sea-level pressure, hPa
const SEA_LEVEL_HPA: f64 = 1013.25;

/// hPa to inches of mercury
const HPA_TO_INHG: f64 = 0.029_529_983_7;

/// Datarefs sent in every state update, in wire order
pub const STATE_DATAREFS: [&str; 15] = [
    "latitude",
    "longitude",
    "elevation",
    "groundspeed",
    "hpath",
    "barometer_current_inhg",
    "g_axil",
    "g_side",
    "g_nrml",
    "P",
    "Q",
    "R",
    "phi",
    "theta",
    "psi",
];

/// One subscription datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub freq: u32,
    pub id: u32,
    /// Full dataref path, e.g. `sim/flightmodel/position/latitude`
    pub path: String,
}

impl Subscription {
    /// Last path component, the key the bridge looks datarefs up by
    pub fn key(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Decode a subscription datagram; `None` for anything else
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() <= SUBSCRIBE_NAME_OFFSET || !datagram.starts_with(&RREF_HEADER[..4]) {
            return None;
        }
        let word = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&datagram[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let name = &datagram[SUBSCRIBE_NAME_OFFSET..];
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());

        Some(Self {
            freq: word(SUBSCRIBE_FREQ_OFFSET),
            id: word(SUBSCRIBE_ID_OFFSET),
            path: String::from_utf8_lossy(&name[..end]).into_owned(),
        })
    }

    /// Encode as the firmware would send it
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SUBSCRIBE_NAME_OFFSET + self.path.len() + 1);
        buf.put_slice(RREF_HEADER);
        buf.put_u32_le(self.freq);
        buf.put_u32_le(self.id);
        buf.put_slice(self.path.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }
}

/// Dataref key to subscription id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatarefMap {
    ids: HashMap<String, u32>,
}

impl DatarefMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, id: u32) {
        self.ids.insert(key.to_string(), id);
    }

    pub fn get(&self, key: &str) -> Option<u32> {
        self.ids.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// State datarefs the firmware did not subscribe to
    pub fn missing(&self) -> Vec<&'static str> {
        STATE_DATAREFS
            .iter()
            .copied()
            .filter(|k| !self.ids.contains_key(*k))
            .collect()
    }
}

/// ISA barometric pressure at `alt` metres, in inches of mercury
pub fn to_inhg(alt: f32) -> f32 {
    let hpa = SEA_LEVEL_HPA * (1.0 - f64::from(alt) / 44_330.0).powf(5.255);
    (HPA_TO_INHG * hpa) as f32
}

/// Build an `RREF` state update for `sample`
///
/// Datarefs the firmware did not subscribe to are left out.
pub fn encode_state(map: &DatarefMap, sample: &SimulationSample) -> Bytes {
    let values: [f32; 15] = [
        sample.lat as f32,
        sample.lon as f32,
        sample.alt,
        sample.speed,
        sample.cog,
        to_inhg(sample.alt),
        sample.acc[0],
        sample.acc[1],
        sample.acc[2],
        sample.gyro[0],
        sample.gyro[1],
        sample.gyro[2],
        sample.roll,
        -sample.pitch,
        sample.yaw,
    ];

    let mut buf = BytesMut::with_capacity(RREF_HEADER.len() + values.len() * 8);
    buf.put_slice(RREF_HEADER);
    for (key, value) in STATE_DATAREFS.iter().zip(values) {
        match map.get(key) {
            Some(id) => {
                buf.put_u32_le(id);
                buf.put_f32_le(value);
            }
            None => debug!("Dataref {} not subscribed", key),
        }
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_map() -> DatarefMap {
        let mut map = DatarefMap::new();
        for (i, key) in STATE_DATAREFS.iter().enumerate() {
            map.insert(key, 100 + i as u32);
        }
        map
    }

    #[test]
    fn test_parse_subscription() {
        let mut dgram = b"RREF\0".to_vec();
        dgram.extend_from_slice(&20u32.to_le_bytes());
        dgram.extend_from_slice(&7u32.to_le_bytes());
        dgram.extend_from_slice(b"sim/flightmodel/position/latitude\0\0\0\0");

        let sub = Subscription::parse(&dgram).unwrap();
        assert_eq!(sub.freq, 20);
        assert_eq!(sub.id, 7);
        assert_eq!(sub.key(), "latitude");
        assert_eq!(Subscription::parse(&sub.encode()), Some(sub));
    }

    #[test]
    fn test_parse_rejects_other_datagrams() {
        assert_eq!(Subscription::parse(b"DATA\0whatever-else"), None);
        assert_eq!(Subscription::parse(b"RREF\0"), None);
    }

    #[test]
    fn test_inhg_at_sea_level_and_altitude() {
        assert!((to_inhg(0.0) - 29.92).abs() < 0.01);
        assert!(to_inhg(1000.0) < to_inhg(0.0));
        assert!((to_inhg(1000.0) - 26.54).abs() < 0.01);
    }

    #[test]
    fn test_state_layout() {
        let sample = SimulationSample {
            lat: 54.5,
            pitch: 10.0,
            ..SimulationSample::default()
        };
        let buf = encode_state(&full_map(), &sample);
        assert_eq!(buf.len(), 5 + 15 * 8);
        assert_eq!(&buf[..5], b"RREF\0");

        // latitude first
        assert_eq!(&buf[5..9], &100u32.to_le_bytes());
        assert_eq!(&buf[9..13], &54.5f32.to_le_bytes());

        // theta is the negated pitch, second to last
        let theta = 5 + 13 * 8;
        assert_eq!(&buf[theta..theta + 4], &113u32.to_le_bytes());
        assert_eq!(&buf[theta + 4..theta + 8], &(-10.0f32).to_le_bytes());
    }

    #[test]
    fn test_state_skips_unsubscribed() {
        let mut map = DatarefMap::new();
        map.insert("latitude", 1);
        map.insert("psi", 2);
        let buf = encode_state(&map, &SimulationSample::default());
        assert_eq!(buf.len(), 5 + 2 * 8);
        assert_eq!(map.missing().len(), 13);
    }
}
