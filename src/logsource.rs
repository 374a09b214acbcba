//! # JSON-Lines Log Source
//!
//! Reads a flight log that has already been decoded into one JSON record
//! per line and feeds it to the replay scheduler.
//!
//! ```text
//! {"type":"meta","name":"...","acc_1g":4096,"mission":[{"action":"WAYPOINT",...}],...}
//! {"type":"sample","stamp":0,"lat":54.1,"lon":-4.7,...}
//! {"type":"home","lat":54.1,"lon":-4.7,"alt":12.0}
//! ```
//!
//! The first record must be `meta`. End of file ends the stream.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::msp::Waypoint;

/// Flight-wide metadata from the log header
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct FlightMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub craft: String,
    #[serde(default)]
    pub firmware: String,
    /// Raw accelerometer reading for 1 g
    #[serde(default = "default_acc_1g")]
    pub acc_1g: f32,
    #[serde(default)]
    pub motors: u8,
    #[serde(default)]
    pub servos: u8,
    #[serde(default)]
    pub disarm_reason: Option<String>,
    /// Mission flown during the log, if any
    #[serde(default)]
    pub mission: Vec<Waypoint>,
}

fn default_acc_1g() -> f32 {
    1.0
}

impl FlightMeta {
    /// Accelerometer scale, never zero
    pub fn acc_scale(&self) -> f32 {
        if self.acc_1g == 0.0 {
            1.0
        } else {
            self.acc_1g
        }
    }
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct LogItem {
    /// Microseconds since log start
    pub stamp: u64,
    pub lat: f64,
    pub lon: f64,
    /// Altitude above home, metres
    pub alt: f64,
    /// GPS altitude, metres
    pub galt: f64,
    /// Ground speed, m/s
    pub speed: f64,
    /// Course over ground, degrees
    pub cog: f64,
    pub roll: f64,
    pub pitch: f64,
    pub heading: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub ail: u16,
    pub ele: u16,
    pub rud: u16,
    pub thr: u16,
    /// Flight mode code (see [`crate::modes::FlightMode`])
    pub fmode: u16,
    /// Link quality, percent
    pub rssi: u8,
    /// Status bits, see [`crate::replay::STATUS_ARMED`]
    pub status: u8,
    pub utc: Option<DateTime<Utc>>,
}

/// Origin of the flight
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
pub struct HomeRecord {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt: f64,
}

/// One line of the log file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRecord {
    Meta(FlightMeta),
    Sample(LogItem),
    Home(HomeRecord),
}

/// What the replay scheduler consumes
#[derive(Debug, Clone, PartialEq)]
pub enum LogMessage {
    Sample(LogItem),
    Home(HomeRecord),
    End,
}

/// A log file positioned after its metadata record
pub struct LogSource<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl LogSource<BufReader<File>> {
    /// Open a log file and read its metadata
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or does not start with a
    /// `meta` record.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<(FlightMeta, Self)> {
        let file = File::open(path.as_ref()).await?;
        info!("Replaying {}", path.as_ref().display());
        Self::from_reader(BufReader::new(file)).await
    }
}

impl<R: AsyncBufRead + Unpin> LogSource<R> {
    /// Read the metadata record from any buffered reader
    pub async fn from_reader(reader: R) -> Result<(FlightMeta, Self)> {
        let mut source = Self {
            lines: reader.lines(),
            line_no: 0,
        };
        match source.next_record().await? {
            Some(LogRecord::Meta(meta)) => {
                info!(
                    "Log \"{}\" craft \"{}\" firmware {} (acc 1G {})",
                    meta.name, meta.craft, meta.firmware, meta.acc_1g
                );
                Ok((meta, source))
            }
            Some(other) => Err(BridgeError::Log(format!(
                "log must start with a meta record, found {:?}",
                other
            ))),
            None => Err(BridgeError::Log("log is empty".into())),
        }
    }

    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|e| {
                debug!("Bad log record on line {}: {}", self.line_no, line);
                BridgeError::Json(e)
            })?;
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Send every remaining record, then [`LogMessage::End`]
    ///
    /// Stops early, without error, if the receiver goes away.
    pub async fn stream_into(mut self, tx: mpsc::Sender<LogMessage>) -> Result<()> {
        let mut samples = 0usize;
        let result = loop {
            let message = match self.next_record().await {
                Ok(Some(LogRecord::Sample(item))) => {
                    samples += 1;
                    LogMessage::Sample(item)
                }
                Ok(Some(LogRecord::Home(home))) => LogMessage::Home(home),
                Ok(Some(LogRecord::Meta(_))) => {
                    debug!("Ignoring extra meta record on line {}", self.line_no);
                    continue;
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if tx.send(message).await.is_err() {
                return Ok(());
            }
        };
        debug!("Log source finished after {} samples", samples);
        let _ = tx.send(LogMessage::End).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LOG: &str = r#"{"type":"meta","name":"test","craft":"quad","firmware":"INAV 7.1","acc_1g":4096,"motors":4}
{"type":"sample","stamp":0,"lat":54.1,"lon":-4.7,"alt":1.5,"thr":1000,"rssi":99}

# comment
{"type":"home","lat":54.1,"lon":-4.7}
{"type":"sample","stamp":100000,"status":1,"utc":"2024-05-01T12:00:00Z"}
"#;

    #[tokio::test]
    async fn test_reads_meta_then_streams() {
        let (meta, source) = LogSource::from_reader(LOG.as_bytes()).await.unwrap();
        assert_eq!(meta.name, "test");
        assert_eq!(meta.acc_scale(), 4096.0);
        assert_eq!(meta.motors, 4);

        let (tx, mut rx) = mpsc::channel(8);
        source.stream_into(tx).await.unwrap();

        match rx.recv().await.unwrap() {
            LogMessage::Sample(item) => {
                assert_eq!(item.stamp, 0);
                assert_eq!(item.thr, 1000);
                assert_eq!(item.rssi, 99);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), LogMessage::Home(_)));
        match rx.recv().await.unwrap() {
            LogMessage::Sample(item) => {
                assert_eq!(item.stamp, 100_000);
                assert_eq!(item.status, 1);
                assert!(item.utc.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), LogMessage::End);
    }

    #[tokio::test]
    async fn test_zero_acc_1g_means_unscaled() {
        let (meta, _) = LogSource::from_reader(r#"{"type":"meta","acc_1g":0}"#.as_bytes())
            .await
            .unwrap();
        assert_eq!(meta.acc_scale(), 1.0);
    }

    #[tokio::test]
    async fn test_missing_meta_is_error() {
        let log = r#"{"type":"sample","stamp":0}"#;
        assert!(LogSource::from_reader(log.as_bytes()).await.is_err());
        assert!(LogSource::from_reader("".as_bytes()).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_record_still_ends_stream() {
        let log = "{\"type\":\"meta\"}\n{\"type\":\"sample\",\"stamp\":0}\nnot json\n";
        let (_, source) = LogSource::from_reader(log.as_bytes()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        assert!(matches!(source.stream_into(tx).await, Err(BridgeError::Json(_))));
        assert!(matches!(rx.recv().await, Some(LogMessage::Sample(_))));
        assert_eq!(rx.recv().await, Some(LogMessage::End));
    }

    #[tokio::test]
    async fn test_open_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(LOG.as_bytes()).unwrap();

        let (meta, _) = LogSource::open(file.path()).await.unwrap();
        assert_eq!(meta.craft, "quad");
        assert!(meta.mission.is_empty());
    }

    #[tokio::test]
    async fn test_meta_carries_mission() {
        let log = r#"{"type":"meta","mission":[{"action":"WAYPOINT","lat":54.1,"lon":-4.7,"alt":40},{"action":"RTH"}]}"#;
        let (meta, _) = LogSource::from_reader(log.as_bytes()).await.unwrap();
        assert_eq!(meta.mission.len(), 2);
        assert_eq!(meta.mission[0].alt, 40);
        assert_eq!(meta.mission[1].action, crate::msp::WaypointAction::Rth);
    }
}
