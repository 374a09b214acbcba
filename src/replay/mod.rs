//! # Telemetry Replay Scheduler
//!
//! Turns logged samples into [`SimulationSample`]s and emits them with the
//! same spacing they were recorded with.
//!
//! The first sample goes out immediately, then the scheduler waits on a
//! start gate until the orchestrator has the simulator and flight
//! controller ready. Later samples are scheduled against an absolute
//! timeline built from the recorded timestamps, so sleep overshoot does
//! not accumulate.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::error::Result;
use crate::logsource::{LogItem, LogMessage};
use crate::modes::FlightMode;

/// Status bit: craft armed
pub const STATUS_ARMED: u8 = 1;

/// Status bit: flight controller in failsafe
pub const STATUS_FAILSAFE: u8 = 2;

/// One vehicle state snapshot, ready for the simulator and the RC path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationSample {
    /// Recorded time, microseconds
    pub stamp: u64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
    pub galt: f32,
    pub speed: f32,
    pub cog: f32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    /// Body rates, deg/s
    pub gyro: [f32; 3],
    /// Body accelerations, g
    pub acc: [f32; 3],
    /// Aileron, elevator, rudder, throttle
    pub sticks: [u16; 4],
    pub mode: FlightMode,
    pub rssi: u8,
    pub status: u8,
}

impl Default for SimulationSample {
    fn default() -> Self {
        Self {
            stamp: 0,
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            galt: 0.0,
            speed: 0.0,
            cog: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            gyro: [0.0; 3],
            acc: [0.0, 0.0, 1.0],
            sticks: [1500, 1500, 1500, 1000],
            mode: FlightMode::Acro,
            rssi: 0,
            status: 0,
        }
    }
}

impl SimulationSample {
    /// Convert a logged sample, scaling raw accelerometer values by `acc_1g`
    pub fn from_log(item: &LogItem, acc_1g: f32) -> Self {
        let mode = match FlightMode::from_code(item.fmode) {
            Some(FlightMode::Unknown) | None => {
                debug!("Unmapped flight mode code {}, replaying as Acro", item.fmode);
                FlightMode::Acro
            }
            Some(mode) => mode,
        };
        Self {
            stamp: item.stamp,
            lat: item.lat,
            lon: item.lon,
            alt: item.alt as f32,
            galt: item.galt as f32,
            speed: item.speed as f32,
            cog: item.cog as f32,
            roll: item.roll as f32,
            pitch: item.pitch as f32,
            yaw: item.heading as f32,
            gyro: [item.gyro_x as f32, item.gyro_y as f32, item.gyro_z as f32],
            acc: [
                item.acc_x as f32 / acc_1g,
                item.acc_y as f32 / acc_1g,
                item.acc_z as f32 / acc_1g,
            ],
            sticks: [item.ail, item.ele, item.rud, item.thr],
            mode,
            rssi: item.rssi,
            status: item.status,
        }
    }

    /// Copy of `self` marked as the end of the stream
    pub fn end_marker(&self) -> Self {
        Self {
            mode: FlightMode::Unknown,
            ..*self
        }
    }

    /// True for the end-of-stream sentinel
    pub fn is_end(&self) -> bool {
        self.mode == FlightMode::Unknown
    }

    pub fn is_armed(&self) -> bool {
        self.status & STATUS_ARMED != 0
    }

    pub fn is_failsafe(&self) -> bool {
        self.status & STATUS_FAILSAFE != 0
    }
}

/// Pace logged samples onto `output`
///
/// # Arguments
///
/// * `input` - Messages from the log source
/// * `output` - Paced samples for the orchestrator
/// * `start_gate` - Fired by the orchestrator once replay may proceed
/// * `acc_1g` - Raw accelerometer value for 1 g (non-zero)
///
/// # Returns
///
/// `Ok(())` once the end marker was sent, or quietly when the
/// orchestrator stops listening.
pub async fn run_scheduler(
    mut input: mpsc::Receiver<LogMessage>,
    output: mpsc::Sender<SimulationSample>,
    start_gate: oneshot::Receiver<()>,
    acc_1g: f32,
) -> Result<()> {
    let mut gate = Some(start_gate);
    let mut timeline: Option<(Instant, u64)> = None;
    let mut last = SimulationSample::default();
    let mut emitted = 0u64;

    debug!("Replay scheduler running with acc 1G = {:.1}", acc_1g);

    loop {
        let item = match input.recv().await {
            Some(LogMessage::Sample(item)) => item,
            Some(LogMessage::Home(home)) => {
                info!("Home at {:.6} {:.6}", home.lat, home.lon);
                continue;
            }
            Some(LogMessage::End) | None => break,
        };

        let sample = SimulationSample::from_log(&item, acc_1g);

        if let Some((origin, first_stamp)) = timeline {
            let offset = sample.stamp.saturating_sub(first_stamp);
            sleep_until(origin + Duration::from_micros(offset)).await;
        }

        if output.send(sample).await.is_err() {
            return Ok(());
        }
        emitted += 1;
        last = sample;

        if let Some(gate) = gate.take() {
            debug!("Replay waiting for start");
            if gate.await.is_err() {
                debug!("Start gate dropped, replay abandoned");
                return Ok(());
            }
            info!("Replay started");
            timeline = Some((Instant::now(), sample.stamp));
        }
    }

    info!("Replay finished after {} samples", emitted);
    let _ = output.send(last.end_marker()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(stamp: u64) -> LogItem {
        LogItem {
            stamp,
            thr: 1200,
            acc_z: 4096.0,
            ..LogItem::default()
        }
    }

    #[test]
    fn test_from_log_scales_acc() {
        let s = SimulationSample::from_log(&item(0), 4096.0);
        assert_eq!(s.acc, [0.0, 0.0, 1.0]);
        assert_eq!(s.sticks[3], 1200);
        assert_eq!(s.mode, FlightMode::Acro);
    }

    #[test]
    fn test_unknown_mode_is_not_end_marker() {
        let mut logged = item(0);
        logged.fmode = 0xD0D0;
        let s = SimulationSample::from_log(&logged, 1.0);
        assert!(!s.is_end());
        assert!(s.end_marker().is_end());
    }

    #[test]
    fn test_status_bits() {
        let mut s = SimulationSample::default();
        s.status = STATUS_ARMED | STATUS_FAILSAFE;
        assert!(s.is_armed());
        assert!(s.is_failsafe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_follows_timestamps() {
        let (log_tx, log_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (gate_tx, gate_rx) = oneshot::channel();

        for stamp in [0, 100_000, 250_000] {
            log_tx.send(LogMessage::Sample(item(stamp))).await.unwrap();
        }
        log_tx.send(LogMessage::End).await.unwrap();

        let task = tokio::spawn(run_scheduler(log_rx, out_tx, gate_rx, 4096.0));

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.stamp, 0);
        gate_tx.send(()).unwrap();
        let t0 = Instant::now();

        let second = out_rx.recv().await.unwrap();
        let t1 = Instant::now();
        let third = out_rx.recv().await.unwrap();
        let t2 = Instant::now();

        assert_eq!(second.stamp, 100_000);
        assert_eq!(third.stamp, 250_000);
        assert_eq!(t1 - t0, Duration::from_millis(100));
        assert_eq!(t2 - t1, Duration::from_millis(150));

        assert!(out_rx.recv().await.unwrap().is_end());
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_gate() {
        let (log_tx, log_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (gate_tx, gate_rx) = oneshot::channel();

        log_tx.send(LogMessage::Sample(item(0))).await.unwrap();
        log_tx.send(LogMessage::Sample(item(1_000))).await.unwrap();
        tokio::spawn(run_scheduler(log_rx, out_tx, gate_rx, 1.0));

        out_rx.recv().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_secs(60), out_rx.recv()).await;
        assert!(blocked.is_err());

        gate_tx.send(()).unwrap();
        assert_eq!(out_rx.recv().await.unwrap().stamp, 1_000);
    }

    #[tokio::test]
    async fn test_end_marker_on_closed_input() {
        let (log_tx, log_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_gate_tx, gate_rx) = oneshot::channel();
        drop(log_tx);

        run_scheduler(log_rx, out_tx, gate_rx, 1.0).await.unwrap();
        assert!(out_rx.recv().await.unwrap().is_end());
    }

    #[tokio::test]
    async fn test_dropped_gate_stops_quietly() {
        let (log_tx, log_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        log_tx.send(LogMessage::Sample(item(0))).await.unwrap();
        drop(gate_tx);

        run_scheduler(log_rx, out_tx, gate_rx, 1.0).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap().stamp, 0);
        assert!(out_rx.recv().await.is_none());
    }
}
