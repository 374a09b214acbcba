//! # MSP Link Task
//!
//! Owns the TCP connection to the flight controller: a reader task turns
//! bytes into frames, and the link task runs the handshake and then the
//! steady-state loop that keeps RC channels flowing, polls arming status
//! and forwards RSSI.
//!
//! At most one MSP request is in flight at a time. RC channels go out on
//! the configuration link itself (`MSP_SET_RAW_RC`) unless a receiver
//! emulator is supplied, in which case the link hands channel frames to it
//! and only uses MSP for status and RSSI.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::codec::{encode_request, MspParser};
use super::handshake::{request_payload, FcInfo, HANDSHAKE_SEQUENCE};
use super::mission::{encode_waypoint, Waypoint, MAX_WAYPOINTS};
use super::status::{LinkStatus, StatusReport, StatusTracker};
use super::{MspFrame, MSP2_INAV_STATUS, MSP_SET_RAW_RC, MSP_SET_TX_INFO, MSP_SET_WP};
use crate::error::{BridgeError, Result};
use crate::modes::{format_channels, ChannelMap, MODE_CHANNEL_OFFSET, STICK_CENTER};
use crate::rx::{RcChannels, RcTransmitter, CHANNEL_NO_PULSE, CHANNEL_UNCHANGED, RC_NUM_CHANNELS};

/// How long each handshake step waits for its reply
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// Give up on a steady-state reply after this long
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Every Nth delivered channel frame is followed by a status poll
pub const STATUS_POLL_EVERY: u64 = 5;

/// Default minimum interval between channel frames
pub const DEFAULT_MIN_SEND: Duration = Duration::from_millis(50);

/// Statistics log period
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 512;
const INBOUND_QUEUE_DEPTH: usize = 32;
const COMMAND_QUEUE_DEPTH: usize = 16;

const INITIAL_THROTTLE: u16 = 999;
const INITIAL_AUX: u16 = 1001;
const BYPASS_YAW: u16 = 1999;
const LOW_THROTTLE_LOG: u16 = 900;

/// Link tuning
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Resend the channel frame if nothing was sent for this long
    pub min_send: Duration,
    /// Channels per frame
    pub nchan: usize,
    /// Waypoints to upload after the handshake
    pub mission: Vec<Waypoint>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            min_send: DEFAULT_MIN_SEND,
            nchan: RC_NUM_CHANNELS,
            mission: Vec::new(),
        }
    }
}

/// Reports from the link task to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake finished
    Connected(FcInfo),
    /// Arming state transition
    Status(LinkStatus),
    /// The link is gone; the task has exited
    Failed(String),
}

/// Requests from the orchestrator to the link task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    /// Channel override; [`CHANNEL_UNCHANGED`] slots keep their value
    Channels(RcChannels),
    /// Link quality in percent
    Rssi(u8),
}

#[derive(Debug)]
enum Inbound {
    Frame(MspFrame),
    Closed(String),
}

#[derive(Debug, Default)]
struct LinkStats {
    frames: u64,
    status_polls: u64,
    rssi_updates: u64,
}

/// Channel frame sent right after the handshake
///
/// Sticks centred and throttle low; with the arming-safety bypass the yaw
/// stick is held high.
pub fn initial_channels(info: &FcInfo) -> RcChannels {
    let map = info.channel_map;
    let mut channels = [INITIAL_AUX; RC_NUM_CHANNELS];
    channels[map.aileron] = STICK_CENTER;
    channels[map.elevator] = STICK_CENTER;
    channels[map.rudder] = if info.bypass { BYPASS_YAW } else { STICK_CENTER };
    channels[map.throttle] = INITIAL_THROTTLE;
    channels
}

/// Apply an override to `current`, skipping [`CHANNEL_UNCHANGED`] slots
///
/// # Returns
///
/// * `bool` - true if an AUX channel changed or throttle dropped to
///   failsafe levels (worth logging the whole frame)
pub fn merge_channels(current: &mut RcChannels, update: &RcChannels, map: &ChannelMap) -> bool {
    let mut notable = false;
    for (j, (slot, &value)) in current.iter_mut().zip(update.iter()).enumerate() {
        if value != CHANNEL_UNCHANGED && value != *slot {
            *slot = value;
            if j >= MODE_CHANNEL_OFFSET || (j == map.throttle && value < LOW_THROTTLE_LOG) {
                notable = true;
            }
        }
    }
    notable
}

/// Scale RSSI percent to the 0..=255 range `MSP_SET_TX_INFO` expects
pub fn rssi_to_tx_info(percent: u8) -> u8 {
    (u16::from(percent.min(100)) * 255 / 100) as u8
}

/// `MSP_SET_RAW_RC` payload: `nchan` little-endian u16 values
pub fn raw_rc_payload(channels: &RcChannels, nchan: usize) -> Vec<u8> {
    channels
        .iter()
        .take(nchan.min(RC_NUM_CHANNELS))
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

/// Start the link on an open flight-controller stream
///
/// # Arguments
///
/// * `stream` - Byte stream to the flight controller's MSP port
/// * `transmitter` - Receiver emulator for channels, or `None` to use MSP
/// * `settings` - Link tuning
/// * `events` - Where handshake results, status transitions and failures go
///
/// # Returns
///
/// * Command sender for channel overrides and RSSI, and the task handle.
///   Dropping the sender stops the link.
pub fn spawn_link<S>(
    stream: S,
    transmitter: Option<Box<dyn RcTransmitter>>,
    settings: LinkSettings,
    events: mpsc::Sender<LinkEvent>,
) -> (mpsc::Sender<LinkCommand>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let reader_task = tokio::spawn(read_frames(reader, inbound_tx));

        let mut link = MspLink::new(writer, inbound_rx, transmitter, settings, events.clone());
        let result = link.run(command_rx).await;

        reader_task.abort();
        if let Some(relay) = link.relay.take() {
            relay.abort();
        }

        if let Err(e) = result {
            error!("Flight controller link failed: {}", e);
            let _ = events.send(LinkEvent::Failed(e.to_string())).await;
        }
    });

    (command_tx, handle)
}

async fn read_frames<R>(mut reader: R, frames: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut parser = MspParser::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "connection closed".to_string(),
            Ok(n) => {
                for frame in parser.feed(&buf[..n]) {
                    if frames.send(Inbound::Frame(frame)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => break e.to_string(),
        }
    };
    debug!("MSP reader stopped: {} ({} CRC errors)", reason, parser.crc_errors());
    let _ = frames.send(Inbound::Closed(reason)).await;
}

struct MspLink<W> {
    writer: W,
    inbound: mpsc::Receiver<Inbound>,
    transmitter: Option<Box<dyn RcTransmitter>>,
    relay: Option<JoinHandle<()>>,
    settings: LinkSettings,
    events: mpsc::Sender<LinkEvent>,
    status: StatusTracker,
    channel_map: ChannelMap,
    channels: RcChannels,
    rssi: u8,
    sent_rssi: Option<u8>,
    in_flight: Option<(u16, Instant)>,
    dirty: bool,
    last_send: Instant,
    ticks: u64,
    stats: LinkStats,
}

impl<W: AsyncWrite + Unpin> MspLink<W> {
    fn new(
        writer: W,
        inbound: mpsc::Receiver<Inbound>,
        transmitter: Option<Box<dyn RcTransmitter>>,
        settings: LinkSettings,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            writer,
            inbound,
            transmitter,
            relay: None,
            settings,
            events,
            status: StatusTracker::new(),
            channel_map: ChannelMap::default(),
            channels: [CHANNEL_UNCHANGED; RC_NUM_CHANNELS],
            rssi: 0,
            sent_rssi: None,
            in_flight: None,
            dirty: false,
            last_send: Instant::now(),
            ticks: 0,
            stats: LinkStats::default(),
        }
    }

    async fn run(&mut self, mut commands: mpsc::Receiver<LinkCommand>) -> Result<()> {
        let info = self.handshake().await?;
        info!("Flight controller handshake complete");
        debug!("Flight controller: {:?}", info);
        self.upload_mission().await?;

        self.channel_map = info.channel_map;
        self.channels = initial_channels(&info);
        self.emit(LinkEvent::Connected(info)).await?;

        if let Some(tx) = self.transmitter.as_mut() {
            self.relay = tx.telemetry_relay();
        }
        self.push_channels().await?;
        info!(
            "RC init done via {}",
            self.transmitter.as_ref().map_or("MSP", |tx| tx.name())
        );

        let mut resend = interval(self.settings.min_send);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();
        let mut stats = interval_at(started + STATS_INTERVAL, STATS_INTERVAL);

        loop {
            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Frame(frame)) => self.handle_frame(frame).await?,
                    Some(Inbound::Closed(reason)) => return Err(BridgeError::LinkClosed(reason)),
                    None => return Err(BridgeError::LinkClosed("MSP reader stopped".into())),
                },
                command = commands.recv() => match command {
                    Some(LinkCommand::Channels(update)) => {
                        if merge_channels(&mut self.channels, &update, &self.channel_map) {
                            debug!("{}", format_channels(&self.channels, &self.channel_map));
                        }
                        self.dirty = true;
                        self.push_channels().await?;
                    }
                    Some(LinkCommand::Rssi(rssi)) => {
                        self.rssi = rssi;
                        self.push_rssi_if_changed().await?;
                    }
                    None => {
                        debug!("Link command channel closed");
                        return Ok(());
                    }
                },
                _ = resend.tick() => {
                    self.expire_in_flight();
                    if self.dirty || self.last_send.elapsed() >= self.settings.min_send {
                        self.push_channels().await?;
                    }
                }
                _ = stats.tick() => {
                    debug!(
                        "Stats {}s: frames {} status {} RSSI {}",
                        started.elapsed().as_secs(),
                        self.stats.frames,
                        self.stats.status_polls,
                        self.stats.rssi_updates
                    );
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<FcInfo> {
        let mut info = FcInfo::default();
        for cmd in HANDSHAKE_SEQUENCE {
            match self.exchange(cmd, &request_payload(cmd)).await? {
                Some(frame) => info.apply(&frame),
                None => warn!("No usable reply to MSP command {}, using defaults", cmd),
            }
        }
        Ok(info)
    }

    /// Store the mission, one waypoint per exchange
    ///
    /// Stops at the first waypoint the flight controller does not accept.
    async fn upload_mission(&mut self) -> Result<()> {
        let mission = std::mem::take(&mut self.settings.mission);
        if mission.is_empty() {
            return Ok(());
        }
        if mission.len() > MAX_WAYPOINTS {
            warn!(
                "Mission has {} waypoints, uploading the first {}",
                mission.len(),
                MAX_WAYPOINTS
            );
        }
        let count = mission.len().min(MAX_WAYPOINTS);
        let mut stored = 0;
        for (i, wp) in mission.iter().take(count).enumerate() {
            let payload = encode_waypoint(i as u8 + 1, wp, i + 1 == count);
            if self.exchange(MSP_SET_WP, &payload).await?.is_none() {
                warn!("Flight controller refused waypoint {}", i + 1);
                break;
            }
            stored += 1;
        }
        info!("Uploaded mission ({}/{} waypoints)", stored, count);
        Ok(())
    }

    /// Send `cmd` and wait for its reply, ignoring anything else
    async fn exchange(&mut self, cmd: u16, payload: &[u8]) -> Result<Option<MspFrame>> {
        self.write_frame(cmd, payload).await?;
        let deadline = Instant::now() + HANDSHAKE_STEP_TIMEOUT;
        loop {
            match timeout_at(deadline, self.inbound.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(BridgeError::LinkClosed("MSP reader stopped".into())),
                Ok(Some(Inbound::Closed(reason))) => return Err(BridgeError::LinkClosed(reason)),
                Ok(Some(Inbound::Frame(frame))) if frame.cmd == cmd => {
                    return Ok(frame.is_ok().then_some(frame));
                }
                Ok(Some(Inbound::Frame(frame))) => {
                    warn!("MSP unsolicited {}, length {}", frame.cmd, frame.len());
                }
            }
        }
    }

    async fn write_frame(&mut self, cmd: u16, payload: &[u8]) -> Result<()> {
        self.writer.write_all(&encode_request(cmd, payload)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn request(&mut self, cmd: u16, payload: &[u8]) -> Result<()> {
        self.write_frame(cmd, payload).await?;
        self.in_flight = Some((cmd, Instant::now()));
        Ok(())
    }

    async fn emit(&mut self, event: LinkEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| BridgeError::LinkClosed("orchestrator stopped listening".into()))
    }

    fn expire_in_flight(&mut self) {
        if let Some((cmd, sent)) = self.in_flight {
            if sent.elapsed() >= REPLY_TIMEOUT {
                warn!("No reply to MSP command {} after {:?}", cmd, REPLY_TIMEOUT);
                self.in_flight = None;
            }
        }
    }

    async fn push_channels(&mut self) -> Result<()> {
        if self.channels.contains(&CHANNEL_NO_PULSE) {
            // Signal loss: keep quiet on the RC path, keep polling status
            self.last_send = Instant::now();
            self.dirty = false;
            if self.in_flight.is_none() {
                self.query_status().await?;
            }
            return Ok(());
        }

        if let Some(tx) = self.transmitter.as_mut() {
            self.last_send = tx.send(&self.channels, self.settings.nchan).await?;
            self.dirty = false;
            self.stats.frames += 1;
            return self.channels_delivered().await;
        }

        if self.in_flight.is_some() {
            return Ok(());
        }
        let payload = raw_rc_payload(&self.channels, self.settings.nchan);
        self.request(MSP_SET_RAW_RC, &payload).await?;
        self.last_send = Instant::now();
        self.dirty = false;
        self.stats.frames += 1;
        Ok(())
    }

    async fn channels_delivered(&mut self) -> Result<()> {
        self.ticks += 1;
        if self.in_flight.is_some() {
            return Ok(());
        }
        if self.ticks % STATUS_POLL_EVERY == 0 {
            self.query_status().await
        } else {
            self.push_rssi_if_changed().await
        }
    }

    async fn query_status(&mut self) -> Result<()> {
        self.stats.status_polls += 1;
        self.request(MSP2_INAV_STATUS, &[]).await
    }

    async fn push_rssi_if_changed(&mut self) -> Result<()> {
        if self.in_flight.is_some() || self.sent_rssi == Some(self.rssi) {
            return Ok(());
        }
        self.sent_rssi = Some(self.rssi);
        self.stats.rssi_updates += 1;
        self.request(MSP_SET_TX_INFO, &[rssi_to_tx_info(self.rssi)]).await
    }

    async fn handle_frame(&mut self, frame: MspFrame) -> Result<()> {
        if matches!(self.in_flight, Some((cmd, _)) if cmd == frame.cmd) {
            self.in_flight = None;
        }
        if !frame.is_ok() {
            warn!("Flight controller rejected MSP command {}", frame.cmd);
        }

        match frame.cmd {
            MSP_SET_RAW_RC => self.channels_delivered().await?,
            MSP2_INAV_STATUS if frame.is_ok() => {
                match StatusReport::parse(&frame.payload) {
                    Ok(report) => {
                        for status in self.status.update(report) {
                            info!("Flight controller status: {:?}", status);
                            self.emit(LinkEvent::Status(status)).await?;
                        }
                    }
                    Err(e) => warn!("{}", e),
                }
                self.push_rssi_if_changed().await?;
            }
            MSP2_INAV_STATUS | MSP_SET_TX_INFO => {}
            other => debug!("MSP unsolicited {}, length {}", other, frame.len()),
        }

        if self.dirty && self.in_flight.is_none() {
            self.push_channels().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rx::MockRcTransmitter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_initial_channels() {
        let mut info = FcInfo::default();
        let ch = initial_channels(&info);
        assert_eq!(&ch[..4], &[1500, 1500, 1500, 999]);
        assert!(ch[4..].iter().all(|&v| v == 1001));

        info.bypass = true;
        info.channel_map = ChannelMap::from_rx_map(&[1, 2, 3, 0]).unwrap();
        let ch = initial_channels(&info);
        assert_eq!(&ch[..4], &[999, 1500, 1500, 1999]);
    }

    #[test]
    fn test_merge_honours_unchanged() {
        let map = ChannelMap::default();
        let mut current = [1500u16; 16];
        let mut update = [CHANNEL_UNCHANGED; 16];
        update[0] = 1600;

        assert!(!merge_channels(&mut current, &update, &map));
        assert_eq!(current[0], 1600);
        assert_eq!(current[1], 1500);

        update[6] = 1900;
        assert!(merge_channels(&mut current, &update, &map));
        assert_eq!(current[6], 1900);

        // Same values again: nothing changes
        assert!(!merge_channels(&mut current, &update, &map));
    }

    #[test]
    fn test_merge_flags_failsafe_throttle() {
        let map = ChannelMap::default();
        let mut current = [1500u16; 16];
        let mut update = [CHANNEL_UNCHANGED; 16];
        update[3] = 800;
        assert!(merge_channels(&mut current, &update, &map));
    }

    #[test]
    fn test_rssi_scaling() {
        assert_eq!(rssi_to_tx_info(0), 0);
        assert_eq!(rssi_to_tx_info(50), 127);
        assert_eq!(rssi_to_tx_info(100), 255);
        assert_eq!(rssi_to_tx_info(150), 255);
    }

    #[test]
    fn test_raw_rc_payload() {
        let payload = raw_rc_payload(&[1500; 16], 4);
        assert_eq!(payload, vec![0xDC, 0x05, 0xDC, 0x05, 0xDC, 0x05, 0xDC, 0x05]);
        assert_eq!(raw_rc_payload(&[1500; 16], 18).len(), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_fc_uses_defaults_and_drives_transmitter() {
        let (ours, _theirs) = tokio::io::duplex(64 * 1024);
        let sends = Arc::new(AtomicUsize::new(0));

        let mut tx = MockRcTransmitter::new();
        tx.expect_name().return_const("MOCK");
        tx.expect_telemetry_relay().returning(|| None);
        let counter = Arc::clone(&sends);
        tx.expect_send().returning(move |channels, nchan| {
            assert_eq!(nchan, 8);
            assert_eq!(channels[3], 999);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Instant::now())
        });

        let (events_tx, mut events) = mpsc::channel(8);
        let settings = LinkSettings {
            nchan: 8,
            ..LinkSettings::default()
        };
        let (commands, handle) = spawn_link(ours, Some(Box::new(tx)), settings, events_tx);

        match events.recv().await {
            Some(LinkEvent::Connected(info)) => {
                assert_eq!(info.channel_map, ChannelMap::default());
                assert!(!info.bypass);
            }
            other => panic!("expected Connected, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(commands);
        handle.await.unwrap();

        assert!(sends.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_closed_stream_reports_failure() {
        let (ours, theirs) = tokio::io::duplex(1024);
        drop(theirs);

        let (events_tx, mut events) = mpsc::channel(8);
        let (_commands, handle) = spawn_link(ours, None, LinkSettings::default(), events_tx);

        assert!(matches!(events.recv().await, Some(LinkEvent::Failed(_))));
        handle.await.unwrap();
    }
}
