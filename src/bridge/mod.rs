//! # Replay Orchestrator
//!
//! Wires one replay session together:
//!
//! ```text
//! log file -> LogSource -> replay scheduler -> orchestrator -> simulator sender (UDP)
//!                                   ^              |
//!                        start gate |              +-> MSP link -> flight controller (TCP)
//!                                   |              |        \-> RC encoder (TCP)
//!                                   +--------------+
//!                              operator keys, SIGINT/SIGTERM
//! ```
//!
//! Every component runs as its own task and talks to the orchestrator
//! over bounded channels. The orchestrator loop is the only place that
//! holds the channel frame and the arming state (inside
//! [`ReplayController`]).

pub mod controller;
pub mod operator;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use controller::{Action, ReplayController, SessionPhase};
pub use operator::OperatorCommand;

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::logsource::{FlightMeta, LogSource};
use crate::msp::{spawn_link, LinkCommand, LinkEvent, LinkSettings, Waypoint};
use crate::replay::{run_scheduler, SimulationSample};
use crate::rx::open_transmitter;
use crate::sim::{self, SimHandshake, SimulatorProcess};

/// How long a shutdown waits for the flight controller to confirm disarm
pub const DISARM_WAIT: Duration = Duration::from_secs(5);

/// Idle wakeup of the orchestrator loop
pub const LOOP_TICK: Duration = Duration::from_millis(100);

const CONNECT_RETRY: Duration = Duration::from_millis(500);

const LOG_QUEUE_DEPTH: usize = 64;
const SAMPLE_QUEUE_DEPTH: usize = 16;
const EVENT_QUEUE_DEPTH: usize = 16;
const OPERATOR_QUEUE_DEPTH: usize = 8;

/// Replay `log_path` through the configured simulator and flight controller
///
/// Starts the simulator (unless disabled), runs the session, and always
/// stops the simulator again before returning.
///
/// # Errors
///
/// Returns error if the log cannot be read, the listener cannot be opened,
/// the simulator cannot be started, or the flight-controller link fails.
pub async fn run(config: &Config, log_path: &Path) -> Result<()> {
    let (meta, source) = LogSource::open(log_path).await?;
    let socket = sim::bind(&config.simulator.listen).await?;

    let process = if config.simulator.auto_start {
        Some(SimulatorProcess::spawn(&config.simulator)?)
    } else {
        info!("Simulator auto-start disabled, waiting for an external one");
        None
    };

    let (operator_tx, operator_rx) = mpsc::channel(OPERATOR_QUEUE_DEPTH);
    let keyboard = operator::spawn_keyboard(operator_tx.clone());
    let signals = tokio::spawn(operator::watch_signals(operator_tx));

    let result = replay(config, meta, source, socket, operator_rx).await;

    signals.abort();
    drop(keyboard);

    if let Some(process) = process {
        if let Err(e) = process.terminate().await {
            warn!("Failed to stop simulator: {}", e);
        }
    }
    match &result {
        Ok(()) => info!("Session terminated"),
        Err(e) => error!("Session terminated: {}", e),
    }
    result
}

/// Run a session over an already opened log and simulator socket
///
/// Returns once the replay has ended and the craft is disarmed (or the
/// disarm wait expired), when the operator quits, or when the
/// flight-controller link fails.
pub async fn replay<R>(
    config: &Config,
    meta: FlightMeta,
    source: LogSource<R>,
    socket: Arc<UdpSocket>,
    operator: mpsc::Receiver<OperatorCommand>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut session = Session::new(config, socket);
    let result = session.run(meta, source, operator).await;
    session.teardown();
    result
}

struct Session<'a> {
    config: &'a Config,
    controller: ReplayController,
    socket: Arc<UdpSocket>,
    gate: Option<oneshot::Sender<()>>,
    sim_samples: Option<mpsc::Sender<SimulationSample>>,
    pending_sample: Option<SimulationSample>,
    fed_first: bool,
    link: Option<mpsc::Sender<LinkCommand>>,
    mission: Vec<Waypoint>,
    disarm_deadline: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
}

impl<'a> Session<'a> {
    fn new(config: &'a Config, socket: Arc<UdpSocket>) -> Self {
        Self {
            config,
            controller: ReplayController::new(config.replay.auto_arm, config.replay.failsafe),
            socket,
            gate: None,
            sim_samples: None,
            pending_sample: None,
            fed_first: false,
            link: None,
            mission: Vec::new(),
            disarm_deadline: None,
            tasks: Vec::new(),
        }
    }

    async fn run<R>(
        &mut self,
        meta: FlightMeta,
        source: LogSource<R>,
        mut operator: mpsc::Receiver<OperatorCommand>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let fc_address = resolve(&self.config.link.address).await?;
        self.mission = meta.mission.clone();

        let (log_tx, log_rx) = mpsc::channel(LOG_QUEUE_DEPTH);
        let (sample_tx, mut samples) = mpsc::channel(SAMPLE_QUEUE_DEPTH);
        let (gate_tx, gate_rx) = oneshot::channel();
        self.gate = Some(gate_tx);

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = source.stream_into(log_tx).await {
                error!("Log read failed: {}", e);
            }
        }));
        let acc_1g = meta.acc_scale();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = run_scheduler(log_rx, sample_tx, gate_rx, acc_1g).await {
                error!("Replay scheduler failed: {}", e);
            }
        }));

        let (handshake_tx, mut handshake) = oneshot::channel();
        self.tasks
            .push(tokio::spawn(sim::run_reader(Arc::clone(&self.socket), handshake_tx)));
        self.controller.set_phase(SessionPhase::AwaitingHandshake);

        let (connect_tx, mut connected) = oneshot::channel();
        let mut connect_tx = Some(connect_tx);
        let (link_events_tx, mut link_events) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let mut sim_ready = false;
        let mut link_started = false;
        let mut samples_open = true;
        let mut operator_open = true;

        let mut tick = interval(LOOP_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.controller.phase() == SessionPhase::Terminated {
                return Ok(());
            }

            tokio::select! {
                hs = &mut handshake, if !sim_ready => {
                    sim_ready = true;
                    let hs = hs.map_err(|_| {
                        BridgeError::Simulator("listener stopped before the handshake".into())
                    })?;
                    self.start_sim_sender(hs).await;

                    let patience = Duration::from_secs(self.config.link.connect_timeout_s);
                    if let Some(tx) = connect_tx.take() {
                        self.tasks.push(tokio::spawn(async move {
                            let _ = tx.send(connect_with_retry(fc_address, patience).await);
                        }));
                    }
                }

                stream = &mut connected, if sim_ready && !link_started => {
                    link_started = true;
                    let stream = stream.map_err(|_| {
                        BridgeError::LinkClosed("connector stopped".into())
                    })??;
                    self.start_link(stream, link_events_tx.clone()).await?;
                }

                Some(event) = link_events.recv() => match event {
                    LinkEvent::Connected(info) => {
                        let actions = self.controller.on_connected(&info);
                        self.dispatch(actions).await;
                    }
                    LinkEvent::Status(status) => {
                        let actions = self.controller.on_status(status);
                        self.dispatch(actions).await;
                    }
                    LinkEvent::Failed(reason) => {
                        error!("Flight controller link lost: {}", reason);
                        return Err(BridgeError::LinkClosed(reason));
                    }
                },

                sample = samples.recv(), if samples_open => match sample {
                    Some(sample) if sample.is_end() => {
                        info!("Replay complete");
                        samples_open = false;
                        self.shutdown().await;
                    }
                    Some(sample) => {
                        self.feed_simulator(sample).await;
                        let actions = self.controller.on_sample(&sample);
                        self.dispatch(actions).await;
                    }
                    None => {
                        warn!("Replay stopped without an end marker");
                        samples_open = false;
                        self.shutdown().await;
                    }
                },

                command = operator.recv(), if operator_open => match command {
                    Some(OperatorCommand::Arm) => {
                        let actions = self.controller.arm(true);
                        self.dispatch(actions).await;
                    }
                    Some(OperatorCommand::Disarm) => {
                        let actions = self.controller.arm(false);
                        self.dispatch(actions).await;
                    }
                    Some(OperatorCommand::Quit) => {
                        info!("Quit requested");
                        self.shutdown().await;
                    }
                    None => operator_open = false,
                },

                _ = tick.tick() => {
                    if let Some(deadline) = self.disarm_deadline {
                        if Instant::now() >= deadline {
                            warn!("No disarm confirmation after {:?}", DISARM_WAIT);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.link = None;
        self.sim_samples = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("Session tasks stopped");
    }

    async fn start_sim_sender(&mut self, handshake: SimHandshake) {
        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE_DEPTH);
        self.tasks
            .push(tokio::spawn(sim::run_sender(Arc::clone(&self.socket), handshake, rx)));
        self.sim_samples = Some(tx);
        if let Some(first) = self.pending_sample.take() {
            self.feed_simulator(first).await;
        }
    }

    async fn start_link(&mut self, stream: TcpStream, events: mpsc::Sender<LinkEvent>) -> Result<()> {
        let transmitter = open_transmitter(self.config.rx.protocol, &self.config.rx.address).await?;
        if transmitter.is_some() {
            info!(
                "RC via {} receiver at {}",
                self.config.rx.protocol, self.config.rx.address
            );
        }
        let settings = LinkSettings {
            min_send: Duration::from_millis(self.config.link.min_send_ms),
            nchan: self.config.rx.channels,
            mission: std::mem::take(&mut self.mission),
        };
        let (commands, handle) = spawn_link(stream, transmitter, settings, events);
        self.link = Some(commands);
        self.tasks.push(handle);
        Ok(())
    }

    /// Pass a sample on to the simulator, holding it until the simulator
    /// has connected
    async fn feed_simulator(&mut self, sample: SimulationSample) {
        let Some(tx) = self.sim_samples.as_ref() else {
            self.pending_sample = Some(sample);
            return;
        };
        let sample = if self.fed_first {
            sample
        } else {
            self.fed_first = true;
            level_attitude(&sample)
        };
        if tx.send(sample).await.is_err() {
            debug!("Simulator sender gone");
        }
    }

    async fn shutdown(&mut self) {
        let actions = self.controller.begin_shutdown();
        if self.controller.phase() == SessionPhase::Disarming && self.disarm_deadline.is_none() {
            self.disarm_deadline = Some(Instant::now() + DISARM_WAIT);
        }
        self.dispatch(actions).await;
    }

    async fn dispatch(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::OpenGate => {
                    if let Some(gate) = self.gate.take() {
                        info!("Starting replay");
                        let _ = gate.send(());
                    }
                }
                Action::Channels(channels) => self.send_link(LinkCommand::Channels(channels)).await,
                Action::Rssi(rssi) => self.send_link(LinkCommand::Rssi(rssi)).await,
            }
        }
    }

    async fn send_link(&self, command: LinkCommand) {
        if let Some(link) = &self.link {
            if link.send(command).await.is_err() {
                debug!("Link gone, dropped {:?}", command);
            }
        }
    }
}

/// The sample with level attitude and 1 g straight down, for calibration
pub fn level_attitude(sample: &SimulationSample) -> SimulationSample {
    SimulationSample {
        roll: 0.0,
        pitch: 0.0,
        gyro: [0.0; 3],
        acc: [0.0, 0.0, 1.0],
        ..*sample
    }
}

async fn resolve(address: &str) -> Result<std::net::SocketAddr> {
    lookup_host(address)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| BridgeError::AddressResolve(address.to_string()))
}

/// Connect to the flight controller, retrying while it boots
async fn connect_with_retry(address: std::net::SocketAddr, patience: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + patience;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                info!("Connected to flight controller at tcp://{}", address);
                return Ok(stream);
            }
            Err(e) if Instant::now() + CONNECT_RETRY < deadline => {
                debug!("Flight controller not up yet ({}), retrying", e);
                sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(BridgeError::LinkClosed(format!(
                    "cannot connect to {}: {}",
                    address, e
                )))
            }
        }
    }
}
