//! # Simulator Bridge
//!
//! We play the part of X-Plane for the SITL firmware: it subscribes to
//! datarefs over UDP, we answer with vehicle state taken from the log.
//!
//! Two tasks share the socket. The reader collects subscriptions until the
//! handshake sentinel arrives and hands the finished [`DatarefMap`] over
//! once; the sender owns that map from then on and pushes state updates.

pub mod dataref;
pub mod process;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

pub use dataref::{encode_state, DatarefMap, Subscription};
pub use process::SimulatorProcess;

use crate::error::{BridgeError, Result};
use crate::replay::SimulationSample;

/// State is resent at least this often
pub const HEARTBEAT: Duration = Duration::from_millis(500);

const DATAGRAM_SIZE: usize = 512;

/// Result of the simulator handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimHandshake {
    /// Where the firmware's simulator client lives
    pub peer: SocketAddr,
    pub datarefs: DatarefMap,
}

/// Open the local UDP listener
///
/// # Errors
///
/// Returns [`BridgeError::AddressResolve`] for an unresolvable address, or
/// an I/O error if the socket cannot be bound.
pub async fn bind(listen: &str) -> Result<Arc<UdpSocket>> {
    let addr = lookup_host(listen)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| BridgeError::AddressResolve(listen.to_string()))?;
    let socket = UdpSocket::bind(addr).await?;
    info!("Listening for simulator on udp://{}", socket.local_addr()?);
    Ok(Arc::new(socket))
}

/// Read subscriptions until the handshake completes, then drain
///
/// The handshake result is sent once on `connected`. Returns when the
/// socket fails.
pub async fn run_reader(socket: Arc<UdpSocket>, connected: oneshot::Sender<SimHandshake>) {
    let mut buf = [0u8; DATAGRAM_SIZE];
    let mut datarefs = DatarefMap::new();
    let mut connected = Some(connected);

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Simulator socket read failed: {}", e);
                return;
            }
        };
        let Some(sub) = Subscription::parse(&buf[..n]) else {
            trace!("Ignoring {} byte datagram from {}", n, peer);
            continue;
        };
        debug!("Subscribe {} id {} at {} Hz", sub.path, sub.id, sub.freq);

        let Some(tx) = connected.take() else {
            continue;
        };
        if sub.key() == dataref::HANDSHAKE_SENTINEL {
            let missing = datarefs.missing();
            if !missing.is_empty() {
                warn!("Simulator did not subscribe to {:?}", missing);
            }
            info!("Simulator connected from {} ({} datarefs)", peer, datarefs.len());
            let _ = tx.send(SimHandshake {
                peer,
                datarefs: std::mem::take(&mut datarefs),
            });
        } else {
            datarefs.insert(sub.key(), sub.id);
            connected = Some(tx);
        }
    }
}

/// Push state to the simulator: every new sample immediately, and the last
/// sample again whenever [`HEARTBEAT`] passes without one
///
/// Returns when `samples` closes or the socket fails.
pub async fn run_sender(
    socket: Arc<UdpSocket>,
    handshake: SimHandshake,
    mut samples: mpsc::Receiver<SimulationSample>,
) {
    let SimHandshake { peer, datarefs } = handshake;
    let mut last: Option<SimulationSample> = None;
    let mut next_heartbeat = Instant::now() + HEARTBEAT;

    loop {
        let sample = tokio::select! {
            received = samples.recv() => match received {
                Some(sample) => sample,
                None => {
                    debug!("Simulator sender stopped");
                    return;
                }
            },
            _ = sleep_until(next_heartbeat), if last.is_some() => match last {
                Some(sample) => sample,
                None => continue,
            },
        };

        let datagram = encode_state(&datarefs, &sample);
        if let Err(e) = socket.send_to(&datagram, peer).await {
            warn!("Simulator write failed: {}", e);
            return;
        }
        last = Some(sample);
        next_heartbeat = Instant::now() + HEARTBEAT;
    }
}
