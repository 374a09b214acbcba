//! # RC Receiver Emulation
//!
//! Emulates a hobby radio receiver wired to the flight controller's serial
//! RX port (exposed by the simulator as a TCP socket).
//!
//! This module handles:
//! - Channel frame encoding for SBUS, IBUS, CRSF and Jeti EX Bus
//! - One TCP connection per receiver, opened at construction
//! - Relaying telemetry the flight controller writes back to the receiver
//!   port as UDP datagrams for a ground station

pub mod crsf;
pub mod ibus;
pub mod jeti;
pub mod packing;
pub mod relay;
pub mod sbus;

pub use relay::RelayExit;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Number of RC channels carried in a frame
pub const RC_NUM_CHANNELS: usize = 16;

/// RC channel frame: pulse widths in microseconds
pub type RcChannels = [u16; RC_NUM_CHANNELS];

/// Channel value meaning "leave this channel as it is"
pub const CHANNEL_UNCHANGED: u16 = 0xFFFF;

/// Throttle value meaning "stop sending frames" (signal loss)
pub const CHANNEL_NO_PULSE: u16 = 0xD0D0;

/// Which wire protocol carries RC channels to the flight controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RxProtocol {
    /// MSP_SET_RAW_RC over the configuration link
    #[default]
    Msp,
    Sbus,
    Ibus,
    Crsf,
    Jeti,
}

impl fmt::Display for RxProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RxProtocol::Msp => "msp",
            RxProtocol::Sbus => "sbus",
            RxProtocol::Ibus => "ibus",
            RxProtocol::Crsf => "crsf",
            RxProtocol::Jeti => "jeti",
        };
        f.write_str(name)
    }
}

impl FromStr for RxProtocol {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "msp" => Ok(RxProtocol::Msp),
            "sbus" => Ok(RxProtocol::Sbus),
            "ibus" => Ok(RxProtocol::Ibus),
            "crsf" => Ok(RxProtocol::Crsf),
            "jeti" => Ok(RxProtocol::Jeti),
            other => Err(BridgeError::Rx(format!("unknown RX protocol '{}'", other))),
        }
    }
}

/// Turns a channel frame into protocol bytes
pub trait FrameEncoder: Send + Sync + 'static {
    /// Protocol name for logs
    const NAME: &'static str;

    /// Encode one complete, checksummed frame
    fn encode(&self, channels: &RcChannels, nchan: usize) -> Vec<u8>;

    /// Extra bytes the receiver sends after `frame`, if any
    fn follow_up(&self, _frame: &[u8]) -> Option<&'static [u8]> {
        None
    }
}

/// Something that can put an RC channel frame on the wire
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RcTransmitter: Send {
    /// Protocol name for logs
    fn name(&self) -> &'static str;

    /// Encode and transmit one frame; returns the send time
    async fn send(&mut self, channels: &RcChannels, nchan: usize) -> Result<Instant>;

    /// Start relaying inbound receiver-port bytes as UDP telemetry.
    ///
    /// Once the relay sees the connection close, later sends fail and the
    /// connection is shut down. Returns `None` if the relay is already
    /// running or not available.
    fn telemetry_relay(&mut self) -> Option<JoinHandle<()>>;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A receiver connection driven by one [`FrameEncoder`]
pub struct RxLink<E: FrameEncoder> {
    encoder: E,
    writer: BoxedWriter,
    reader: Option<BoxedReader>,
    relay_target: Option<SocketAddr>,
    reader_closed: Option<oneshot::Receiver<()>>,
    frames_sent: u64,
}

impl<E: FrameEncoder> fmt::Debug for RxLink<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxLink")
            .field("protocol", &E::NAME)
            .field("relay_target", &self.relay_target)
            .field("frames_sent", &self.frames_sent)
            .finish_non_exhaustive()
    }
}

impl<E: FrameEncoder> RxLink<E> {
    /// Connect to the receiver port at `remote`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Rx`] if the address cannot be resolved or the
    /// connection is refused.
    pub async fn connect(encoder: E, remote: &str) -> Result<Self> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| BridgeError::Rx(format!("{} connect to {}: {}", E::NAME, remote, e)))?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();

        info!("Connected {} receiver to {}", E::NAME, remote);
        Ok(Self::from_parts(encoder, reader, writer, Some(local)))
    }

    /// Build from an already-open byte stream
    pub fn from_parts<R, W>(encoder: E, reader: R, writer: W, relay_target: Option<SocketAddr>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            encoder,
            writer: Box::new(writer),
            reader: Some(Box::new(reader)),
            relay_target,
            reader_closed: None,
            frames_sent: 0,
        }
    }
}

#[async_trait]
impl<E: FrameEncoder> RcTransmitter for RxLink<E> {
    fn name(&self) -> &'static str {
        E::NAME
    }

    async fn send(&mut self, channels: &RcChannels, nchan: usize) -> Result<Instant> {
        if let Some(closed) = self.reader_closed.as_mut() {
            if closed.try_recv().is_ok() {
                self.reader_closed = None;
                let _ = self.writer.shutdown().await;
                return Err(BridgeError::LinkClosed(format!(
                    "{} receiver connection closed",
                    E::NAME
                )));
            }
        }

        let frame = self.encoder.encode(channels, nchan);
        self.writer.write_all(&frame).await?;
        if let Some(extra) = self.encoder.follow_up(&frame) {
            self.writer.write_all(extra).await?;
        }
        self.writer.flush().await?;

        self.frames_sent += 1;
        debug!("Sent {} frame ({} bytes)", E::NAME, frame.len());
        Ok(Instant::now())
    }

    fn telemetry_relay(&mut self) -> Option<JoinHandle<()>> {
        let target = self.relay_target?;
        let reader = self.reader.take()?;
        let (closed_tx, closed_rx) = oneshot::channel();
        self.reader_closed = Some(closed_rx);
        Some(tokio::spawn(async move {
            let exit = relay::forward_telemetry(E::NAME, reader, target).await;
            if exit == RelayExit::ReaderClosed {
                let _ = closed_tx.send(());
            }
        }))
    }
}

/// Open the receiver connection for `protocol`.
///
/// Returns `Ok(None)` for [`RxProtocol::Msp`], where channels travel on
/// the configuration link itself.
pub async fn open_transmitter(
    protocol: RxProtocol,
    remote: &str,
) -> Result<Option<Box<dyn RcTransmitter>>> {
    let tx: Box<dyn RcTransmitter> = match protocol {
        RxProtocol::Msp => return Ok(None),
        RxProtocol::Sbus => Box::new(RxLink::connect(sbus::SbusEncoder, remote).await?),
        RxProtocol::Ibus => Box::new(RxLink::connect(ibus::IbusEncoder, remote).await?),
        RxProtocol::Crsf => Box::new(RxLink::connect(crsf::CrsfEncoder, remote).await?),
        RxProtocol::Jeti => Box::new(RxLink::connect(jeti::JetiEncoder, remote).await?),
    };
    Ok(Some(tx))
}
