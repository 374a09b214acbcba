//! # Telemetry Relay
//!
//! Re-exposes whatever the flight controller writes to an emulated
//! receiver port as UDP datagrams, so a ground station can listen for
//! SmartPort/CRSF/IBUS telemetry without owning the TCP socket.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Read buffer size; receiver telemetry frames are small
const RELAY_BUFFER_SIZE: usize = 256;

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// No UDP socket; the receiver connection is untouched
    Unavailable,
    /// The receiver connection hit EOF or a read error
    ReaderClosed,
}

/// Forward bytes from `reader` to `target` until the reader fails.
///
/// The datagrams leave from an ephemeral local port. A failed datagram is
/// dropped. The relay never reports an error; the owner of the receiver
/// connection decides what [`RelayExit::ReaderClosed`] means for it.
pub async fn forward_telemetry<R>(
    name: &'static str,
    mut reader: R,
    target: SocketAddr,
) -> RelayExit
where
    R: AsyncRead + Unpin,
{
    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("{} telemetry relay: cannot bind UDP socket: {}", name, e);
            return RelayExit::Unavailable;
        }
    };
    info!("{} telemetry relayed to udp://{}", name, target);

    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    let mut forwarded: u64 = 0;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("{} telemetry EOF after {} bytes", name, forwarded);
                return RelayExit::ReaderClosed;
            }
            Ok(n) => {
                if let Err(e) = socket.send_to(&buf[..n], target).await {
                    debug!("{} telemetry datagram dropped: {}", name, e);
                }
                forwarded += n as u64;
            }
            Err(e) => {
                debug!("{} telemetry read failed: {}", name, e);
                return RelayExit::ReaderClosed;
            }
        }
    }
}
