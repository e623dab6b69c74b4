//! Payload-type sniffing: join a multicast group, wait for one RTP packet
//! and read the payload type out of its header.
//!
//! Nothing is sent to the group; the socket only lives for one detection.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::endpoint::StreamEndpoint;

/// Size of the fixed RTP header (RFC 3550 §5.1).
pub const RTP_HEADER_LEN: usize = 12;

/// Large enough for a jumbo-frame datagram.
const RECV_BUFFER_LEN: usize = 9000;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("cannot bind UDP port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("cannot join multicast group {group}: {source}")]
    Join { group: Ipv4Addr, source: io::Error },
    #[error("no RTP packet from {endpoint} within {timeout:?}")]
    Timeout {
        endpoint: StreamEndpoint,
        timeout: Duration,
    },
    #[error("invalid RTP packet: too short ({len} bytes)")]
    MalformedPacket { len: usize },
    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
}

/// Extract the 7-bit payload type from an RTP datagram.
///
/// The high bit of the second byte is the marker bit and is ignored.
pub fn payload_type(datagram: &[u8]) -> Result<u8, DetectError> {
    if datagram.len() < RTP_HEADER_LEN {
        return Err(DetectError::MalformedPacket {
            len: datagram.len(),
        });
    }
    Ok(datagram[1] & 0x7F)
}

/// Something that can tell which payload type an endpoint carries.
///
/// Detection blocks, so callers on an async runtime should run it on the
/// blocking pool.
pub trait PayloadDetector: Send + Sync {
    fn detect(&self, endpoint: &StreamEndpoint, timeout: Duration) -> Result<u8, DetectError>;
}

/// Detector that listens on the real network.
#[derive(Debug, Clone)]
pub struct MulticastDetector {
    interface: Ipv4Addr,
}

impl MulticastDetector {
    /// `interface` is the local address used for the group join; the
    /// wildcard interface is tried if that fails.
    pub fn new(interface: Ipv4Addr) -> Self {
        Self { interface }
    }

    fn open_socket(&self, endpoint: &StreamEndpoint) -> Result<UdpSocket, DetectError> {
        let port = endpoint.port();
        let bind_err = |source| DetectError::Bind { port, source };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .map_err(bind_err)?;

        let group = endpoint.address();
        if let Err(e) = socket.join_multicast_v4(&group, &self.interface) {
            warn!(
                "Joining {group} on {} failed ({e}), retrying on the default interface",
                self.interface
            );
            socket
                .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .map_err(|_| DetectError::Join { group, source: e })?;
        }

        Ok(socket.into())
    }
}

impl PayloadDetector for MulticastDetector {
    fn detect(&self, endpoint: &StreamEndpoint, timeout: Duration) -> Result<u8, DetectError> {
        debug!("Sniffing {endpoint} for an RTP header (timeout={timeout:?})");
        // Dropped on every return path below, which leaves the group.
        let socket = self.open_socket(endpoint)?;
        let pt = receive_payload_type(&socket, endpoint, timeout)?;
        info!("Detected payload type {pt} for {endpoint}");
        Ok(pt)
    }
}

/// Wait up to `timeout` for a single datagram on `socket` and classify it.
pub fn receive_payload_type(
    socket: &UdpSocket,
    endpoint: &StreamEndpoint,
    timeout: Duration,
) -> Result<u8, DetectError> {
    socket.set_read_timeout(Some(timeout))?;

    let mut buf = [0u8; RECV_BUFFER_LEN];
    let len = match socket.recv(&mut buf) {
        Ok(len) => len,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            return Err(DetectError::Timeout {
                endpoint: *endpoint,
                timeout,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let datagram = &buf[..len];
    let pt = payload_type(datagram)?;
    debug!(
        "Received {len} bytes from {endpoint}, header {}",
        hex(&datagram[..RTP_HEADER_LEN])
    );
    Ok(pt)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
