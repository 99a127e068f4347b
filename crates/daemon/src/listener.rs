//! UDP intake of ground-station payload summaries.
//!
//! One datagram is one JSON object. Undecodable datagrams are logged and
//! dropped; nothing received here can stop the daemon.

use std::net::SocketAddr;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use sondenotify_core::{DecodeError, SondeObservation};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::engine::TrackerHandle;
use crate::health::IngestionGuard;

/// Largest possible UDP payload.
const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Bind the intake socket.
///
/// The AutoRX summary port is usually shared with other consumers such as
/// chasemapper, so the address and port are bound with reuse enabled.
/// Must be called from within a tokio runtime.
pub fn bind(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    tracing::info!(addr = %socket.local_addr()?, "Listening for payload summaries");
    Ok(socket)
}

/// Receive datagrams until `cancel` fires or the tracker stops.
///
/// Ingestion is reported alive for as long as `alive` is held.
pub async fn run(
    socket: UdpSocket,
    tracker: TrackerHandle,
    alive: IngestionGuard,
    cancel: CancellationToken,
) {
    let _alive = alive;
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Listener stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "UDP receive failed");
                    continue;
                }
            },
        };

        let Some(observation) = decode(&buf[..len], peer) else {
            continue;
        };

        if tracker.observe(observation).await.is_err() {
            tracing::error!("Tracker gone, listener stopping");
            break;
        }
    }
}

/// Decode one datagram, logging why it was dropped if it cannot be used.
pub fn decode(datagram: &[u8], peer: SocketAddr) -> Option<SondeObservation> {
    match SondeObservation::from_datagram(datagram, Utc::now()) {
        Ok(observation) => {
            tracing::trace!(serial = %observation.serial, %peer, "Payload summary received");
            Some(observation)
        }
        Err(DecodeError::UnsupportedType(kind)) => {
            tracing::debug!(%peer, kind = %kind, "Ignoring non-telemetry message");
            None
        }
        Err(e) => {
            tracing::warn!(%peer, bytes = datagram.len(), error = %e, "Dropping undecodable datagram");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn decodes_valid_summary() {
        let datagram = br#"{"type":"PAYLOAD_SUMMARY","callsign":"S1","latitude":1.0,"longitude":2.0,"altitude":3.0,"time":"2024-05-01T12:00:00Z"}"#;
        let observation = decode(datagram, peer()).expect("decodes");
        assert_eq!(observation.serial, "S1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn port_can_be_shared_with_another_consumer() {
        let first = bind("127.0.0.1:0".parse().unwrap()).expect("first bind");
        let addr = first.local_addr().unwrap();
        let second = bind(addr).expect("second bind on the same port");
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn drops_malformed_and_foreign_messages() {
        assert!(decode(b"not json", peer()).is_none());
        assert!(decode(br#"{"type":"OZIMUX"}"#, peer()).is_none());
        assert!(decode(br#"{"callsign":"S1"}"#, peer()).is_none());
    }
}
