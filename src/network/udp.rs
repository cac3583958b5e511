//! UDP transport
//!
//! Sync datagrams travel as UDP payloads, either to a multicast group that
//! every firewall in the cluster joins or to a single unicast peer.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::{Transport, MAX_DATAGRAM};
use crate::config::WolfSyncConfig;
use crate::error::{Error, Result};
use crate::sync::HeldPacket;

/// Multicast TTL; sync traffic is meant for the local link only, and peers
/// can drop anything that arrives with a lower value
const MULTICAST_TTL: u32 = 255;

/// UDP carrier for sync traffic
pub struct UdpTransport {
    socket: UdpSocket,
    destination: SocketAddr,
    released: Option<mpsc::Sender<HeldPacket>>,
}

impl UdpTransport {
    /// Bind the sync socket and join the multicast group if one is used
    pub async fn bind(config: &WolfSyncConfig) -> Result<Self> {
        let bind = config.bind_address()?;
        let destination = config.destination()?;

        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", bind, e)))?;

        if let SocketAddr::V4(group) = destination {
            if group.ip().is_multicast() {
                let interface = config.sync.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
                socket
                    .join_multicast_v4(*group.ip(), interface)
                    .map_err(|e| {
                        Error::Network(format!("Failed to join group {}: {}", group.ip(), e))
                    })?;
                // Our own datagrams are not input
                socket.set_multicast_loop_v4(false)?;
                socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
                tracing::info!("Joined sync group {} on {}", group.ip(), interface);
            }
        }

        tracing::info!(
            "Sync transport bound to {}, sending to {}",
            socket.local_addr()?,
            destination
        );

        Ok(Self {
            socket,
            destination,
            released: None,
        })
    }

    /// Deliver released packets to `tx` instead of dropping them
    pub fn with_release_channel(mut self, tx: mpsc::Sender<HeldPacket>) -> Self {
        self.released = Some(tx);
        self
    }

    /// Local address of the sync socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, datagram: Bytes) -> Result<()> {
        let sent = self
            .socket
            .send_to(&datagram, self.destination)
            .await
            .map_err(|e| Error::Network(format!("Send to {} failed: {}", self.destination, e)))?;
        if sent != datagram.len() {
            return Err(Error::Network(format!(
                "Short send: {} of {} bytes",
                sent,
                datagram.len()
            )));
        }
        Ok(())
    }

    async fn reinject(&self, packet: HeldPacket) -> Result<()> {
        match &self.released {
            Some(tx) => tx.send(packet).await.map_err(|_| Error::TransportClosed),
            None => {
                tracing::trace!(len = packet.data.len(), "No data path attached, dropping released packet");
                Ok(())
            }
        }
    }

    async fn recv(&self) -> Result<(SocketAddr, Bytes)> {
        let mut buf = BytesMut::with_capacity(MAX_DATAGRAM);
        let (_, from) = self.socket.recv_buf_from(&mut buf).await?;
        Ok((from, buf.freeze()))
    }
}
