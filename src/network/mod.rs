//! Network Module
//!
//! Datagram transports carrying sync traffic between peers. The engine only
//! sees the [`Transport`] trait; [`UdpTransport`] is the production carrier
//! and [`ChannelTransport`] connects engines inside one process.

mod channel;
mod udp;

pub use channel::ChannelTransport;
pub use udp::UdpTransport;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::sync::HeldPacket;

/// Largest datagram accepted from the network
pub const MAX_DATAGRAM: usize = 65_535;

/// Carrier for sync datagrams
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to the peer or group
    async fn send(&self, datagram: Bytes) -> Result<()>;

    /// Hand a released packet back to the local data path
    async fn reinject(&self, packet: HeldPacket) -> Result<()>;

    /// Wait for the next datagram from a peer
    async fn recv(&self) -> Result<(SocketAddr, Bytes)>;
}
