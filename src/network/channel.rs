//! In-process transport
//!
//! Connects two engines without sockets. Used by tests and by embedders
//! that run both ends of a link in one process.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::Transport;
use crate::error::{Error, Result};
use crate::sync::HeldPacket;

/// One end of an in-process link
pub struct ChannelTransport {
    local: SocketAddr,
    tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    rx: Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
    link_up: AtomicBool,
    sent: AtomicU64,
    released: StdMutex<Vec<HeldPacket>>,
}

impl ChannelTransport {
    /// Create both ends of a link
    pub fn pair() -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        let left = Self::end(1, right_tx, left_rx);
        let right = Self::end(2, left_tx, right_rx);
        (left, right)
    }

    fn end(
        n: u8,
        tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
        rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    ) -> Self {
        Self {
            local: SocketAddr::new(Ipv4Addr::new(127, 0, 0, n).into(), 8240),
            tx,
            rx: Mutex::new(rx),
            link_up: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            released: StdMutex::new(Vec::new()),
        }
    }

    /// While down, datagrams sent from this end are silently lost
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }

    /// Datagrams delivered to the other end
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Take the packets released back to the data path so far
    pub fn take_released(&self) -> Vec<HeldPacket> {
        std::mem::take(&mut *self.released.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, datagram: Bytes) -> Result<()> {
        if !self.link_up.load(Ordering::Acquire) {
            return Ok(());
        }
        self.tx
            .send((self.local, datagram))
            .map_err(|_| Error::TransportClosed)?;
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn reinject(&self, packet: HeldPacket) -> Result<()> {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet);
        Ok(())
    }

    async fn recv(&self) -> Result<(SocketAddr, Bytes)> {
        self.rx.lock().await.recv().await.ok_or(Error::TransportClosed)
    }
}
