//! Deferred packets
//!
//! With deferral enabled, the packet that created a state is held until the
//! peer acknowledges the insert, so a reply routed through the peer finds
//! the state there. A held packet is released when the acknowledgment
//! arrives, when the state changes again locally, when the timer runs out,
//! or when the bucket holds too many.

use std::sync::Arc;

use bytes::Bytes;

use super::stats::bump;
use super::timer::TimerHandle;
use super::{HeldPacket, Outbound, SyncEngine};
use crate::state::{flags, ReplicatedState};

/// One held packet
#[derive(Debug)]
pub struct Deferral {
    pub(crate) state: Arc<ReplicatedState>,
    packet: Bytes,
    token: u64,
    timer: TimerHandle,
}

impl Deferral {
    fn into_packet(self) -> HeldPacket {
        self.timer.cancel();
        self.state.clear_flag(flags::ACK);
        HeldPacket {
            data: self.packet,
            skip_filter: true,
        }
    }
}

impl SyncEngine {
    /// Hold `packet` until the insert of `st` is acknowledged
    ///
    /// Returns false if deferral is disabled, in which case the caller
    /// forwards the packet itself.
    pub fn defer(&self, st: &Arc<ReplicatedState>, packet: Bytes) -> bool {
        if !self.config.defer || st.has_flag(flags::NOSYNC) {
            return false;
        }

        let bucket = self.bucket_for(st.id());
        let token = self.next_token();
        let index = bucket.index;

        let overflow = {
            let mut inner = bucket.lock();
            let overflow = if inner.deferrals.len() >= self.config.defer_limit {
                inner.deferrals.pop_front()
            } else {
                None
            };

            st.set_flag(flags::ACK);
            let timer = self.spawn_timer(self.config.defer_timeout(), move |engine| {
                engine.defer_expired(index, token);
            });
            inner.deferrals.push_back(Deferral {
                state: st.clone(),
                packet,
                token,
                timer,
            });
            overflow
        };

        if let Some(oldest) = overflow {
            bump(&self.stats.defer_overflow);
            tracing::debug!(
                "Deferral limit reached, releasing {:016x}",
                oldest.state.id()
            );
            self.release(oldest);
        }

        bump(&self.stats.deferred);
        self.request_push(bucket);
        true
    }

    /// Release the packet held for `st`, if any
    pub fn undefer_state(&self, st: &Arc<ReplicatedState>) -> bool {
        let bucket = self.bucket_for(st.id());
        let deferral = {
            let mut inner = bucket.lock();
            match inner
                .deferrals
                .iter()
                .position(|d| Arc::ptr_eq(&d.state, st))
            {
                Some(pos) => inner.deferrals.remove(pos),
                None => None,
            }
        };

        match deferral {
            Some(deferral) => {
                bump(&self.stats.defer_acked);
                self.release(deferral);
                true
            }
            None => {
                st.clear_flag(flags::ACK);
                false
            }
        }
    }

    fn defer_expired(&self, index: usize, token: u64) {
        let deferral = {
            let mut inner = self.buckets[index].lock();
            match inner.deferrals.iter().position(|d| d.token == token) {
                Some(pos) => inner.deferrals.remove(pos),
                // Released by another path first
                None => None,
            }
        };

        if let Some(deferral) = deferral {
            bump(&self.stats.defer_timeouts);
            tracing::trace!("Deferral of {:016x} timed out", deferral.state.id());
            self.release(deferral);
        }
    }

    fn release(&self, deferral: Deferral) {
        self.transmit(Outbound::Release(deferral.into_packet()));
    }
}
