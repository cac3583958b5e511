//! Replicated State
//!
//! [`ReplicatedState`] is the engine's view of one connection-state entry.
//! Identity fields are immutable; the sync bookkeeping lives in atomics that
//! are only written while the owning bucket's lock is held, and the record
//! content sits behind its own small mutex so producers can refresh it
//! while the state is queued.

mod table;

pub use table::{MemoryStateTable, StateTable};

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::wire::record::{tcp, timeout};
use crate::wire::{PeerState, StateRecord};

/// IP protocol number of TCP
pub const IPPROTO_TCP: u8 = 6;

/// Rule number used when the sender's ruleset differs from ours
pub const NO_RULE: u32 = u32::MAX;

/// State flag bits
pub mod flags {
    pub const ALLOW_OPTS: u16 = 0x0001;
    pub const SLOPPY: u16 = 0x0002;
    pub const PFLOW: u16 = 0x0004;
    /// Never replicate this state
    pub const NOSYNC: u16 = 0x0008;
    /// A packet is held until the peer acknowledges the insert
    pub const ACK: u16 = 0x0010;
    pub const NODF: u16 = 0x0020;
    pub const SETTOS: u16 = 0x0040;
    pub const RANDOMID: u16 = 0x0080;
    pub const SCRUB_TCP: u16 = 0x0100;
    pub const SETPRIO: u16 = 0x0200;
}

/// Which outbound queue a state currently sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SyncState {
    None = 0,
    Insert = 1,
    InsertAck = 2,
    Update = 3,
    UpdateCompressed = 4,
    DeleteCompressed = 5,
}

impl SyncState {
    /// Number of queue classes
    pub const QUEUES: usize = 5;

    /// Queue classes in the order they are written to a datagram
    pub const QUEUED: [SyncState; Self::QUEUES] = [
        SyncState::Insert,
        SyncState::InsertAck,
        SyncState::Update,
        SyncState::UpdateCompressed,
        SyncState::DeleteCompressed,
    ];

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncState::Insert,
            2 => SyncState::InsertAck,
            3 => SyncState::Update,
            4 => SyncState::UpdateCompressed,
            5 => SyncState::DeleteCompressed,
            _ => SyncState::None,
        }
    }

    /// Queue index, or `None` for a state that is not queued
    pub fn queue(self) -> Option<usize> {
        match self {
            SyncState::None => None,
            other => Some(other as usize - 1),
        }
    }
}

/// Mutable content of a state
#[derive(Debug, Clone)]
pub struct StateData {
    pub record: StateRecord,
    /// Engine clock at creation, in milliseconds
    pub created_ms: u64,
    /// Engine clock at expiry, in milliseconds
    pub expires_ms: u64,
}

/// Local mirror of one connection's firewall state
#[derive(Debug)]
pub struct ReplicatedState {
    id: u64,
    creator_id: u32,
    proto: u8,
    sync: AtomicU8,
    sync_updates: AtomicU32,
    flags: AtomicU16,
    last_sync: AtomicU64,
    last_reannounce: AtomicU64,
    data: Mutex<StateData>,
}

impl ReplicatedState {
    /// Create a state from a record whose `creation` and `expire` fields
    /// are relative to `now_ms`
    pub fn new(record: StateRecord, now_ms: u64) -> Self {
        let created_ms = now_ms.saturating_sub(record.creation as u64 * 1000);
        let expires_ms = now_ms + record.expire as u64 * 1000;
        Self {
            id: record.id,
            creator_id: record.creator_id,
            proto: record.proto,
            sync: AtomicU8::new(SyncState::None as u8),
            sync_updates: AtomicU32::new(0),
            flags: AtomicU16::new(record.state_flags),
            last_sync: AtomicU64::new(0),
            last_reannounce: AtomicU64::new(0),
            data: Mutex::new(StateData {
                record,
                created_ms,
                expires_ms,
            }),
        }
    }

    /// Build a mirror from a record received from a peer
    ///
    /// The rule number only means something to a peer running the same
    /// ruleset; otherwise it is reset.
    pub fn import(mut record: StateRecord, now_ms: u64, same_ruleset: bool) -> Self {
        if !same_ruleset {
            record.rule = NO_RULE;
            record.anchor = NO_RULE;
            record.nat_rule = NO_RULE;
        }
        record.state_flags &= !flags::ACK;
        record.updates = 0;
        Self::new(record, now_ms)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn creator_id(&self) -> u32 {
        self.creator_id
    }

    pub fn is_tcp(&self) -> bool {
        self.proto == IPPROTO_TCP
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState::from_u8(self.sync.load(Ordering::Acquire))
    }

    /// Only called with the owning bucket's lock held
    pub(crate) fn set_sync_state(&self, state: SyncState) {
        self.sync.store(state as u8, Ordering::Release);
    }

    /// Local updates since the last full announcement
    pub fn sync_updates(&self) -> u32 {
        self.sync_updates.load(Ordering::Acquire)
    }

    pub(crate) fn bump_sync_updates(&self) -> u32 {
        self.sync_updates.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_sync_updates(&self) {
        self.sync_updates.store(0, Ordering::Release);
    }

    pub fn flags(&self) -> u16 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags() & flag != 0
    }

    pub fn set_flag(&self, flag: u16) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: u16) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Engine clock of the last full announcement
    pub fn last_sync(&self) -> u64 {
        self.last_sync.load(Ordering::Acquire)
    }

    pub(crate) fn stamp_sync(&self, now_ms: u64) {
        self.last_sync.store(now_ms, Ordering::Release);
    }

    /// Record a re-announcement unless one happened within `holdoff_ms`
    pub(crate) fn try_reannounce(&self, now_ms: u64, holdoff_ms: u64) -> bool {
        let last = self.last_reannounce.load(Ordering::Acquire);
        if last != 0 && now_ms.saturating_sub(last) < holdoff_ms {
            return false;
        }
        self.last_reannounce
            .compare_exchange(last, now_ms.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Lock the record content
    pub fn data(&self) -> MutexGuard<'_, StateData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ifname(&self) -> String {
        self.data().record.ifname.clone()
    }

    /// Timeout class
    pub fn timeout(&self) -> u8 {
        self.data().record.timeout
    }

    /// True once the state is waiting to be purged or already unlinked
    pub fn is_expired(&self) -> bool {
        self.timeout() >= timeout::MAX
    }

    /// Apply a local change to the record content
    pub fn modify<F: FnOnce(&mut StateRecord)>(&self, f: F) {
        f(&mut self.data().record);
    }

    /// Snapshot the state as a wire record relative to `now_ms`
    pub fn export(&self, now_ms: u64) -> StateRecord {
        let data = self.data();
        let mut record = data.record.clone();
        record.creation = (now_ms.saturating_sub(data.created_ms) / 1000) as u32;
        record.expire = (data.expires_ms.saturating_sub(now_ms) / 1000) as u32;
        record.state_flags = self.flags();
        record.updates = self.sync_updates().min(u8::MAX as u32) as u8;
        record
    }

    /// Peer progress, remaining lifetime and timeout class
    pub fn progress(&self, now_ms: u64) -> (PeerState, PeerState, u32, u8) {
        let data = self.data();
        let expire = (data.expires_ms.saturating_sub(now_ms) / 1000) as u32;
        (data.record.src, data.record.dst, expire, data.record.timeout)
    }

    /// Merge peer progress received from another node
    ///
    /// Peers only move forward; each side that would move backwards is
    /// counted as stale and left alone. Returns the number of stale sides.
    pub fn merge(
        &self,
        src: &PeerState,
        dst: &PeerState,
        expire: u32,
        timeout_class: u8,
        now_ms: u64,
    ) -> u32 {
        let mut data = self.data();
        let record = &mut data.record;
        let mut stale = 0;

        if self.is_tcp() {
            if src_is_stale(&record.src, src) {
                stale += 1;
            } else {
                record.src = *src;
            }
            if dst_is_stale(&record.dst, dst) {
                stale += 1;
            } else {
                record.dst = *dst;
            }
        } else {
            if record.src.state > src.state {
                stale += 1;
            } else {
                record.src = *src;
            }
            if record.dst.state > dst.state {
                stale += 1;
            } else {
                record.dst = *dst;
            }
        }

        if stale < 2 {
            record.timeout = timeout_class;
            data.expires_ms = now_ms + expire as u64 * 1000;
        }
        stale
    }
}

/// Serial-number comparison: `a` is after `b`
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn src_is_stale(local: &PeerState, remote: &PeerState) -> bool {
    let behind = local.state > remote.state
        && (local.state < tcp::PROXY_SRC || remote.state >= tcp::PROXY_SRC);
    behind || (local.state == remote.state && seq_gt(local.seqlo, remote.seqlo))
}

fn dst_is_stale(local: &PeerState, remote: &PeerState) -> bool {
    local.state > remote.state
        || (local.state >= tcp::SYN_SENT && seq_gt(local.seqlo, remote.seqlo))
}
