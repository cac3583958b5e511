//! Bucket bookkeeping
//!
//! A bucket owns the outbound queues for the states hashed to it. All
//! methods here run with the bucket lock held and never block. The engine
//! encodes a taken batch and hands it to the transmit task before it lets go
//! of the lock, so datagrams leave in the order they were taken.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::defer::Deferral;
use super::timer::{cancel_slot, TimerHandle};
use crate::state::{ReplicatedState, SyncState};
use crate::wire::record::{STATE_REF_LEN, UPDATE_COMPRESSED_LEN};
use crate::wire::{SchemaVersion, StateRef, MIN_PACKET, SUBHEADER_LEN};

/// Wire size of one record of a queue class
pub fn record_len(queue: SyncState, version: SchemaVersion) -> usize {
    match queue {
        SyncState::Insert | SyncState::Update => version.state_len(),
        SyncState::InsertAck | SyncState::DeleteCompressed => STATE_REF_LEN,
        SyncState::UpdateCompressed => UPDATE_COMPRESSED_LEN,
        SyncState::None => 0,
    }
}

/// Everything taken from a bucket for one datagram
#[derive(Debug, Default)]
pub struct Batch {
    pub queues: [Vec<Arc<ReplicatedState>>; SyncState::QUEUES],
    pub update_requests: Vec<StateRef>,
    /// Accounted datagram length
    pub len: usize,
}

#[derive(Debug)]
pub(crate) struct BucketInner {
    queues: [Vec<Arc<ReplicatedState>>; SyncState::QUEUES],
    update_requests: Vec<StateRef>,
    pub(crate) deferrals: VecDeque<Deferral>,
    len: usize,
    pub(crate) timer: Option<TimerHandle>,
    /// Identifies the most recently armed idle timer
    pub(crate) timer_token: u64,
}

impl BucketInner {
    fn new() -> Self {
        Self {
            queues: Default::default(),
            update_requests: Vec::new(),
            deferrals: VecDeque::new(),
            len: MIN_PACKET,
            timer: None,
            timer_token: 0,
        }
    }

    /// Accounted length of the pending datagram
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing is waiting to be sent
    pub fn is_idle(&self) -> bool {
        self.len == MIN_PACKET
    }

    pub fn queue(&self, queue: SyncState) -> &[Arc<ReplicatedState>] {
        match queue.queue() {
            Some(i) => &self.queues[i],
            None => &[],
        }
    }

    pub fn update_requests(&self) -> &[StateRef] {
        &self.update_requests
    }

    /// Take the pending datagram, leaving the bucket empty
    pub fn take(&mut self) -> Option<Batch> {
        cancel_slot(&mut self.timer);
        if self.is_idle() {
            return None;
        }

        let queues = std::mem::take(&mut self.queues);
        for st in queues.iter().flatten() {
            st.set_sync_state(SyncState::None);
        }
        let batch = Batch {
            queues,
            update_requests: std::mem::take(&mut self.update_requests),
            len: self.len,
        };
        self.len = MIN_PACKET;
        Some(batch)
    }

    /// Queue `st` on `queue`
    ///
    /// If the record would not fit in `mtu`, the pending datagram is taken
    /// first and returned so the caller can send it.
    pub fn enqueue(
        &mut self,
        st: &Arc<ReplicatedState>,
        queue: SyncState,
        version: SchemaVersion,
        mtu: usize,
    ) -> Option<Batch> {
        let index = queue.queue()?;
        let size = record_len(queue, version);

        let mut nlen = size;
        if self.queues[index].is_empty() {
            nlen += SUBHEADER_LEN;
        }

        let mut flushed = None;
        if self.len + nlen > mtu {
            flushed = self.take();
            nlen = size + SUBHEADER_LEN;
        }

        self.len += nlen;
        self.queues[index].push(st.clone());
        st.set_sync_state(queue);
        flushed
    }

    /// Remove `st` from whatever queue it is on
    pub fn dequeue(&mut self, st: &Arc<ReplicatedState>, version: SchemaVersion) -> bool {
        let current = st.sync_state();
        let index = match current.queue() {
            Some(index) => index,
            None => return false,
        };

        let queue = &mut self.queues[index];
        let pos = match queue.iter().position(|q| Arc::ptr_eq(q, st)) {
            Some(pos) => pos,
            None => return false,
        };
        queue.remove(pos);

        self.len -= record_len(current, version);
        if queue.is_empty() {
            self.len -= SUBHEADER_LEN;
        }
        st.set_sync_state(SyncState::None);
        true
    }

    /// Queue an update request unless an identical one is pending
    pub fn request(&mut self, req: StateRef, mtu: usize) -> Option<Batch> {
        if self.update_requests.contains(&req) {
            return None;
        }

        let mut nlen = STATE_REF_LEN;
        if self.update_requests.is_empty() {
            nlen += SUBHEADER_LEN;
        }

        let mut flushed = None;
        if self.len + nlen > mtu {
            flushed = self.take();
            nlen = STATE_REF_LEN + SUBHEADER_LEN;
        }

        self.len += nlen;
        self.update_requests.push(req);
        flushed
    }
}

/// One lock stripe of the engine
#[derive(Debug)]
pub struct Bucket {
    pub(crate) index: usize,
    inner: Mutex<BucketInner>,
    push: AtomicBool,
}

impl Bucket {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            inner: Mutex::new(BucketInner::new()),
            push: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the bucket for flushing by the transmit task
    pub(crate) fn set_push(&self) {
        self.push.store(true, Ordering::Release);
    }

    /// Clear the push mark, returning whether it was set
    pub(crate) fn take_push(&self) -> bool {
        self.push.swap(false, Ordering::AcqRel)
    }

    /// Accounted length of the pending datagram
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Number of held packets
    pub fn deferrals(&self) -> usize {
        self.lock().deferrals.len()
    }
}
