//! Sync Engine
//!
//! [`SyncEngine`] is the replication context. The firewall calls its hooks
//! (`insert_state`, `update_state`, `delete_state`, `defer`) whenever its
//! table changes; the hooks move states between the per-bucket outbound
//! queues without ever awaiting. A single transmit task ([`SyncEngine::run`])
//! drains pushed buckets and hands datagrams and released packets to the
//! [`Transport`](crate::network::Transport). Received datagrams enter through
//! [`SyncEngine::input`].
//!
//! Lock order: a bucket lock may be taken while holding nothing else, and
//! the bulk lock is never held while taking a bucket lock. A state's record
//! lock may be taken under a bucket lock, never the other way round. A batch
//! taken from a bucket is queued for the transmit task before the bucket
//! lock is released.

pub mod bucket;
pub mod bulk;
pub mod defer;
mod input;
pub mod stats;
pub mod timer;

pub use bucket::{record_len, Batch, Bucket};
pub use bulk::{BulkCursor, BulkStatus, Walk};
pub use stats::{StatsSnapshot, SyncStats};
pub use timer::{Cancel, TimerHandle};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::failover::FailoverHook;
use crate::network::Transport;
use crate::state::{flags, ReplicatedState, StateTable, SyncState};
use crate::wire::{
    encode, ClearRecord, CompressedUpdate, Message, PacketBuilder, StateRecord, StateRef,
    DIGEST_LEN,
};

use self::bucket::BucketInner;
use self::bulk::BulkState;
use self::stats::{add, bump};

/// A recently synced state is pushed out at once on its next change
const RECENT_SYNC_MS: u64 = 2000;

/// A packet held back until its state reached the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldPacket {
    pub data: Bytes,
    /// The packet already passed the filter and must not be evaluated again
    pub skip_filter: bool,
}

/// Work for the transmit task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Datagram(Bytes),
    Release(HeldPacket),
}

/// Engine status for the API
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub host_id: u32,
    pub digest: String,
    pub schema_version: String,
    pub buckets: usize,
    pub states: usize,
    pub queued_bytes: usize,
    pub deferrals: usize,
    pub bulk: BulkStatus,
}

/// Replication context shared by the hooks, timers and tasks
pub struct SyncEngine {
    me: Weak<SyncEngine>,
    config: SyncConfig,
    host_id: u32,
    digest: [u8; DIGEST_LEN],
    table: Arc<dyn StateTable>,
    failover: Arc<dyn FailoverHook>,
    buckets: Box<[Bucket]>,
    tx: mpsc::Sender<Outbound>,
    wake: Notify,
    runtime: Handle,
    epoch: Instant,
    bulk: Mutex<BulkState>,
    next_token: AtomicU64,
    /// A flush found the outbound channel full and left its batch queued
    stalled: AtomicBool,
    stats: SyncStats,
}

impl SyncEngine {
    /// Create an engine; must be called from within a tokio runtime
    ///
    /// Returns the engine and the receiving end of its outbound channel,
    /// which is passed to [`SyncEngine::run`].
    pub fn new(
        config: SyncConfig,
        host_id: u32,
        digest: [u8; DIGEST_LEN],
        table: Arc<dyn StateTable>,
        failover: Arc<dyn FailoverHook>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Outbound>)> {
        config.validate()?;
        if host_id == 0 {
            return Err(Error::Config("host id cannot be 0".into()));
        }
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let (tx, rx) = mpsc::channel(config.queue_len());
        let buckets = (0..config.bucket_count()).map(Bucket::new).collect();

        tracing::info!(
            host_id = %format!("{:08x}", host_id),
            schema = %config.schema_version,
            mtu = config.mtu,
            defer = config.defer,
            "Sync engine created"
        );

        let engine = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            host_id,
            digest,
            table,
            failover,
            buckets,
            tx,
            wake: Notify::new(),
            runtime,
            epoch: Instant::now(),
            bulk: Mutex::new(BulkState::default()),
            next_token: AtomicU64::new(1),
            stalled: AtomicBool::new(false),
            stats: SyncStats::default(),
        });
        Ok((engine, rx))
    }

    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    pub fn digest(&self) -> [u8; DIGEST_LEN] {
        self.digest
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<dyn StateTable> {
        &self.table
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Milliseconds since the engine was created
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Snapshot of the engine for status reporting
    pub fn status(&self) -> EngineStatus {
        let (queued_bytes, deferrals) = self.buckets.iter().fold((0, 0), |(q, d), b| {
            let inner = b.lock();
            (q + inner.len(), d + inner.deferrals.len())
        });
        EngineStatus {
            host_id: self.host_id,
            digest: hex::encode(self.digest),
            schema_version: self.config.schema_version.to_string(),
            buckets: self.buckets.len(),
            states: self.table.len(),
            queued_bytes,
            deferrals,
            bulk: self.bulk_status(),
        }
    }

    pub(crate) fn bucket_for(&self, id: u64) -> &Bucket {
        &self.buckets[(id % self.buckets.len() as u64) as usize]
    }

    fn bulk_lock(&self) -> MutexGuard<'_, BulkState> {
        self.bulk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn a timer whose callback gets the engine if it is still alive
    pub(crate) fn spawn_timer<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(Arc<SyncEngine>) + Send + 'static,
    {
        let me = self.me.clone();
        TimerHandle::spawn(&self.runtime, delay, move || {
            if let Some(engine) = me.upgrade() {
                callback(engine);
            }
        })
    }

    // ----------------------------------------------------------------
    // Queueing
    // ----------------------------------------------------------------

    /// Queue `st` on `queue` in its bucket, arming the idle flush timer
    /// when the bucket was empty. Called with the bucket lock held.
    fn q_ins(
        &self,
        bucket: &Bucket,
        inner: &mut BucketInner,
        st: &Arc<ReplicatedState>,
        queue: SyncState,
    ) -> Option<Batch> {
        let was_idle = inner.is_idle();
        let flushed = inner.enqueue(st, queue, self.config.schema_version, self.config.mtu);
        if was_idle || flushed.is_some() {
            self.arm_flush_timer(bucket, inner);
        }
        flushed
    }

    fn q_del(&self, inner: &mut BucketInner, st: &Arc<ReplicatedState>) -> bool {
        inner.dequeue(st, self.config.schema_version)
    }

    fn arm_flush_timer(&self, bucket: &Bucket, inner: &mut BucketInner) {
        timer::cancel_slot(&mut inner.timer);
        let index = bucket.index;
        let token = self.next_token();
        inner.timer_token = token;
        inner.timer = Some(self.spawn_timer(self.config.flush_interval(), move |engine| {
            engine.flush_expired(index, token);
        }));
    }

    fn flush_expired(&self, index: usize, token: u64) {
        if let Some(bucket) = self.buckets.get(index) {
            let mut inner = bucket.lock();
            // Re-armed after this timer was set
            if inner.timer_token != token {
                return;
            }
            self.flush_locked(bucket, &mut inner);
        }
    }

    /// Build the datagram for a taken batch
    ///
    /// Full records reset the update counter and stamp the sync time of
    /// the state they announce.
    pub fn encode_batch(&self, batch: &Batch) -> Bytes {
        let now = self.now_ms();
        let version = self.config.schema_version;
        let mut builder = PacketBuilder::new(version, self.digest);

        for (queue, states) in SyncState::QUEUED.iter().zip(batch.queues.iter()) {
            if states.is_empty() {
                continue;
            }
            let message = match queue {
                SyncState::Insert => Message::Insert(self.announce(states, now)),
                SyncState::Update => Message::Update(self.announce(states, now)),
                SyncState::InsertAck => Message::InsertAck(state_refs(states)),
                SyncState::DeleteCompressed => Message::DeleteCompressed(state_refs(states)),
                SyncState::UpdateCompressed => Message::UpdateCompressed(
                    states
                        .iter()
                        .map(|st| {
                            let (src, dst, expire, timeout) = st.progress(now);
                            CompressedUpdate {
                                id: st.id(),
                                src,
                                dst,
                                creator_id: st.creator_id(),
                                expire,
                                timeout,
                            }
                        })
                        .collect(),
                ),
                SyncState::None => continue,
            };
            builder.push(&message);
        }

        if !batch.update_requests.is_empty() {
            builder.push(&Message::UpdateRequest(batch.update_requests.clone()));
        }
        builder.finish()
    }

    fn announce(&self, states: &[Arc<ReplicatedState>], now: u64) -> Vec<StateRecord> {
        states
            .iter()
            .map(|st| {
                st.reset_sync_updates();
                st.stamp_sync(now);
                st.export(now)
            })
            .collect()
    }

    /// Encode and queue a batch taken from a bucket; called with that
    /// bucket's lock held
    pub(crate) fn dispatch(&self, batch: Option<Batch>) {
        self.dispatch_with(batch, &mut None);
    }

    /// Like [`dispatch`](Self::dispatch), sending through `permit` when the
    /// caller reserved room in the channel
    pub(crate) fn dispatch_with(
        &self,
        batch: Option<Batch>,
        permit: &mut Option<mpsc::Permit<'_, Outbound>>,
    ) {
        let batch = match batch {
            Some(batch) => batch,
            None => return,
        };
        let datagram = self.encode_batch(&batch);
        debug_assert_eq!(datagram.len(), batch.len);
        match permit.take() {
            Some(permit) => permit.send(Outbound::Datagram(datagram)),
            None => self.transmit(Outbound::Datagram(datagram)),
        }
    }

    /// Queue the pending datagram of a locked bucket
    ///
    /// With the channel full the batch stays in the bucket, marked for the
    /// transmit task to flush once it has sent something.
    fn flush_locked(&self, bucket: &Bucket, inner: &mut BucketInner) {
        if inner.is_idle() {
            return;
        }
        match self.tx.try_reserve() {
            Ok(permit) => self.dispatch_with(inner.take(), &mut Some(permit)),
            Err(mpsc::error::TrySendError::Full(())) => {
                bucket.set_push();
                self.stalled.store(true, Ordering::Release);
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                if inner.take().is_some() {
                    bump(&self.stats.send_drops);
                }
            }
        }
    }

    /// Hand work to the transmit task without waiting
    pub(crate) fn transmit(&self, item: Outbound) {
        if let Err(e) = self.tx.try_send(item) {
            bump(&self.stats.send_drops);
            tracing::warn!("Dropping outbound item: {}", e);
        }
    }

    /// Send a single message in its own datagram, bypassing the buckets
    pub fn send_plus(&self, message: Message) {
        let datagram = encode(&[message], self.config.schema_version, self.digest);
        self.transmit(Outbound::Datagram(datagram));
    }

    /// Send a single message, waiting for room in the channel
    ///
    /// Returns false once the transmit task is gone.
    pub(crate) async fn send_plus_reserved(&self, message: Message) -> bool {
        match self.tx.reserve().await {
            Ok(permit) => {
                let datagram = encode(&[message], self.config.schema_version, self.digest);
                permit.send(Outbound::Datagram(datagram));
                true
            }
            Err(_) => false,
        }
    }

    /// Flush one bucket now
    pub fn flush_bucket(&self, index: usize) {
        if let Some(bucket) = self.buckets.get(index) {
            let mut inner = bucket.lock();
            self.flush_locked(bucket, &mut inner);
        }
    }

    /// Flush every bucket now
    pub fn flush_all(&self) {
        for index in 0..self.buckets.len() {
            self.flush_bucket(index);
        }
    }

    /// Ask the transmit task to flush a bucket
    pub fn request_push(&self, bucket: &Bucket) {
        bucket.set_push();
        self.wake.notify_one();
    }

    /// Ask the transmit task to flush every bucket
    pub fn push_all(&self) {
        for bucket in self.buckets.iter() {
            bucket.set_push();
        }
        self.wake.notify_one();
    }

    /// Flush the buckets marked for pushing
    pub fn flush_pushed(&self) {
        for bucket in self.buckets.iter() {
            if bucket.take_push() {
                let mut inner = bucket.lock();
                self.flush_locked(bucket, &mut inner);
            }
        }
    }

    // ----------------------------------------------------------------
    // Hooks called by the firewall
    // ----------------------------------------------------------------

    /// A state was created locally
    pub fn insert_state(&self, st: &Arc<ReplicatedState>) {
        if st.has_flag(flags::NOSYNC) {
            return;
        }

        let bucket = self.bucket_for(st.id());
        let mut inner = bucket.lock();
        if st.sync_state() != SyncState::None {
            tracing::warn!(
                "State {:016x}/{:08x} inserted while queued as {:?}",
                st.id(),
                st.creator_id(),
                st.sync_state()
            );
            return;
        }
        st.reset_sync_updates();
        let flushed = self.q_ins(bucket, &mut inner, st, SyncState::Insert);
        self.dispatch(flushed);
    }

    /// A state changed locally
    pub fn update_state(&self, st: &Arc<ReplicatedState>) {
        if st.has_flag(flags::ACK) {
            self.undefer_state(st);
        }

        let bucket = self.bucket_for(st.id());
        if st.has_flag(flags::NOSYNC) {
            let mut inner = bucket.lock();
            self.q_del(&mut inner, st);
            return;
        }

        let mut push = false;
        {
            let mut inner = bucket.lock();
            let flushed = match st.sync_state() {
                SyncState::Insert | SyncState::Update | SyncState::DeleteCompressed => {
                    if st.is_tcp() {
                        st.bump_sync_updates();
                    }
                    None
                }
                SyncState::UpdateCompressed => {
                    if st.is_tcp() && st.bump_sync_updates() >= self.config.max_updates {
                        self.q_del(&mut inner, st);
                        bump(&self.stats.escalations);
                        push = true;
                        self.q_ins(bucket, &mut inner, st, SyncState::Update)
                    } else {
                        None
                    }
                }
                SyncState::InsertAck => {
                    self.q_del(&mut inner, st);
                    self.q_ins(bucket, &mut inner, st, SyncState::Update)
                }
                SyncState::None => {
                    if st.is_tcp() && st.bump_sync_updates() >= self.config.max_updates {
                        bump(&self.stats.escalations);
                        push = true;
                        self.q_ins(bucket, &mut inner, st, SyncState::Update)
                    } else {
                        self.q_ins(bucket, &mut inner, st, SyncState::UpdateCompressed)
                    }
                }
            };
            self.dispatch(flushed);
        }

        let last = st.last_sync();
        let recent = last != 0 && self.now_ms().saturating_sub(last) < RECENT_SYNC_MS;
        if push || recent {
            self.request_push(bucket);
        }
    }

    /// A state is being removed locally
    pub fn delete_state(&self, st: &Arc<ReplicatedState>) {
        if st.has_flag(flags::ACK) {
            self.undefer_state(st);
        }

        let bucket = self.bucket_for(st.id());
        let mut inner = bucket.lock();
        if st.has_flag(flags::NOSYNC) {
            self.q_del(&mut inner, st);
            return;
        }
        let flushed = match st.sync_state() {
            // The peer never heard of it
            SyncState::Insert => {
                self.q_del(&mut inner, st);
                None
            }
            SyncState::Update | SyncState::UpdateCompressed | SyncState::InsertAck => {
                self.q_del(&mut inner, st);
                self.q_ins(bucket, &mut inner, st, SyncState::DeleteCompressed)
            }
            SyncState::None => self.q_ins(bucket, &mut inner, st, SyncState::DeleteCompressed),
            SyncState::DeleteCompressed => None,
        };
        self.dispatch(flushed);
    }

    /// Queue a full update of `st`
    ///
    /// Returns true if a full datagram had to be sent to make room.
    pub fn request_state_update(&self, st: &Arc<ReplicatedState>) -> bool {
        self.queue_full_update(st, &mut None)
    }

    /// Queue a full update of `st`, sending a datagram that had to make
    /// room through `permit` when one is given
    pub(crate) fn queue_full_update(
        &self,
        st: &Arc<ReplicatedState>,
        permit: &mut Option<mpsc::Permit<'_, Outbound>>,
    ) -> bool {
        if st.has_flag(flags::NOSYNC) {
            return false;
        }

        let bucket = self.bucket_for(st.id());
        let mut inner = bucket.lock();
        let flushed = match st.sync_state() {
            SyncState::UpdateCompressed | SyncState::InsertAck => {
                self.q_del(&mut inner, st);
                self.q_ins(bucket, &mut inner, st, SyncState::Update)
            }
            SyncState::None => self.q_ins(bucket, &mut inner, st, SyncState::Update),
            SyncState::Insert | SyncState::Update | SyncState::DeleteCompressed => None,
        };
        let full = flushed.is_some();
        self.dispatch_with(flushed, permit);
        full
    }

    /// Ask peers for a full update of one state; (0, 0) asks for everything
    pub fn request_update(&self, creator_id: u32, id: u64) {
        let bucket = self.bucket_for(id);
        {
            let mut inner = bucket.lock();
            let was_idle = inner.is_idle();
            let flushed = inner.request(StateRef::new(id, creator_id), self.config.mtu);
            if was_idle || flushed.is_some() {
                self.arm_flush_timer(bucket, &mut inner);
            }
            self.dispatch(flushed);
        }
        self.request_push(bucket);
    }

    /// Tell peers to drop every state created by `creator_id`, optionally
    /// only those on `ifname`
    pub fn clear_states(&self, creator_id: u32, ifname: &str) {
        tracing::info!(
            creator = %format!("{:08x}", creator_id),
            ifname,
            "Sending clear"
        );
        self.send_plus(Message::Clear(vec![ClearRecord {
            ifname: ifname.to_string(),
            creator_id,
        }]));
    }

    // ----------------------------------------------------------------
    // Tasks
    // ----------------------------------------------------------------

    /// Transmit task: drains pushed buckets and sends queued work
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut rx: mpsc::Receiver<Outbound>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!("Sync transmit task started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => self.flush_pushed(),
                item = rx.recv() => match item {
                    Some(item) => {
                        if let Err(e) = self.send_item(transport.as_ref(), item).await {
                            if e.is_fatal() {
                                return Err(e);
                            }
                        }
                        // Room again for batches left behind by a full channel
                        if self.stalled.swap(false, Ordering::AcqRel) {
                            self.flush_pushed();
                        }
                    }
                    None => break,
                },
            }
        }

        // Best effort: get what is queued out before stopping
        self.flush_all();
        while let Ok(item) = rx.try_recv() {
            if self.send_item(transport.as_ref(), item).await.is_err() {
                break;
            }
        }

        tracing::info!("Sync transmit task stopped");
        Ok(())
    }

    async fn send_item(&self, transport: &dyn Transport, item: Outbound) -> Result<()> {
        let result = match item {
            Outbound::Datagram(datagram) => {
                let len = datagram.len() as u64;
                let result = transport.send(datagram).await;
                if result.is_ok() {
                    bump(&self.stats.opackets);
                    add(&self.stats.obytes, len);
                }
                result
            }
            Outbound::Release(packet) => transport.reinject(packet).await,
        };
        if let Err(e) = &result {
            bump(&self.stats.send_errors);
            tracing::warn!("Transport error: {}", e);
        }
        result
    }

    /// Receive task: feeds datagrams from the transport into the engine
    pub async fn run_receiver(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = transport.recv() => match received {
                    Ok((from, datagram)) => {
                        tracing::trace!(%from, len = datagram.len(), "Datagram received");
                        self.input(&datagram);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::warn!("Receive error: {}", e),
                },
            }
        }
        Ok(())
    }
}

fn state_refs(states: &[Arc<ReplicatedState>]) -> Vec<StateRef> {
    states
        .iter()
        .map(|st| StateRef::new(st.id(), st.creator_id()))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::failover::DemotionCounter;
    use crate::state::{MemoryStateTable, IPPROTO_TCP};
    use crate::wire::record::{af, tcp, timeout};
    use crate::wire::{decode, PeerState, SchemaVersion, MIN_PACKET};

    pub(crate) const DIGEST: [u8; DIGEST_LEN] = [0x42; DIGEST_LEN];

    pub(crate) struct Harness {
        pub engine: Arc<SyncEngine>,
        pub rx: mpsc::Receiver<Outbound>,
        pub table: Arc<MemoryStateTable>,
        pub failover: Arc<DemotionCounter>,
    }

    impl Harness {
        pub fn new(host_id: u32, tweak: impl FnOnce(&mut SyncConfig)) -> Self {
            let mut config = SyncConfig {
                buckets: 4,
                send_queue_len: 1024,
                ..Default::default()
            };
            tweak(&mut config);
            let table = Arc::new(MemoryStateTable::new(8, 0));
            let failover = Arc::new(DemotionCounter::new());
            let (engine, rx) =
                SyncEngine::new(config, host_id, DIGEST, table.clone(), failover.clone())
                    .unwrap();
            Self {
                engine,
                rx,
                table,
                failover,
            }
        }

        /// Create a local state, add it to the table and announce it
        pub fn create(&self, id: u64) -> Arc<ReplicatedState> {
            let st = Arc::new(ReplicatedState::new(
                tcp_record(id, self.engine.host_id(), 1000),
                self.engine.now_ms(),
            ));
            self.table.insert(st.clone()).unwrap();
            self.engine.insert_state(&st);
            st
        }

        /// Everything the engine queued for transmission so far
        pub fn drain(&mut self) -> Vec<Outbound> {
            let mut items = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                items.push(item);
            }
            items
        }

        /// Flush every bucket and decode the datagrams produced
        pub fn flush_messages(&mut self) -> Vec<Message> {
            self.engine.flush_all();
            self.datagrams()
                .iter()
                .flat_map(|d| decode(d).unwrap().1)
                .collect()
        }

        pub fn datagrams(&mut self) -> Vec<Bytes> {
            self.drain()
                .into_iter()
                .filter_map(|item| match item {
                    Outbound::Datagram(d) => Some(d),
                    Outbound::Release(_) => None,
                })
                .collect()
        }
    }

    pub(crate) fn tcp_record(id: u64, creator_id: u32, seq: u32) -> StateRecord {
        let peer = PeerState {
            seqlo: seq,
            seqhi: seq + 1000,
            state: tcp::ESTABLISHED,
            ..Default::default()
        };
        StateRecord {
            id,
            creator_id,
            ifname: "em0".into(),
            af: af::INET,
            proto: IPPROTO_TCP,
            timeout: timeout::TCP_ESTABLISHED,
            expire: 3600,
            src: peer,
            dst: peer,
            ..Default::default()
        }
    }

    fn count_records(messages: &[Message], pick: fn(&Message) -> bool) -> usize {
        messages.iter().filter(|m| pick(m)).map(|m| m.count()).sum()
    }

    #[tokio::test]
    async fn test_engine_requires_valid_config() {
        let table: Arc<dyn StateTable> = Arc::new(MemoryStateTable::default());
        let failover: Arc<dyn FailoverHook> = Arc::new(DemotionCounter::new());
        let config = SyncConfig {
            mtu: 100,
            ..Default::default()
        };
        assert!(SyncEngine::new(config, 1, DIGEST, table.clone(), failover.clone()).is_err());
        assert!(SyncEngine::new(SyncConfig::default(), 0, DIGEST, table, failover).is_err());
    }

    #[tokio::test]
    async fn test_insert_is_announced() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        assert_eq!(st.sync_state(), SyncState::Insert);
        assert_eq!(Arc::strong_count(&st), 3);

        let messages = h.flush_messages();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            Message::Insert(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, 10);
                assert_eq!(records[0].creator_id, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(messages[1], Message::Eof);
        assert_eq!(st.sync_state(), SyncState::None);
        assert_eq!(Arc::strong_count(&st), 2);
        assert_ne!(st.last_sync(), 0);
    }

    #[tokio::test]
    async fn test_update_while_inserted_sends_nothing_new() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        st.modify(|r| r.src.seqlo = 5000);
        h.engine.update_state(&st);
        assert_eq!(st.sync_state(), SyncState::Insert);

        let messages = h.flush_messages();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            Message::Insert(records) => assert_eq!(records[0].src.seqlo, 5000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_then_delete_compresses() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        h.flush_messages();

        h.engine.update_state(&st);
        assert_eq!(st.sync_state(), SyncState::UpdateCompressed);
        h.engine.delete_state(&st);
        assert_eq!(st.sync_state(), SyncState::DeleteCompressed);
        h.engine.delete_state(&st);
        assert_eq!(st.sync_state(), SyncState::DeleteCompressed);

        let messages = h.flush_messages();
        assert_eq!(messages, vec![
            Message::DeleteCompressed(vec![StateRef::new(10, 1)]),
            Message::Eof,
        ]);
    }

    #[tokio::test]
    async fn test_deleting_unannounced_state_is_silent() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        h.table.remove(10, 1);
        h.engine.delete_state(&st);

        assert_eq!(st.sync_state(), SyncState::None);
        assert_eq!(Arc::strong_count(&st), 1);
        assert!(h.flush_messages().is_empty());
        assert!(h.engine.buckets().iter().all(|b| b.len() == MIN_PACKET));
    }

    #[tokio::test]
    async fn test_nosync_states_never_queue() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        st.set_flag(flags::NOSYNC);
        h.engine.update_state(&st);
        assert_eq!(st.sync_state(), SyncState::None);

        h.engine.insert_state(&st);
        h.engine.delete_state(&st);
        assert!(h.flush_messages().is_empty());
    }

    #[tokio::test]
    async fn test_escalates_once_after_max_updates() {
        let mut h = Harness::new(1, |c| c.max_updates = 16);
        let st = h.create(10);
        h.flush_messages();

        for _ in 0..20 {
            h.engine.update_state(&st);
        }
        assert_eq!(h.engine.stats().snapshot().escalations, 1);
        assert_eq!(st.sync_state(), SyncState::Update);

        let messages = h.flush_messages();
        assert_eq!(count_records(&messages, |m| matches!(m, Message::Update(_))), 1);
        assert_eq!(
            count_records(&messages, |m| matches!(m, Message::UpdateCompressed(_))),
            0
        );
        // Full announcement resets the counter
        assert_eq!(st.sync_updates(), 0);
    }

    #[tokio::test]
    async fn test_non_tcp_updates_never_escalate() {
        let mut h = Harness::new(1, |c| c.max_updates = 2);
        let mut record = tcp_record(10, 1, 0);
        record.proto = 17;
        let st = Arc::new(ReplicatedState::new(record, 0));
        h.table.insert(st.clone()).unwrap();
        h.engine.insert_state(&st);
        h.flush_messages();

        for _ in 0..10 {
            h.engine.update_state(&st);
        }
        assert_eq!(st.sync_state(), SyncState::UpdateCompressed);
        assert_eq!(h.engine.stats().snapshot().escalations, 0);
    }

    #[tokio::test]
    async fn test_request_state_update_transitions() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        assert!(!h.engine.request_state_update(&st));
        assert_eq!(st.sync_state(), SyncState::Insert);
        h.flush_messages();

        h.engine.update_state(&st);
        assert!(!h.engine.request_state_update(&st));
        assert_eq!(st.sync_state(), SyncState::Update);
        assert_eq!(Arc::strong_count(&st), 3);
    }

    #[tokio::test]
    async fn test_datagram_length_matches_accounting() {
        for version in [SchemaVersion::V1, SchemaVersion::V2] {
            let mut h = Harness::new(1, |c| {
                c.buckets = 1;
                c.schema_version = version;
            });
            let states: Vec<_> = (1..=6).map(|id| h.create(id)).collect();
            h.flush_messages();
            h.engine.update_state(&states[0]);
            h.engine.request_state_update(&states[1]);
            h.engine.delete_state(&states[2]);
            h.engine.request_update(9, 99);
            let _ = h.create(7);

            let accounted = h.engine.buckets()[0].len();
            let batch = h.engine.buckets()[0].lock().take().unwrap();
            assert_eq!(batch.len, accounted);
            assert_eq!(h.engine.encode_batch(&batch).len(), accounted);
        }
    }

    #[tokio::test]
    async fn test_overflow_flushes_before_enqueue() {
        let mut h = Harness::new(1, |c| {
            c.buckets = 1;
            c.mtu = SyncConfig::min_mtu();
        });
        let a = h.create(1);
        assert!(h.drain().is_empty());
        let b = h.create(2);

        let datagrams = h.datagrams();
        assert_eq!(datagrams.len(), 1);
        assert!(datagrams[0].len() <= SyncConfig::min_mtu());
        assert_eq!(a.sync_state(), SyncState::None);
        assert_eq!(b.sync_state(), SyncState::Insert);
    }

    #[tokio::test]
    async fn test_clear_is_sent_immediately() {
        let mut h = Harness::new(1, |_| {});
        h.engine.clear_states(1, "em0");
        let datagrams = h.datagrams();
        assert_eq!(datagrams.len(), 1);
        let (_, messages) = decode(&datagrams[0]).unwrap();
        assert_eq!(
            messages[0],
            Message::Clear(vec![ClearRecord {
                ifname: "em0".into(),
                creator_id: 1
            }])
        );
    }

    #[tokio::test]
    async fn test_push_is_drained_by_flush_pushed() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        h.engine.request_push(h.engine.bucket_for(st.id()));
        h.engine.flush_pushed();
        assert_eq!(h.datagrams().len(), 1);
        h.engine.flush_pushed();
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_flushes_bucket() {
        let mut h = Harness::new(1, |_| {});
        let _st = h.create(10);
        assert!(h.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.datagrams().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_idle_timer_leaves_bucket_alone() {
        let mut h = Harness::new(1, |c| c.buckets = 1);
        let _a = h.create(1);
        let first = h.engine.buckets()[0].lock().timer_token;
        h.engine.flush_all();
        assert_eq!(h.datagrams().len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let _b = h.create(2);
        // The first timer fires late, after the bucket was re-armed
        h.engine.flush_expired(0, first);
        assert!(h.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.drain().is_empty());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.datagrams().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_into_full_channel_keeps_batch() {
        let mut h = Harness::new(1, |c| {
            c.buckets = 1;
            c.send_queue_len = 1;
        });
        // Takes the only slot
        h.engine.clear_states(9, "");
        let st = h.create(10);

        h.engine.flush_all();
        assert_eq!(st.sync_state(), SyncState::Insert);
        assert_eq!(h.engine.stats().snapshot().send_drops, 0);

        // Room again: the push left behind by the full channel delivers it
        assert_eq!(h.drain().len(), 1);
        h.engine.flush_pushed();
        let messages: Vec<_> = h
            .datagrams()
            .iter()
            .flat_map(|d| decode(d).unwrap().1)
            .collect();
        assert!(matches!(&messages[0], Message::Insert(r) if r[0].id == 10));
        assert_eq!(st.sync_state(), SyncState::None);
    }
}
