//! Bulk transfer
//!
//! A node that (re)joins asks its peer for the whole table with an update
//! request for the null reference. The peer answers with a start marker,
//! full updates of every eligible state, and an end marker carrying the
//! time the transfer took. The walk over the table is resumable: whenever a
//! datagram fills up, the walking task yields and picks up after the last
//! state it handled. Each step first waits for room in the outbound channel,
//! so a slow link slows the walk down instead of losing datagrams.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::stats::bump;
use super::timer::{cancel_slot, TimerHandle};
use super::SyncEngine;
use crate::state::{ReplicatedState, StateTable, SyncState};
use crate::wire::{bus, BusStatusRecord, Message, MIN_PACKET};

/// Result of one step of a table walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// The visitor asked to pause; call `resume` again later
    Yielded,
    /// Every row has been visited
    Done,
}

/// Position of an interrupted table walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkCursor {
    row: usize,
    last: Option<(u64, u32)>,
    requested_at: u64,
}

impl BulkCursor {
    pub fn new(requested_at: u64) -> Self {
        Self {
            row: 0,
            last: None,
            requested_at,
        }
    }

    /// Engine clock at which the transfer was requested
    pub fn requested_at(&self) -> u64 {
        self.requested_at
    }

    /// Visit states after the saved position until `visit` returns true or
    /// the table is exhausted
    ///
    /// The walk resumes in the row of the last visited state, or at the
    /// saved row if that state is gone. Rows are ordered by identity, so
    /// states at or before the saved one are skipped either way.
    pub fn resume<F>(&mut self, table: &dyn StateTable, mut visit: F) -> Walk
    where
        F: FnMut(&Arc<ReplicatedState>) -> bool,
    {
        let start = match self.last {
            Some((id, creator_id)) if table.find(id, creator_id).is_some() => {
                table.row_of(id, creator_id)
            }
            _ => self.row,
        };

        for row in start..table.rows() {
            let skip_to = if row == start { self.last } else { None };
            for st in table.row(row) {
                let key = (st.id(), st.creator_id());
                if skip_to.map_or(false, |last| key <= last) {
                    continue;
                }
                self.row = row;
                self.last = Some(key);
                if visit(&st) {
                    return Walk::Yielded;
                }
            }
            self.row = row + 1;
            self.last = None;
        }
        Walk::Done
    }
}

/// A transfer we are serving
#[derive(Debug)]
struct BulkSend {
    cursor: BulkCursor,
    generation: u64,
}

/// Bulk transfer bookkeeping, guarded by the engine's bulk lock
#[derive(Debug)]
pub(crate) struct BulkState {
    send: Option<BulkSend>,
    generation: u64,
    /// Engine clock when our outstanding request was sent
    request_sent: Option<u64>,
    tries: u32,
    timer: Option<TimerHandle>,
    /// Identifies the most recently armed failure timer
    timer_token: u64,
    synchronized: bool,
    demoted: bool,
}

impl Default for BulkState {
    fn default() -> Self {
        Self {
            send: None,
            generation: 0,
            request_sent: None,
            tries: 0,
            timer: None,
            timer_token: 0,
            synchronized: true,
            demoted: false,
        }
    }
}

/// Bulk transfer status for the API
#[derive(Debug, Clone, Serialize)]
pub struct BulkStatus {
    pub synchronized: bool,
    pub request_pending: bool,
    pub tries: u32,
    pub serving: bool,
}

impl SyncEngine {
    /// True while no bulk request of ours is outstanding
    pub fn is_synchronized(&self) -> bool {
        self.bulk_lock().synchronized
    }

    /// True while a transfer to a peer is in progress
    pub fn bulk_send_active(&self) -> bool {
        self.bulk_lock().send.is_some()
    }

    pub fn bulk_status(&self) -> BulkStatus {
        let bulk = self.bulk_lock();
        BulkStatus {
            synchronized: bulk.synchronized,
            request_pending: bulk.request_sent.is_some(),
            tries: bulk.tries,
            serving: bulk.send.is_some(),
        }
    }

    // ----------------------------------------------------------------
    // Send side
    // ----------------------------------------------------------------

    /// Start serving a bulk transfer, restarting any walk in progress
    pub(crate) fn bulk_start(&self) {
        let now = self.now_ms();
        let generation = {
            let mut bulk = self.bulk_lock();
            bulk.generation += 1;
            bulk.send = Some(BulkSend {
                cursor: BulkCursor::new(now),
                generation: bulk.generation,
            });
            bulk.generation
        };

        tracing::info!(states = self.table.len(), "Starting bulk transfer");
        bump(&self.stats.bulk_sent);

        if let Some(engine) = self.me.upgrade() {
            self.runtime.spawn(async move {
                engine.bulk_walk(generation).await;
            });
        }
    }

    /// Cursor of the walk for `generation`, unless a newer request
    /// replaced it
    fn bulk_cursor(&self, generation: u64) -> Option<BulkCursor> {
        match &self.bulk_lock().send {
            Some(send) if send.generation == generation => Some(send.cursor.clone()),
            _ => None,
        }
    }

    async fn bulk_walk(self: Arc<Self>, generation: u64) {
        if self.bulk_cursor(generation).is_none() {
            return;
        }
        if !self.send_plus_reserved(self.bus_message(bus::START, 0)).await {
            return;
        }

        loop {
            // Room for the datagram this step may fill
            let mut permit = match self.tx.reserve().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            };
            let mut cursor = match self.bulk_cursor(generation) {
                Some(cursor) => cursor,
                None => return,
            };

            let requested_at = cursor.requested_at();
            let step = cursor.resume(self.table.as_ref(), |st| {
                let eligible = st.sync_state() == SyncState::None
                    && !st.is_expired()
                    && st.last_sync() <= requested_at;
                eligible && self.queue_full_update(st, &mut permit)
            });
            drop(permit);

            {
                let mut bulk = self.bulk_lock();
                match bulk.send.as_mut() {
                    Some(send) if send.generation == generation => send.cursor = cursor,
                    // A newer request restarted the walk
                    _ => return,
                }
            }

            match step {
                Walk::Yielded => tokio::task::yield_now().await,
                Walk::Done => break,
            }
        }

        // Every bucket goes into the channel ahead of the end marker
        for bucket in self.buckets.iter() {
            let permit = match self.tx.reserve().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let mut inner = bucket.lock();
            let batch = inner.take();
            self.dispatch_with(batch, &mut Some(permit));
        }

        let elapsed = match self.bulk_cursor(generation) {
            Some(cursor) => self.now_ms().saturating_sub(cursor.requested_at()) / 1000,
            None => return,
        };
        tracing::info!(elapsed_secs = elapsed, "Bulk transfer complete");
        self.send_plus_reserved(self.bus_message(bus::END, elapsed as u32))
            .await;

        let mut bulk = self.bulk_lock();
        if matches!(&bulk.send, Some(send) if send.generation == generation) {
            bulk.send = None;
        }
    }

    fn bus_message(&self, status: u8, elapsed: u32) -> Message {
        Message::BusStatus(vec![BusStatusRecord {
            creator_id: self.host_id,
            elapsed,
            status,
        }])
    }

    // ----------------------------------------------------------------
    // Receive side
    // ----------------------------------------------------------------

    /// Ask the peer for its whole table
    pub fn request_bulk(&self) {
        let demote = {
            let mut bulk = self.bulk_lock();
            bulk.request_sent = Some(self.now_ms());
            bulk.tries = 0;
            let demote = bulk.synchronized && !bulk.demoted;
            bulk.synchronized = false;
            bulk.demoted |= demote;
            self.arm_bulk_fail(&mut bulk, self.config.bulk_retry());
            demote
        };

        if demote {
            self.failover
                .adjust(self.config.failover_demote, "bulk start");
        }
        bump(&self.stats.bulk_requests);
        tracing::info!("Requesting bulk update");
        self.request_update(0, 0);
    }

    /// Replace the failure timer; called with the bulk lock held
    fn arm_bulk_fail(&self, bulk: &mut BulkState, delay: Duration) {
        cancel_slot(&mut bulk.timer);
        let token = self.next_token();
        bulk.timer_token = token;
        bulk.timer = Some(self.spawn_timer(delay, move |engine| engine.bulk_fail(token)));
    }

    fn bulk_fail(&self, token: u64) {
        let retry = {
            let mut bulk = self.bulk_lock();
            // Answered or re-armed after this timer was set
            if bulk.request_sent.is_none() || bulk.timer_token != token {
                return;
            }
            bulk.tries += 1;
            if bulk.tries < self.config.bulk_max_tries {
                self.arm_bulk_fail(&mut bulk, self.config.bulk_retry());
                true
            } else {
                bulk.timer = None;
                bulk.request_sent = None;
                false
            }
        };

        if retry {
            tracing::debug!("Bulk update not answered, asking again");
            self.request_update(0, 0);
        } else {
            bump(&self.stats.bulk_failed);
            tracing::warn!("Failed to receive bulk update, assuming synchronized");
            self.bulk_synchronized("bulk fail");
        }
    }

    fn bulk_synchronized(&self, reason: &str) {
        let promote = {
            let mut bulk = self.bulk_lock();
            bulk.synchronized = true;
            std::mem::take(&mut bulk.demoted)
        };
        if promote {
            self.failover.adjust(-self.config.failover_demote, reason);
        }
    }

    /// Handle a start or end marker from a peer
    pub(crate) fn bulk_status_input(&self, record: &BusStatusRecord) {
        match record.status {
            bus::START => {
                let mut bulk = self.bulk_lock();
                if bulk.request_sent.is_none() {
                    return;
                }
                let delay = self.config.bulk_start_grace() + self.bulk_allowance();
                self.arm_bulk_fail(&mut bulk, delay);
                tracing::debug!(
                    peer = %format!("{:08x}", record.creator_id),
                    "Received bulk update start"
                );
            }
            bus::END => {
                let now = self.now_ms();
                let accepted = {
                    let mut bulk = self.bulk_lock();
                    let started = now.saturating_sub(record.elapsed as u64 * 1000);
                    match bulk.request_sent {
                        Some(sent) if started >= sent => {
                            cancel_slot(&mut bulk.timer);
                            bulk.request_sent = None;
                            true
                        }
                        _ => false,
                    }
                };

                if accepted {
                    bump(&self.stats.bulk_received);
                    tracing::info!(
                        peer = %format!("{:08x}", record.creator_id),
                        "Received bulk update end"
                    );
                    self.bulk_synchronized("bulk done");
                } else {
                    bump(&self.stats.bulk_stale_end);
                    tracing::debug!("Ignoring stale bulk update end");
                }
            }
            other => {
                bump(&self.stats.bad_value);
                tracing::debug!(status = other, "Unknown bulk status");
            }
        }
    }

    /// Extra wait for a started transfer, one millisecond per datagram our
    /// own table would need
    fn bulk_allowance(&self) -> Duration {
        let per_datagram =
            ((self.config.mtu - MIN_PACKET) / self.config.schema_version.state_len()).max(1);
        Duration::from_millis((self.table.len() / per_datagram) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Transport;
    use crate::state::MemoryStateTable;
    use crate::sync::tests::{tcp_record, Harness, DIGEST};
    use crate::sync::{HeldPacket, Outbound};
    use crate::wire::{decode, encode, StateRef};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Link that needs a while for every datagram
    #[derive(Default)]
    struct SlowLink {
        sent: Mutex<Vec<Bytes>>,
    }

    impl SlowLink {
        fn messages(&self) -> Vec<Message> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .flat_map(|d| decode(d).unwrap().1)
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Transport for SlowLink {
        async fn send(&self, datagram: Bytes) -> crate::Result<()> {
            tokio::time::sleep(Duration::from_micros(300)).await;
            self.sent.lock().unwrap().push(datagram);
            Ok(())
        }

        async fn reinject(&self, _packet: HeldPacket) -> crate::Result<()> {
            Ok(())
        }

        async fn recv(&self) -> crate::Result<(SocketAddr, Bytes)> {
            std::future::pending().await
        }
    }

    fn is_bus(message: &Message, status: u8) -> bool {
        matches!(message, Message::BusStatus(r) if r[0].status == status)
    }

    fn filled_table(rows: usize, count: u64) -> MemoryStateTable {
        let table = MemoryStateTable::new(rows, 0);
        for id in 1..=count {
            table
                .insert(Arc::new(ReplicatedState::new(tcp_record(id, 7, 0), 0)))
                .unwrap();
        }
        table
    }

    #[test]
    fn test_cursor_visits_each_state_once() {
        let table = filled_table(5, 60);
        let mut cursor = BulkCursor::new(0);
        let mut seen: HashMap<u64, usize> = HashMap::new();
        let mut steps = 0;

        loop {
            let mut budget = 7;
            let step = cursor.resume(&table, |st| {
                *seen.entry(st.id()).or_default() += 1;
                budget -= 1;
                budget == 0
            });
            steps += 1;
            if step == Walk::Done {
                break;
            }
        }

        assert_eq!(seen.len(), 60);
        assert!(seen.values().all(|&n| n == 1));
        assert!(steps > 8);
    }

    #[test]
    fn test_cursor_survives_removal_of_last_state() {
        let table = filled_table(3, 30);
        let mut cursor = BulkCursor::new(0);
        let mut seen = Vec::new();

        let mut count = 0;
        let step = cursor.resume(&table, |st| {
            seen.push(st.id());
            count += 1;
            count == 4
        });
        assert_eq!(step, Walk::Yielded);

        // Remove the state the cursor stopped on and one still ahead
        let last = *seen.last().unwrap();
        table.remove(last, 7);
        let ahead = table
            .states()
            .into_iter()
            .map(|st| st.id())
            .find(|id| !seen.contains(id))
            .unwrap();
        table.remove(ahead, 7);

        assert_eq!(cursor.resume(&table, |st| {
            seen.push(st.id());
            false
        }), Walk::Done);

        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len());
        assert_eq!(seen.len(), 29);
        assert!(!seen.contains(&ahead));
    }

    async fn wait_for_walk(h: &Harness) {
        for _ in 0..10_000 {
            if !h.engine.bulk_send_active() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("bulk walk did not finish");
    }

    #[tokio::test]
    async fn test_bulk_transfer_brackets_every_state() {
        let mut server = Harness::new(1, |c| {
            c.buckets = 2;
            c.mtu = 1000;
        });
        let mut client = Harness::new(2, |_| {});

        for id in 1..=25 {
            server.create(id);
        }
        // Not eligible: waiting to be purged
        let expired = server.create(27);
        server.engine.flush_all();
        server.drain();
        expired.modify(|r| r.timeout = crate::wire::record::timeout::PURGE);

        // Everything was announced before the request, so nothing is
        // newer than it
        client.engine.request_bulk();
        assert!(!client.engine.is_synchronized());
        assert_eq!(client.failover.value(), 240);
        client.engine.flush_pushed();
        let request = client.datagrams();
        assert_eq!(request.len(), 1);
        let (_, messages) = decode(&request[0]).unwrap();
        assert_eq!(messages[0], Message::UpdateRequest(vec![StateRef::new(0, 0)]));

        server.engine.input(&request[0]);
        wait_for_walk(&server).await;

        let datagrams: Vec<_> = server
            .drain()
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Datagram(d) => Some(d),
                Outbound::Release(_) => None,
            })
            .collect();
        let decoded: Vec<Vec<Message>> =
            datagrams.iter().map(|d| decode(d).unwrap().1).collect();

        assert!(matches!(
            &decoded.first().unwrap()[0],
            Message::BusStatus(r) if r[0].status == bus::START
        ));
        assert!(matches!(
            &decoded.last().unwrap()[0],
            Message::BusStatus(r) if r[0].status == bus::END
        ));

        let mut updated: Vec<u64> = decoded
            .iter()
            .flatten()
            .flat_map(|m| match m {
                Message::Update(records) => records.iter().map(|r| r.id).collect(),
                _ => Vec::new(),
            })
            .collect();
        updated.sort_unstable();
        assert_eq!(updated, (1..=25).collect::<Vec<_>>());

        for datagram in &datagrams {
            client.engine.input(datagram);
        }
        assert!(client.engine.is_synchronized());
        assert_eq!(client.failover.value(), 0);
        assert_eq!(client.table.len(), 25);
        assert_eq!(client.engine.stats().snapshot().bulk_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_before_request_is_ignored() {
        let client = Harness::new(2, |_| {});
        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        client.engine.request_bulk();

        client.engine.bulk_status_input(&BusStatusRecord {
            creator_id: 1,
            elapsed: 60,
            status: bus::END,
        });
        assert!(!client.engine.is_synchronized());
        assert_eq!(client.engine.stats().snapshot().bulk_stale_end, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_gives_up() {
        let mut client = Harness::new(2, |c| c.bulk_max_tries = 3);
        client.engine.request_bulk();

        tokio::time::sleep(std::time::Duration::from_secs(16)).await;
        assert!(client.engine.is_synchronized());
        assert_eq!(client.failover.value(), 0);
        assert_eq!(client.engine.stats().snapshot().bulk_failed, 1);

        // The initial request and two retries
        client.engine.flush_all();
        let requests = client
            .datagrams()
            .iter()
            .flat_map(|d| decode(d).unwrap().1)
            .filter(|m| matches!(m, Message::UpdateRequest(_)))
            .count();
        assert_eq!(requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_transfer_waits_for_slow_link() {
        let server = Harness::new(1, |c| {
            c.buckets = 4;
            c.send_queue_len = 8;
        });
        for id in 1..=600 {
            server
                .table
                .insert(Arc::new(ReplicatedState::new(tcp_record(id, 7, 0), 0)))
                .unwrap();
        }
        let Harness { engine, rx, .. } = server;
        let link = Arc::new(SlowLink::default());
        let shutdown = CancellationToken::new();
        let transmit = tokio::spawn(engine.clone().run(link.clone(), rx, shutdown.clone()));

        let request = encode(
            &[Message::UpdateRequest(vec![StateRef::new(0, 0)])],
            engine.config().schema_version,
            DIGEST,
        );
        engine.input(&request);

        for _ in 0..1000 {
            if link.messages().iter().any(|m| is_bus(m, bus::END)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        transmit.await.unwrap().unwrap();

        let messages = link.messages();
        let mut updated: Vec<u64> = messages
            .iter()
            .flat_map(|m| match m {
                Message::Update(records) => records.iter().map(|r| r.id).collect(),
                _ => Vec::new(),
            })
            .collect();
        updated.sort_unstable();
        assert_eq!(updated, (1..=600).collect::<Vec<_>>());

        let markers: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, Message::BusStatus(_)))
            .collect();
        assert_eq!(markers.len(), 2);
        assert!(is_bus(markers[0], bus::START));
        assert!(is_bus(markers[1], bus::END));
        // Nothing follows the end marker
        let end = messages.iter().position(|m| is_bus(m, bus::END)).unwrap();
        assert!(messages[end + 1..].iter().all(|m| *m == Message::Eof));
        assert_eq!(engine.stats().snapshot().send_drops, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_marker_replaces_failure_timer() {
        let mut client = Harness::new(2, |c| c.bulk_max_tries = 5);
        client.engine.request_bulk();
        client.engine.flush_all();
        assert_eq!(client.datagrams().len(), 1);
        let armed_by_request = client.engine.bulk_lock().timer_token;

        client.engine.bulk_status_input(&BusStatusRecord {
            creator_id: 1,
            elapsed: 0,
            status: bus::START,
        });
        // The request's timer fired just before the start marker re-armed
        client.engine.bulk_fail(armed_by_request);
        assert_eq!(client.engine.bulk_status().tries, 0);

        // Only the timer armed by the start marker is live
        let grace = client.engine.config().bulk_start_grace();
        let retry = client.engine.config().bulk_retry();
        tokio::time::sleep(grace + Duration::from_millis(100)).await;
        assert_eq!(client.engine.bulk_status().tries, 1);

        tokio::time::sleep(retry - Duration::from_millis(200)).await;
        assert_eq!(client.engine.bulk_status().tries, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.engine.bulk_status().tries, 2);

        client.engine.flush_all();
        let requests = client
            .datagrams()
            .iter()
            .flat_map(|d| decode(d).unwrap().1)
            .filter(|m| matches!(m, Message::UpdateRequest(_)))
            .count();
        assert_eq!(requests, 2);
    }
}
