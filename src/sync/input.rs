//! Inbound datagram processing

use std::sync::Arc;

use super::stats::{add, bump};
use super::SyncEngine;
use crate::state::{flags, ReplicatedState, SyncState};
use crate::wire::{
    ClearRecord, CompressedUpdate, Header, Message, PeerState, Reader, SaRefreshRecord,
    StateRecord, StateRef, WireError,
};

impl SyncEngine {
    /// Process one datagram received from a peer
    ///
    /// Malformed input is counted and dropped; action groups before the
    /// first framing error are still applied.
    pub fn input(&self, datagram: &[u8]) {
        bump(&self.stats.ipackets);

        let (header, body) = match Header::parse(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                match e {
                    WireError::Truncated { .. } => bump(&self.stats.header_drops),
                    _ => self.count_wire_error(&e),
                }
                tracing::debug!("Dropping datagram: {}", e);
                return;
            }
        };
        let same_ruleset = header.digest == self.digest;

        for message in Reader::new(body) {
            match message {
                Ok(message) => {
                    tracing::trace!(
                        kind = message.type_name(),
                        count = message.count(),
                        "Processing action group"
                    );
                    self.handle(message, same_ruleset);
                }
                Err(e) => {
                    self.count_wire_error(&e);
                    tracing::debug!("Stopped processing datagram: {}", e);
                    break;
                }
            }
        }
    }

    fn count_wire_error(&self, error: &WireError) {
        let counter = match error {
            WireError::Truncated { .. } => &self.stats.truncated,
            WireError::BadVersion(_) => &self.stats.bad_version,
            WireError::BadLength { .. } | WireError::TrailingData(_) => &self.stats.bad_len,
            WireError::BadAction(_) => &self.stats.bad_action,
            WireError::BadValue(_) => &self.stats.bad_value,
        };
        bump(counter);
    }

    fn handle(&self, message: Message, same_ruleset: bool) {
        match message {
            Message::Clear(records) => records.iter().for_each(|r| self.in_clear(r)),
            Message::Insert(records) => records
                .into_iter()
                .for_each(|r| self.import(r, same_ruleset, true)),
            Message::InsertAck(refs) => refs.iter().for_each(|r| self.in_insert_ack(r)),
            Message::Update(records) => records
                .into_iter()
                .for_each(|r| self.in_update(r, same_ruleset)),
            Message::UpdateCompressed(records) => {
                records.iter().for_each(|r| self.in_update_compressed(r))
            }
            Message::UpdateRequest(refs) => refs.iter().for_each(|r| self.in_update_request(r)),
            Message::DeleteCompressed(refs) => refs.iter().for_each(|r| self.in_delete(r)),
            Message::BusStatus(records) => records.iter().for_each(|r| self.bulk_status_input(r)),
            Message::SaRefresh(records) => self.in_sa_refresh(&records),
            Message::Eof => {}
            Message::Error { action } => {
                bump(&self.stats.bad_action);
                tracing::debug!(action, "Deprecated action, dropping rest of datagram");
            }
        }
    }

    fn in_clear(&self, record: &ClearRecord) {
        let mut removed = 0;
        for st in self.table.states() {
            if st.creator_id() != record.creator_id {
                continue;
            }
            if !record.ifname.is_empty() && st.ifname() != record.ifname {
                continue;
            }
            st.set_flag(flags::NOSYNC);
            if self.table.remove(st.id(), st.creator_id()).is_some() {
                self.delete_state(&st);
                removed += 1;
            }
        }
        add(&self.stats.cleared, removed);
        tracing::info!(
            creator = %format!("{:08x}", record.creator_id),
            ifname = %record.ifname,
            removed,
            "Cleared states"
        );
    }

    /// Create a mirror of a peer's state; `acked` answers an ACK request
    fn import(&self, record: StateRecord, same_ruleset: bool, acked: bool) {
        if let Err(e) = record.validate() {
            bump(&self.stats.bad_value);
            tracing::debug!("Invalid state {:016x}: {}", record.id, e);
            return;
        }
        if self.table.find(record.id, record.creator_id).is_some() {
            return;
        }

        let wants_ack = acked && record.state_flags & flags::ACK != 0;
        let now = self.now_ms();
        let st = Arc::new(ReplicatedState::import(record, now, same_ruleset));
        st.stamp_sync(now);
        if let Err(e) = self.table.insert(st.clone()) {
            bump(&self.stats.insert_failed);
            tracing::debug!("Failed to import state: {}", e);
            return;
        }
        bump(&self.stats.imported);

        if wants_ack {
            let bucket = self.bucket_for(st.id());
            {
                let mut inner = bucket.lock();
                let flushed = self.q_ins(bucket, &mut inner, &st, SyncState::InsertAck);
                self.dispatch(flushed);
            }
            self.request_push(bucket);
        }
    }

    fn in_insert_ack(&self, reference: &StateRef) {
        match self.table.find(reference.id, reference.creator_id) {
            Some(st) if st.has_flag(flags::ACK) => {
                self.undefer_state(&st);
            }
            Some(_) => {}
            None => bump(&self.stats.bad_state),
        }
    }

    fn in_update(&self, record: StateRecord, same_ruleset: bool) {
        if let Err(e) = record.validate() {
            bump(&self.stats.bad_value);
            tracing::debug!("Invalid update {:016x}: {}", record.id, e);
            return;
        }

        match self.table.find(record.id, record.creator_id) {
            Some(st) => self.merge(
                &st,
                &record.src,
                &record.dst,
                record.expire,
                record.timeout,
            ),
            // A full update carries everything needed to create the state
            None => self.import(record, same_ruleset, false),
        }
    }

    fn in_update_compressed(&self, update: &CompressedUpdate) {
        if let Err(e) = update.validate() {
            bump(&self.stats.bad_value);
            tracing::debug!("Invalid compressed update {:016x}: {}", update.id, e);
            return;
        }

        match self.table.find(update.id, update.creator_id) {
            Some(st) => self.merge(&st, &update.src, &update.dst, update.expire, update.timeout),
            None => {
                bump(&self.stats.missing_requested);
                self.request_update(update.creator_id, update.id);
            }
        }
    }

    fn merge(
        &self,
        st: &Arc<ReplicatedState>,
        src: &PeerState,
        dst: &PeerState,
        expire: u32,
        timeout: u8,
    ) {
        // The peer evidently has the state
        if st.has_flag(flags::ACK) {
            self.undefer_state(st);
        }

        let now = self.now_ms();
        let stale = st.merge(src, dst, expire, timeout, now);
        if stale < 2 {
            st.stamp_sync(now);
        }
        if stale == 0 {
            return;
        }

        bump(&self.stats.stale);
        if st.try_reannounce(now, self.config.reannounce_holdoff_ms) {
            tracing::trace!(
                "Stale update for {:016x}, re-announcing local state",
                st.id()
            );
            self.request_state_update(st);
            self.request_push(self.bucket_for(st.id()));
        } else {
            bump(&self.stats.reannounce_suppressed);
        }
    }

    fn in_delete(&self, reference: &StateRef) {
        match self.table.find(reference.id, reference.creator_id) {
            Some(st) => {
                st.set_flag(flags::NOSYNC);
                self.table.remove(reference.id, reference.creator_id);
                self.delete_state(&st);
            }
            None => bump(&self.stats.bad_state),
        }
    }

    fn in_update_request(&self, reference: &StateRef) {
        if reference.is_null() {
            self.bulk_start();
            return;
        }

        match self.table.find(reference.id, reference.creator_id) {
            Some(st) if !st.has_flag(flags::NOSYNC) => {
                self.request_state_update(&st);
                self.request_push(self.bucket_for(st.id()));
            }
            Some(_) => {}
            None => bump(&self.stats.bad_state),
        }
    }

    fn in_sa_refresh(&self, records: &[SaRefreshRecord]) {
        add(&self.stats.sa_refresh, records.len() as u64);
        for record in records {
            tracing::debug!(
                spi = record.spi,
                sproto = record.sproto,
                rpl = record.rpl,
                "Security association refresh"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::{tcp_record, Harness, DIGEST};
    use crate::state::StateTable;
    use crate::wire::record::{tcp, timeout};
    use crate::wire::{decode, encode, Action, SchemaVersion, HEADER_LEN, MIN_PACKET};
    use std::time::Duration;

    fn datagram(messages: &[Message]) -> Vec<u8> {
        encode(messages, SchemaVersion::V2, DIGEST).to_vec()
    }

    #[tokio::test]
    async fn test_insert_imports_state() {
        let h = Harness::new(1, |_| {});
        let mut record = tcp_record(5, 2, 100);
        record.rule = 12;
        h.engine.input(&datagram(&[Message::Insert(vec![record.clone()])]));

        let st = h.table.find(5, 2).unwrap();
        assert_eq!(st.sync_state(), SyncState::None);
        assert_eq!(st.export(h.engine.now_ms()).rule, 12);

        // Already present: left alone
        record.src.seqlo = 999;
        h.engine.input(&datagram(&[Message::Insert(vec![record])]));
        assert_eq!(h.table.len(), 1);
        assert_eq!(st.export(0).src.seqlo, 100);
    }

    #[tokio::test]
    async fn test_foreign_ruleset_drops_rule_number() {
        let h = Harness::new(1, |_| {});
        let mut record = tcp_record(5, 2, 100);
        record.rule = 12;
        let bytes = encode(&[Message::Insert(vec![record])], SchemaVersion::V1, [0; 16]);
        h.engine.input(&bytes);

        let st = h.table.find(5, 2).unwrap();
        assert_eq!(st.export(0).rule, crate::state::NO_RULE);
    }

    #[tokio::test]
    async fn test_invalid_records_are_skipped() {
        let h = Harness::new(1, |_| {});
        let mut bad = tcp_record(5, 2, 0);
        bad.timeout = timeout::MAX;
        let good = tcp_record(6, 2, 0);
        h.engine.input(&datagram(&[Message::Insert(vec![bad, good])]));

        assert!(h.table.find(5, 2).is_none());
        assert!(h.table.find(6, 2).is_some());
        assert_eq!(h.engine.stats().snapshot().bad_value, 1);
    }

    #[tokio::test]
    async fn test_stale_update_is_reannounced() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        st.modify(|r| {
            r.src.seqlo = 5000;
            r.dst.seqlo = 5000;
        });
        h.flush_messages();

        let old = tcp_record(10, 1, 4000);
        h.engine.input(&datagram(&[Message::Update(vec![old.clone()])]));

        let record = st.export(h.engine.now_ms());
        assert_eq!(record.src.seqlo, 5000);
        assert_eq!(record.dst.seqlo, 5000);
        assert_eq!(st.sync_state(), SyncState::Update);
        assert_eq!(h.engine.stats().snapshot().stale, 1);

        let messages = h.flush_messages();
        match &messages[0] {
            Message::Update(records) => assert_eq!(records[0].src.seqlo, 5000),
            other => panic!("unexpected {:?}", other),
        }

        // A second stale update inside the hold-off is not re-announced
        h.engine.input(&datagram(&[Message::Update(vec![old])]));
        assert_eq!(st.sync_state(), SyncState::None);
        let snap = h.engine.stats().snapshot();
        assert_eq!(snap.stale, 2);
        assert_eq!(snap.reannounce_suppressed, 1);
    }

    #[tokio::test]
    async fn test_compressed_update_merges_forward() {
        let h = Harness::new(1, |_| {});
        let st = h.create(10);
        let mut src = st.export(0).src;
        src.seqlo += 100;
        src.state = tcp::FIN_WAIT_1;
        let update = CompressedUpdate {
            id: 10,
            src,
            dst: st.export(0).dst,
            creator_id: 1,
            expire: 45,
            timeout: timeout::TCP_FIN_WAIT,
        };
        h.engine.input(&datagram(&[Message::UpdateCompressed(vec![update])]));

        let record = st.export(h.engine.now_ms());
        assert_eq!(record.src.state, tcp::FIN_WAIT_1);
        assert_eq!(record.timeout, timeout::TCP_FIN_WAIT);
        assert_eq!(h.engine.stats().snapshot().stale, 0);
    }

    #[tokio::test]
    async fn test_unknown_compressed_update_requests_full_state() {
        let mut h = Harness::new(1, |_| {});
        let update = CompressedUpdate {
            id: 77,
            creator_id: 2,
            timeout: timeout::TCP_ESTABLISHED,
            ..Default::default()
        };
        h.engine.input(&datagram(&[Message::UpdateCompressed(vec![update])]));

        let messages = h.flush_messages();
        assert_eq!(messages[0], Message::UpdateRequest(vec![StateRef::new(77, 2)]));
    }

    #[tokio::test]
    async fn test_update_request_sends_full_state() {
        let mut h = Harness::new(1, |_| {});
        let st = h.create(10);
        h.flush_messages();

        h.engine.input(&datagram(&[Message::UpdateRequest(vec![
            StateRef::new(10, 1),
            StateRef::new(11, 1),
        ])]));
        assert_eq!(st.sync_state(), SyncState::Update);
        assert_eq!(h.engine.stats().snapshot().bad_state, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_without_echo() {
        let mut h = Harness::new(1, |_| {});
        h.engine.input(&datagram(&[Message::Insert(vec![tcp_record(5, 2, 0)])]));
        let st = h.table.find(5, 2).unwrap();

        h.engine.input(&datagram(&[Message::DeleteCompressed(vec![
            StateRef::new(5, 2),
            StateRef::new(6, 2),
        ])]));
        assert!(h.table.find(5, 2).is_none());
        assert!(st.has_flag(flags::NOSYNC));
        assert_eq!(h.engine.stats().snapshot().bad_state, 1);
        assert!(h.flush_messages().is_empty());
    }

    #[tokio::test]
    async fn test_clear_by_creator_and_interface() {
        let mut h = Harness::new(1, |_| {});
        let mut on_em1 = tcp_record(3, 2, 0);
        on_em1.ifname = "em1".into();
        h.engine.input(&datagram(&[Message::Insert(vec![
            tcp_record(1, 2, 0),
            tcp_record(2, 3, 0),
            on_em1,
        ])]));
        assert_eq!(h.table.len(), 3);

        h.engine.input(&datagram(&[Message::Clear(vec![ClearRecord {
            ifname: "em0".into(),
            creator_id: 2,
        }])]));
        assert!(h.table.find(1, 2).is_none());
        assert!(h.table.find(2, 3).is_some());
        assert!(h.table.find(3, 2).is_some());

        h.engine.input(&datagram(&[Message::Clear(vec![ClearRecord {
            ifname: String::new(),
            creator_id: 2,
        }])]));
        assert_eq!(h.table.len(), 1);
        assert!(h.flush_messages().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_group_fails_batch() {
        let h = Harness::new(1, |_| {});
        let mut bytes = datagram(&[Message::InsertAck(vec![StateRef::new(1, 2); 3])]);
        // Claim five records where three are present
        bytes[HEADER_LEN + 2..HEADER_LEN + 4].copy_from_slice(&5u16.to_be_bytes());
        h.engine.input(&bytes);
        assert_eq!(h.engine.stats().snapshot().truncated, 1);
    }

    #[tokio::test]
    async fn test_header_errors_are_counted() {
        let h = Harness::new(1, |_| {});
        h.engine.input(&[6, 0, 0]);

        let mut bytes = datagram(&[]);
        bytes[0] = 5;
        h.engine.input(&bytes);

        let mut bytes = datagram(&[]);
        bytes[2..4].copy_from_slice(&999u16.to_be_bytes());
        h.engine.input(&bytes);

        let mut bytes = datagram(&[]);
        bytes[HEADER_LEN] = Action::InsertFragment.code();
        h.engine.input(&bytes);

        let mut bytes = datagram(&[]);
        bytes.extend_from_slice(&[Action::Eof.code(), 0, 0, 0]);
        let len = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&len.to_be_bytes());
        h.engine.input(&bytes);

        let snap = h.engine.stats().snapshot();
        assert_eq!(snap.ipackets, 5);
        assert_eq!(snap.header_drops, 1);
        assert_eq!(snap.bad_version, 1);
        assert_eq!(snap.bad_len, 2);
        assert_eq!(snap.bad_action, 1);
        assert_eq!(bytes.len(), MIN_PACKET + 4);
    }

    #[tokio::test]
    async fn test_sa_refresh_is_counted() {
        let h = Harness::new(1, |_| {});
        h.engine.input(&datagram(&[Message::SaRefresh(vec![
            SaRefreshRecord::default(),
            SaRefreshRecord::default(),
        ])]));
        assert_eq!(h.engine.stats().snapshot().sa_refresh, 2);
    }

    #[tokio::test]
    async fn test_our_own_ack_request_is_answered() {
        let mut h = Harness::new(1, |_| {});
        let mut record = tcp_record(5, 2, 0);
        record.state_flags |= flags::ACK;
        h.engine.input(&datagram(&[Message::Insert(vec![record])]));
        h.engine.flush_pushed();
        let datagrams = h.datagrams();
        assert_eq!(datagrams.len(), 1);
        let (_, messages) = decode(&datagrams[0]).unwrap();
        assert_eq!(messages[0], Message::InsertAck(vec![StateRef::new(5, 2)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_updates_stamp_sync_time() {
        let h = Harness::new(1, |_| {});
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.engine.input(&datagram(&[Message::Insert(vec![tcp_record(5, 2, 100)])]));
        let st = h.table.find(5, 2).unwrap();
        assert_eq!(st.last_sync(), h.engine.now_ms());

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.engine.input(&datagram(&[Message::Update(vec![tcp_record(5, 2, 200)])]));
        let stamped = h.engine.now_ms();
        assert_eq!(st.last_sync(), stamped);

        // Nothing taken from a stale update
        tokio::time::sleep(Duration::from_secs(3)).await;
        h.engine.input(&datagram(&[Message::Update(vec![tcp_record(5, 2, 50)])]));
        assert_eq!(st.last_sync(), stamped);
        assert_eq!(h.engine.stats().snapshot().stale, 1);
    }
}
