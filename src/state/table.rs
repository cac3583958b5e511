//! State table collaborator
//!
//! The firewall owns the canonical table; the engine only needs lookup,
//! insertion, removal and a stable row-by-row walk for bulk transfers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::ReplicatedState;
use crate::error::{Error, Result};

/// Table of replicated states, keyed by (id, creator id)
pub trait StateTable: Send + Sync {
    /// Look up a state
    fn find(&self, id: u64, creator_id: u32) -> Option<Arc<ReplicatedState>>;

    /// Insert a state; fails if it already exists or the table is full
    fn insert(&self, state: Arc<ReplicatedState>) -> Result<()>;

    /// Unlink a state, returning the table's reference
    fn remove(&self, id: u64, creator_id: u32) -> Option<Arc<ReplicatedState>>;

    /// Number of states
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hash rows
    fn rows(&self) -> usize;

    /// Row a state with this identity hashes to
    fn row_of(&self, id: u64, creator_id: u32) -> usize;

    /// States of one row, ordered by (id, creator id)
    fn row(&self, index: usize) -> Vec<Arc<ReplicatedState>>;

    /// Every state, row by row
    fn states(&self) -> Vec<Arc<ReplicatedState>> {
        (0..self.rows()).flat_map(|i| self.row(i)).collect()
    }
}

type Row = BTreeMap<(u64, u32), Arc<ReplicatedState>>;

/// In-memory hash table used by the daemon and in tests
pub struct MemoryStateTable {
    rows: Vec<Mutex<Row>>,
    count: AtomicUsize,
    limit: usize,
}

impl MemoryStateTable {
    /// Create a table with `rows` hash rows and an optional state limit
    /// (0 = unlimited)
    pub fn new(rows: usize, limit: usize) -> Self {
        let rows = rows.max(1);
        Self {
            rows: (0..rows).map(|_| Mutex::new(Row::new())).collect(),
            count: AtomicUsize::new(0),
            limit,
        }
    }

    fn lock_row(&self, index: usize) -> std::sync::MutexGuard<'_, Row> {
        self.rows[index].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStateTable {
    fn default() -> Self {
        Self::new(256, 0)
    }
}

impl StateTable for MemoryStateTable {
    fn find(&self, id: u64, creator_id: u32) -> Option<Arc<ReplicatedState>> {
        let row = self.lock_row(self.row_of(id, creator_id));
        row.get(&(id, creator_id)).cloned()
    }

    fn insert(&self, state: Arc<ReplicatedState>) -> Result<()> {
        let (id, creator_id) = (state.id(), state.creator_id());
        let mut row = self.lock_row(self.row_of(id, creator_id));
        if row.contains_key(&(id, creator_id)) {
            return Err(Error::StateExists { id, creator_id });
        }
        if self.limit > 0 && self.count.load(Ordering::Acquire) >= self.limit {
            return Err(Error::TableFull(self.limit));
        }
        row.insert((id, creator_id), state);
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn remove(&self, id: u64, creator_id: u32) -> Option<Arc<ReplicatedState>> {
        let mut row = self.lock_row(self.row_of(id, creator_id));
        let removed = row.remove(&(id, creator_id));
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn rows(&self) -> usize {
        self.rows.len()
    }

    fn row_of(&self, id: u64, creator_id: u32) -> usize {
        ((id ^ creator_id as u64) % self.rows.len() as u64) as usize
    }

    fn row(&self, index: usize) -> Vec<Arc<ReplicatedState>> {
        match self.rows.get(index) {
            Some(_) => self.lock_row(index).values().cloned().collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::StateRecord;

    fn state(id: u64, creator_id: u32) -> Arc<ReplicatedState> {
        Arc::new(ReplicatedState::new(
            StateRecord {
                id,
                creator_id,
                ..Default::default()
            },
            0,
        ))
    }

    #[test]
    fn test_insert_find_remove() {
        let table = MemoryStateTable::new(4, 0);
        table.insert(state(1, 7)).unwrap();
        table.insert(state(2, 7)).unwrap();
        assert_eq!(table.len(), 2);

        assert!(table.find(1, 7).is_some());
        assert!(table.find(1, 8).is_none());

        let err = table.insert(state(1, 7)).unwrap_err();
        assert!(matches!(err, Error::StateExists { id: 1, creator_id: 7 }));

        assert!(table.remove(1, 7).is_some());
        assert!(table.remove(1, 7).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_limit() {
        let table = MemoryStateTable::new(4, 1);
        table.insert(state(1, 7)).unwrap();
        assert!(matches!(table.insert(state(2, 7)), Err(Error::TableFull(1))));
    }

    #[test]
    fn test_rows_are_ordered_and_complete() {
        let table = MemoryStateTable::new(3, 0);
        for id in (1..=30).rev() {
            table.insert(state(id, 7)).unwrap();
        }
        let mut seen = 0;
        for i in 0..table.rows() {
            let row = table.row(i);
            let keys: Vec<_> = row.iter().map(|s| s.id()).collect();
            let mut sorted = keys.clone();
            sorted.sort_unstable();
            assert_eq!(keys, sorted);
            for st in &row {
                assert_eq!(table.row_of(st.id(), st.creator_id()), i);
            }
            seen += row.len();
        }
        assert_eq!(seen, 30);
        assert_eq!(table.states().len(), 30);
        assert!(table.row(99).is_empty());
    }
}
