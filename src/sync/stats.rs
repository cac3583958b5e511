//! Protocol counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! sync_stats {
    ($($(#[$meta:meta])* $name:ident,)*) => {
        /// Live counters, updated with relaxed atomics
        #[derive(Debug, Default)]
        pub struct SyncStats {
            $($(#[$meta])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`SyncStats`]
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $($(#[$meta])* pub $name: u64,)*
        }

        impl SyncStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

sync_stats! {
    /// Datagrams received
    ipackets,
    /// Datagrams shorter than a header
    header_drops,
    /// Datagrams with an unknown protocol version
    bad_version,
    /// Bad declared length or bytes after the end marker
    bad_len,
    /// Unknown or deprecated action codes
    bad_action,
    /// Action groups claiming more records than the datagram holds
    truncated,
    /// Records rejected by field validation
    bad_value,
    /// References to states we do not have
    bad_state,
    /// Peer updates that would have moved a state backwards
    stale,
    /// Re-announcements skipped by the hold-off
    reannounce_suppressed,
    /// Compressed updates escalated to full updates
    escalations,
    /// States imported from peers
    imported,
    /// Peer states we could not insert
    insert_failed,
    /// Full updates requested for unknown states
    missing_requested,
    /// States removed by Clear records
    cleared,
    /// IPsec SA refresh records seen
    sa_refresh,
    /// Datagrams handed to the transport
    opackets,
    /// Bytes handed to the transport
    obytes,
    /// Datagrams dropped because the outbound queue was full
    send_drops,
    /// Transport send failures
    send_errors,
    /// Packets held for acknowledgment
    deferred,
    /// Held packets released before their timer ran out
    defer_acked,
    /// Held packets released by the timer
    defer_timeouts,
    /// Held packets released early because the bucket was full
    defer_overflow,
    /// Bulk transfers served to peers
    bulk_sent,
    /// Bulk transfers requested from peers
    bulk_requests,
    /// Bulk transfers completed from peers
    bulk_received,
    /// End markers that predate our request
    bulk_stale_end,
    /// Bulk requests abandoned after the retry limit
    bulk_failed,
}

/// Add one to a counter
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Add `n` to a counter
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
