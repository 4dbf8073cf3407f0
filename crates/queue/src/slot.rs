//! Per-item storage: an atomic status word plus the item record.

use std::sync::atomic::{AtomicU8, Ordering};

use hive_core::{ItemId, ItemStatus, WorkItem};
use parking_lot::Mutex;

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const EXECUTING: u8 = 2;
const VERIFYING: u8 = 3;
const COMPLETED: u8 = 4;
const FAILED: u8 = 5;
const DEAD_LETTERED: u8 = 6;

fn encode(status: ItemStatus) -> u8 {
    match status {
        ItemStatus::Pending => PENDING,
        ItemStatus::Claimed => CLAIMED,
        ItemStatus::Executing => EXECUTING,
        ItemStatus::Verifying => VERIFYING,
        ItemStatus::Completed => COMPLETED,
        ItemStatus::Failed => FAILED,
        ItemStatus::DeadLettered => DEAD_LETTERED,
    }
}

fn decode(raw: u8) -> ItemStatus {
    match raw {
        PENDING => ItemStatus::Pending,
        CLAIMED => ItemStatus::Claimed,
        EXECUTING => ItemStatus::Executing,
        VERIFYING => ItemStatus::Verifying,
        COMPLETED => ItemStatus::Completed,
        FAILED => ItemStatus::Failed,
        _ => ItemStatus::DeadLettered,
    }
}

/// One item in a queue.
///
/// `status` arbitrates ownership: every transition is a compare-and-swap on it.
/// `record` holds the rest of the bookkeeping and is only written by whoever
/// won the corresponding swap, so its `status` field trails the atomic word by
/// at most one in-progress transition.
#[derive(Debug)]
pub(crate) struct ItemSlot {
    pub(crate) id: ItemId,
    status: AtomicU8,
    record: Mutex<WorkItem>,
}

impl ItemSlot {
    pub(crate) fn new(item: WorkItem) -> Self {
        Self {
            id: item.id,
            status: AtomicU8::new(encode(item.status)),
            record: Mutex::new(item),
        }
    }

    /// Current status according to the arbitration word.
    pub(crate) fn status(&self) -> ItemStatus {
        decode(self.status.load(Ordering::Acquire))
    }

    /// Atomically move `from -> to`. Fails if another caller moved it first.
    pub(crate) fn swap(&self, from: ItemStatus, to: ItemStatus) -> Result<(), ItemStatus> {
        self.status
            .compare_exchange(encode(from), encode(to), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(decode)
    }

    /// Lock the record.
    pub(crate) fn record(&self) -> parking_lot::MutexGuard<'_, WorkItem> {
        self.record.lock()
    }

    /// Copy of the record.
    pub(crate) fn snapshot(&self) -> WorkItem {
        self.record.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::QueueId;

    #[test]
    fn test_status_encoding_roundtrip() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::Claimed,
            ItemStatus::Executing,
            ItemStatus::Verifying,
            ItemStatus::Completed,
            ItemStatus::Failed,
            ItemStatus::DeadLettered,
        ] {
            assert_eq!(decode(encode(status)), status);
        }
    }

    #[test]
    fn test_swap_only_succeeds_once() {
        let slot = ItemSlot::new(WorkItem::new(QueueId::new(), "x"));
        assert!(slot.swap(ItemStatus::Pending, ItemStatus::Claimed).is_ok());
        assert_eq!(
            slot.swap(ItemStatus::Pending, ItemStatus::Claimed),
            Err(ItemStatus::Claimed)
        );
        assert_eq!(slot.status(), ItemStatus::Claimed);
    }
}
