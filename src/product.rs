//! Product records and the sender-side product table
//!
//! The table is a fixed array of `window_size` slots partitioned into three
//! FIFO lists: free slots, transmitted-awaiting-ack slots (ordered by send
//! time, head drives the timeout), and slots awaiting (re)transmission.
//! Every slot is on exactly one list at all times; `rebuild` reconstructs
//! the partition from the per-slot state after a detected inconsistency.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::wmo::WmoHeading;

/// Lifecycle states of a product in transit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProdState {
    #[default]
    Free,
    Queued,
    Sent,
    Acked,
    Nacked,
    Retry,
    Failed,
    Dead,
}

/// One file in transit.
#[derive(Clone, Debug, Default)]
pub struct Product {
    pub seqno: u32,
    pub filename: PathBuf,
    pub wmo: WmoHeading,
    /// payload bytes to transmit, excluding any stripped CCB preamble
    pub size: u64,
    /// bytes of stripped CCB preamble, 0 if absent
    pub ccb_len: usize,
    pub state: ProdState,
    pub send_count: u32,
    pub queue_time: i64,
    pub send_time: i64,
    pub priority: i32,
    /// set on the fabricated connection-announcement product
    pub announcement: bool,
}

impl Product {
    /// Reset a slot for new work, keeping nothing from the previous tenant.
    pub fn reset(&mut self) {
        *self = Product::default();
    }

    pub fn assign(&mut self, filename: PathBuf, queue_time: i64, size: u64, priority: i32) {
        self.reset();
        self.filename = filename;
        self.queue_time = queue_time;
        self.size = size;
        self.priority = priority;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProdList {
    Free,
    Ack,
    Retr,
}

/// Fixed-capacity product table with the free/ack/retr partition.
pub struct ProductTable {
    slots: Vec<Product>,
    free: VecDeque<usize>,
    ack: VecDeque<usize>,
    retr: VecDeque<usize>,
}

impl ProductTable {
    pub fn new(window_size: usize) -> Self {
        let mut table = ProductTable {
            slots: vec![Product::default(); window_size],
            free: VecDeque::with_capacity(window_size),
            ack: VecDeque::with_capacity(window_size),
            retr: VecDeque::with_capacity(window_size),
        };
        for i in 0..window_size {
            table.free.push_back(i);
        }
        table
    }

    pub fn window_size(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: usize) -> &Product {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Product {
        &mut self.slots[idx]
    }

    pub fn len(&self, list: ProdList) -> usize {
        self.list(list).len()
    }

    pub fn is_empty(&self, list: ProdList) -> bool {
        self.list(list).is_empty()
    }

    pub fn pop(&mut self, list: ProdList) -> Option<usize> {
        self.list_mut(list).pop_front()
    }

    pub fn push(&mut self, list: ProdList, idx: usize) {
        debug_assert!(idx < self.slots.len());
        debug_assert!(!self.contains(idx));
        self.list_mut(list).push_back(idx);
    }

    /// Put a slot back at the head of a list, preserving its order after a
    /// pop that could not be processed.
    pub fn push_front(&mut self, list: ProdList, idx: usize) {
        debug_assert!(!self.contains(idx));
        self.list_mut(list).push_front(idx);
    }

    /// Head of the ack list; the oldest unacknowledged product, which
    /// carries the ack deadline.
    pub fn ack_head(&self) -> Option<usize> {
        self.ack.front().copied()
    }

    /// True when `path` is in the in-flight window (transmitted and
    /// unacknowledged, or queued for retransmission).
    pub fn in_flight(&self, path: &Path) -> bool {
        self.ack
            .iter()
            .chain(self.retr.iter())
            .any(|&i| self.slots[i].filename == path)
    }

    /// Reconstruct all three lists from the per-slot state field. This is
    /// the recovery path for a detected list inconsistency; the normal
    /// operations keep the partition intact on their own.
    pub fn rebuild(&mut self) -> (usize, usize, usize) {
        let before = (self.free.len(), self.ack.len(), self.retr.len());
        self.free.clear();
        self.ack.clear();
        self.retr.clear();
        for i in 0..self.slots.len() {
            match self.slots[i].state {
                ProdState::Queued | ProdState::Retry => self.retr.push_back(i),
                ProdState::Sent => self.ack.push_back(i),
                _ => self.free.push_back(i),
            }
        }
        before
    }

    /// Partition invariant: every slot on exactly one list.
    pub fn partition_ok(&self) -> bool {
        if self.free.len() + self.ack.len() + self.retr.len() != self.slots.len() {
            return false;
        }
        let mut seen = vec![false; self.slots.len()];
        for &i in self.free.iter().chain(self.ack.iter()).chain(self.retr.iter()) {
            if i >= seen.len() || seen[i] {
                return false;
            }
            seen[i] = true;
        }
        true
    }

    fn contains(&self, idx: usize) -> bool {
        self.free.contains(&idx) || self.ack.contains(&idx) || self.retr.contains(&idx)
    }

    fn list(&self, list: ProdList) -> &VecDeque<usize> {
        match list {
            ProdList::Free => &self.free,
            ProdList::Ack => &self.ack,
            ProdList::Retr => &self.retr,
        }
    }

    fn list_mut(&mut self, list: ProdList) -> &mut VecDeque<usize> {
        match list {
            ProdList::Free => &mut self.free,
            ProdList::Ack => &mut self.ack,
            ProdList::Retr => &mut self.retr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProdList::*;

    #[test]
    fn new_table_is_all_free() {
        let table = ProductTable::new(4);
        assert_eq!(table.len(Free), 4);
        assert_eq!(table.len(Ack), 0);
        assert_eq!(table.len(Retr), 0);
        assert!(table.partition_ok());
    }

    #[test]
    fn lists_are_fifo() {
        let mut table = ProductTable::new(3);
        let a = table.pop(Free).unwrap();
        let b = table.pop(Free).unwrap();
        table.push(Ack, a);
        table.push(Ack, b);
        assert_eq!(table.ack_head(), Some(a));
        assert_eq!(table.pop(Ack), Some(a));
        assert_eq!(table.pop(Ack), Some(b));
    }

    #[test]
    fn partition_holds_through_traffic() {
        let mut table = ProductTable::new(5);
        for round in 0..20 {
            if let Some(idx) = table.pop(Free) {
                table.slot_mut(idx).state = ProdState::Sent;
                table.push(Ack, idx);
            }
            if round % 3 == 0 {
                let idx = table.pop(Ack).unwrap();
                table.slot_mut(idx).state = ProdState::Retry;
                table.push(Retr, idx);
            }
            if round % 2 == 0 {
                if let Some(idx) = table.pop(Retr).or_else(|| table.pop(Ack)) {
                    table.slot_mut(idx).state = ProdState::Free;
                    table.push(Free, idx);
                }
            }
            assert!(table.partition_ok());
            assert_eq!(
                table.len(Free) + table.len(Ack) + table.len(Retr),
                table.window_size()
            );
        }
    }

    #[test]
    fn rebuild_restores_partition_from_states() {
        let mut table = ProductTable::new(6);
        // scramble: drain every list, leaving states behind
        for i in 0..6 {
            table.pop(Free);
            table.slot_mut(i).state = match i {
                0 | 1 => ProdState::Sent,
                2 => ProdState::Queued,
                3 => ProdState::Retry,
                4 => ProdState::Acked,
                _ => ProdState::Free,
            };
        }
        assert!(!table.partition_ok());
        table.rebuild();
        assert!(table.partition_ok());
        assert_eq!(table.len(Ack), 2);
        assert_eq!(table.len(Retr), 2);
        assert_eq!(table.len(Free), 2);
        // ack list order follows slot order after a rebuild
        assert_eq!(table.ack_head(), Some(0));
    }

    #[test]
    fn in_flight_checks_ack_and_retr_only() {
        let mut table = ProductTable::new(3);
        let a = table.pop(Free).unwrap();
        table.slot_mut(a).filename = PathBuf::from("/in/one");
        table.slot_mut(a).state = ProdState::Sent;
        table.push(Ack, a);

        let b = table.pop(Free).unwrap();
        table.slot_mut(b).filename = PathBuf::from("/in/two");
        table.slot_mut(b).state = ProdState::Retry;
        table.push(Retr, b);

        let c = table.pop(Free).unwrap();
        table.slot_mut(c).filename = PathBuf::from("/in/three");
        table.push(Free, c);

        assert!(table.in_flight(Path::new("/in/one")));
        assert!(table.in_flight(Path::new("/in/two")));
        assert!(!table.in_flight(Path::new("/in/three")));
    }

    #[test]
    fn assign_clears_previous_tenant() {
        let mut prod = Product {
            seqno: 7,
            send_count: 3,
            ccb_len: 24,
            announcement: true,
            ..Product::default()
        };
        prod.wmo.ttaaii = "SXUS20".into();
        prod.assign(PathBuf::from("/in/next"), 100, 2048, 1);
        assert_eq!(prod.seqno, 0);
        assert_eq!(prod.send_count, 0);
        assert_eq!(prod.ccb_len, 0);
        assert!(!prod.announcement);
        assert!(prod.wmo.is_empty());
        assert_eq!(prod.size, 2048);
        assert_eq!(prod.priority, 1);
    }
}
