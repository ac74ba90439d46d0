use std::collections::BTreeMap;

use channel_proto::Map;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapQueueError {
    #[error("batch would hold {pending} maps out of order, limit is {capacity}")]
    Overflow { pending: usize, capacity: usize },
}

/// Restores forward-channel order from `(ofs, maps)` batches.
///
/// Maps are released strictly by offset. Offsets already released are
/// retransmissions and are dropped; maps ahead of a hole wait until it is
/// filled, up to `capacity` of them.
#[derive(Debug)]
pub struct MapQueue {
    next_ofs: u64,
    pending: BTreeMap<u64, Map>,
    capacity: usize,
}

impl MapQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_ofs: 0,
            pending: BTreeMap::new(),
            capacity,
        }
    }

    /// Offset of the next map the application has not seen yet.
    pub fn next_ofs(&self) -> u64 {
        self.next_ofs
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accepts a batch and returns the maps that became deliverable, in
    /// order. A rejected batch leaves the queue untouched.
    pub fn push(&mut self, ofs: u64, maps: Vec<Map>) -> Result<Vec<Map>, MapQueueError> {
        let fresh = (ofs..)
            .take(maps.len())
            .filter(|index| *index >= self.next_ofs && !self.pending.contains_key(index))
            .count();
        // The head of the batch drains immediately when it starts at `next_ofs`.
        let parked_after = if ofs <= self.next_ofs {
            self.pending.len()
        } else {
            self.pending.len() + fresh
        };
        if parked_after > self.capacity {
            return Err(MapQueueError::Overflow {
                pending: parked_after,
                capacity: self.capacity,
            });
        }

        for (index, map) in (ofs..).zip(maps) {
            if index >= self.next_ofs {
                self.pending.entry(index).or_insert(map);
            }
        }

        let mut ready = Vec::new();
        while let Some(map) = self.pending.remove(&self.next_ofs) {
            ready.push(map);
            self.next_ofs += 1;
        }
        Ok(ready)
    }
}
