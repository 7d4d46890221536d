//! Ordered work queue of translation-block slices.
//!
//! The receiver thread pushes one slice per executed block; the consumer
//! drains slices in arrival order, splitting the head when it needs fewer
//! instructions than the slice carries. End of stream is an explicit flag so
//! the consumer can distinguish "nothing yet" from "nothing ever again".

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::regions::BinaryRegion;
use crate::MemAccess;

/// Index range end marking a slice that covers the whole block.
pub const OPEN_END: u16 = u16::MAX;

/// A half-open range `[begin, end)` over one block's decoded instructions.
#[derive(Debug)]
pub struct TbSlice {
    /// Translation block index
    pub index: u32,
    pub begin: u16,
    /// Exclusive upper bound; [`OPEN_END`] covers the whole block
    pub end: u16,
    /// When set, the slice's last instruction ends this region
    pub region: Option<Arc<BinaryRegion>>,
    /// Memory accesses keyed by decoded-instruction index, ascending.
    /// Owned by the slice; `None` when the block reported none.
    pub mem_accesses: Option<Vec<(usize, MemAccess)>>,
}

impl TbSlice {
    pub fn new(
        index: u32,
        begin: u16,
        end: u16,
        region: Option<Arc<BinaryRegion>>,
        mem_accesses: Option<Vec<(usize, MemAccess)>>,
    ) -> Self {
        Self {
            index,
            begin,
            end,
            region,
            mem_accesses,
        }
    }

    /// Nominal number of instructions covered, before clamping against the
    /// block's actual length.
    pub fn size(&self) -> usize {
        (self.end - self.begin) as usize
    }

    /// Split off the prefix `[begin, split_point)` and keep the suffix.
    ///
    /// The prefix takes the memory accesses below the split point (moved, not
    /// copied) and never carries the region: a region boundary belongs to the
    /// suffix's last instruction.
    pub fn split(&mut self, split_point: u16) -> TbSlice {
        debug_assert!(split_point > self.begin && split_point < self.end);

        let mut taken_accesses = None;
        if let Some(chain) = self.mem_accesses.as_mut() {
            let cut = chain.partition_point(|(idx, _)| *idx < split_point as usize);
            if cut > 0 {
                let suffix = chain.split_off(cut);
                taken_accesses = Some(std::mem::replace(chain, suffix));
            }
        }
        if self.mem_accesses.as_ref().is_some_and(Vec::is_empty) {
            self.mem_accesses = None;
        }

        let taken = TbSlice {
            index: self.index,
            begin: self.begin,
            end: split_point,
            region: None,
            mem_accesses: taken_accesses,
        };
        self.begin = split_point;
        taken
    }
}

#[derive(Debug, Default)]
struct QueueState {
    slices: VecDeque<TbSlice>,
    eof: bool,
}

/// Single-producer single-consumer slice queue with an end-of-stream flag.
#[derive(Debug, Default)]
pub struct SliceQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl SliceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a slice and wake the consumer.
    pub fn push(&self, slice: TbSlice) {
        self.lock().slices.push_back(slice);
        self.ready.notify_one();
    }

    /// Mark end of stream and wake the consumer.
    pub fn mark_eof(&self) {
        self.lock().eof = true;
        self.ready.notify_one();
    }

    /// True once end of stream has been marked.
    pub fn eof(&self) -> bool {
        self.lock().eof
    }

    /// Drain slices until `want` instructions are covered or a slice that
    /// terminates a region has been taken, splitting the head slice when it
    /// carries more than is needed.
    ///
    /// `len_of` reports a slice's deliverable instruction count (the caller
    /// owns the block cache). Slices it reports as empty are discarded.
    ///
    /// Blocks only while the queue is empty and the stream has not ended.
    /// The returned flag is true iff the batch is empty because the stream
    /// has ended.
    pub fn pop_batch<F>(&self, want: usize, blocking: bool, len_of: F) -> (Vec<TbSlice>, bool)
    where
        F: Fn(&TbSlice) -> usize,
    {
        let mut state = self.lock();
        if state.slices.is_empty() {
            if state.eof {
                return (Vec::new(), true);
            }
            if !blocking {
                return (Vec::new(), false);
            }
            while state.slices.is_empty() && !state.eof {
                state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            if state.slices.is_empty() {
                return (Vec::new(), true);
            }
        }

        let mut taken = Vec::new();
        let mut left = want;
        let mut end_of_region = false;
        while left > 0 && !end_of_region {
            let Some(head) = state.slices.front_mut() else {
                break;
            };
            let len = len_of(head);
            if len == 0 {
                // Stale slice (e.g. its block was never translated).
                state.slices.pop_front();
                continue;
            }

            if len > left {
                let split_point = head.begin + left as u16;
                taken.push(head.split(split_point));
                left = 0;
            } else {
                left -= len;
                if let Some(slice) = state.slices.pop_front() {
                    end_of_region = slice.region.is_some();
                    taken.push(slice);
                }
            }
        }
        (taken, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(index: u32, begin: u16, end: u16) -> TbSlice {
        TbSlice::new(index, begin, end, None, None)
    }

    fn region(description: &str) -> Arc<BinaryRegion> {
        Arc::new(BinaryRegion {
            description: description.to_string(),
            start: 0,
            end: 0x10,
        })
    }

    #[test]
    fn test_pop_in_order() {
        let queue = SliceQueue::new();
        queue.push(slice(0, 0, 2));
        queue.push(slice(1, 0, 3));

        let (batch, eof) = queue.pop_batch(8, false, |s| s.size());
        assert!(!eof);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 0);
        assert_eq!(batch[1].index, 1);
    }

    #[test]
    fn test_split_keeps_suffix_queued() {
        let queue = SliceQueue::new();
        let mut head = slice(0, 0, 10);
        head.region = Some(region("L"));
        queue.push(head);

        let (batch, _) = queue.pop_batch(4, false, |s| s.size());
        assert_eq!(batch.len(), 1);
        assert_eq!((batch[0].begin, batch[0].end), (0, 4));
        // The split prefix never carries the region marker.
        assert!(batch[0].region.is_none());

        let (batch, _) = queue.pop_batch(10, false, |s| s.size());
        assert_eq!(batch.len(), 1);
        assert_eq!((batch[0].begin, batch[0].end), (4, 10));
        assert!(batch[0].region.is_some());
    }

    #[test]
    fn test_split_transfers_mem_accesses() {
        let access = |addr| MemAccess {
            is_store: false,
            addr,
            size: 4,
        };
        let mut s = slice(0, 0, 8);
        s.mem_accesses = Some(vec![(1, access(0x10)), (3, access(0x20)), (6, access(0x30))]);

        let taken = s.split(4);
        assert_eq!(
            taken.mem_accesses,
            Some(vec![(1, access(0x10)), (3, access(0x20))])
        );
        assert_eq!(s.mem_accesses, Some(vec![(6, access(0x30))]));
        assert_eq!(s.begin, 4);
    }

    #[test]
    fn test_split_with_no_prefix_accesses() {
        let access = MemAccess {
            is_store: true,
            addr: 0x10,
            size: 4,
        };
        let mut s = slice(0, 0, 8);
        s.mem_accesses = Some(vec![(6, access)]);

        let taken = s.split(4);
        assert!(taken.mem_accesses.is_none());
        assert_eq!(s.mem_accesses, Some(vec![(6, access)]));
    }

    #[test]
    fn test_region_slice_terminates_batch() {
        let queue = SliceQueue::new();
        let mut first = slice(0, 0, 3);
        first.region = Some(region("L"));
        queue.push(first);
        queue.push(slice(1, 0, 5));

        // Plenty of budget, but the batch stops at the end-of-region slice.
        let (batch, _) = queue.pop_batch(16, false, |s| s.size());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].index, 0);

        let (batch, _) = queue.pop_batch(16, false, |s| s.size());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].index, 1);
    }

    #[test]
    fn test_eof_after_drain() {
        let queue = SliceQueue::new();
        queue.push(slice(0, 0, 2));
        queue.mark_eof();

        let (batch, eof) = queue.pop_batch(8, true, |s| s.size());
        assert_eq!(batch.len(), 1);
        assert!(!eof);

        let (batch, eof) = queue.pop_batch(8, true, |s| s.size());
        assert!(batch.is_empty());
        assert!(eof);
    }

    #[test]
    fn test_nonblocking_empty() {
        let queue = SliceQueue::new();
        let (batch, eof) = queue.pop_batch(8, false, |s| s.size());
        assert!(batch.is_empty());
        assert!(!eof);
    }

    #[test]
    fn test_stale_slice_discarded() {
        let queue = SliceQueue::new();
        queue.push(slice(7, 0, 4));
        queue.push(slice(8, 0, 2));

        // Pretend block 7 never became available.
        let (batch, _) = queue.pop_batch(8, false, |s| if s.index == 7 { 0 } else { s.size() });
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].index, 8);
    }

    #[test]
    fn test_blocking_consumer_wakes_on_push() {
        use std::thread;
        use std::time::Duration;

        let queue = Arc::new(SliceQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(slice(3, 0, 1));
            })
        };

        let (batch, eof) = queue.pop_batch(1, true, |s| s.size());
        assert!(!eof);
        assert_eq!(batch[0].index, 3);
        producer.join().unwrap();
    }
}
