//! Per-instruction metadata exchange between the broker and the simulator.
//!
//! Delivered instructions get a monotonically increasing trace sequence
//! number; side-band metadata (currently load/store-unit memory accesses) is
//! filed under a category keyed by that number. The index map lets the
//! simulator go from an instruction it was handed to its sequence number.

use std::collections::HashMap;

use crate::MemAccess;

/// Category for load/store-unit memory accesses.
pub const LSUNIT_MEM_ACCESS: u32 = 0;

/// First category tag free for downstream extensions.
pub const MD_FIRST_CUSTOM: u32 = 1;

/// Stable identity of a delivered instruction: the block's code arena pointer
/// and the instruction's index within it.
pub type InstKey = (usize, usize);

/// Category -> (trace sequence number -> access) store, owned by the
/// simulator side.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    categories: HashMap<u32, HashMap<u32, MemAccess>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category_mut(&mut self, category: u32) -> &mut HashMap<u32, MemAccess> {
        self.categories.entry(category).or_default()
    }

    pub fn get(&self, category: u32, seq: u32) -> Option<&MemAccess> {
        self.categories.get(&category)?.get(&seq)
    }
}

/// Borrowed registry plus the instruction -> sequence-number map the broker
/// fills during a fetch.
#[derive(Debug)]
pub struct MetadataExchanger<'a> {
    pub registry: &'a mut MetadataRegistry,
    pub index_map: &'a mut HashMap<InstKey, u32>,
}
