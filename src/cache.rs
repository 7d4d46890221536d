//! Translation-block cache with lazy disassembly.
//!
//! The emulator assigns each translated block a dense 32-bit index; the cache
//! is a slot vector grown on demand. A block arrives as raw instruction bytes
//! and is disassembled on its first execution, when the block's start address
//! becomes known. The decoded form is frozen behind an [`Arc`] so consumer
//! borrows stay valid no matter how the slot vector grows afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Address, Decoder, Insn, RawInst};

/// The frozen product of disassembling one translation block.
#[derive(Debug)]
pub struct TranslatedCode {
    /// Base virtual address of the block (ARM: mode bit stripped)
    pub vaddr: Address,
    /// Decoded instructions, in execution order
    pub insts: Vec<Insn>,
    /// Byte offset from `vaddr` for each decoded instruction
    pub vaddr_offsets: Vec<u32>,
    /// Raw-instruction index -> decoded-instruction index, present only where
    /// a single raw instruction expanded to multiple decoded ones
    pub skew: HashMap<usize, usize>,
}

impl TranslatedCode {
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }
}

#[derive(Debug)]
struct TranslationBlock {
    raw_insts: Vec<RawInst>,
    code: Option<Arc<TranslatedCode>>,
}

/// Error type for cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// `ExecTb` referenced an index never announced by a `TranslatedBlock`
    #[error("Unknown translation block index {0}")]
    UnknownIndex(u32),
}

/// Index -> translation block store shared between receiver and consumer.
#[derive(Debug, Default)]
pub struct TbCache {
    slots: Mutex<Vec<Option<TranslationBlock>>>,
}

impl TbCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<TranslationBlock>>> {
        // A poisoned lock only means a peer thread panicked mid-read; the
        // slot vector itself is still consistent.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an untranslated block, growing the cache if needed.
    /// Re-insertion of the same index is last-write-wins.
    pub fn insert(&self, index: u32, raw_insts: Vec<RawInst>) {
        let mut slots = self.slots();
        let idx = index as usize;
        if idx >= slots.len() {
            slots.resize_with(idx + 1, || None);
        }
        slots[idx] = Some(TranslationBlock {
            raw_insts,
            code: None,
        });
    }

    /// Return the block's decoded form, disassembling it first if this is the
    /// block's first execution. `pc` becomes the block's virtual address.
    pub fn ensure_translated(
        &self,
        index: u32,
        pc: Address,
        decoder: &mut dyn Decoder,
    ) -> Result<Arc<TranslatedCode>, CacheError> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(index as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(CacheError::UnknownIndex(index))?;

        if let Some(code) = &slot.code {
            return Ok(code.clone());
        }

        let code = Arc::new(translate(&slot.raw_insts, pc, decoder));
        slot.code = Some(code.clone());
        Ok(code)
    }

    /// Read-only access to an already-translated block.
    pub fn get(&self, index: u32) -> Option<Arc<TranslatedCode>> {
        self.slots()
            .get(index as usize)
            .and_then(|slot| slot.as_ref())
            .and_then(|tb| tb.code.clone())
    }
}

/// Disassemble a block's raw instructions.
///
/// One raw instruction may decode to several instructions; every extra one
/// skews the index mapping for all later raw instructions. A raw instruction
/// that fails to decode is logged and skipped so the rest of the trace
/// survives a local decode failure.
fn translate(raw_insts: &[RawInst], pc: Address, decoder: &mut dyn Decoder) -> TranslatedCode {
    decoder.select_mode(pc);
    // The mode bit must not interfere with decoding.
    let start_vaddr = if decoder.mode_switching() {
        pc & !1
    } else {
        pc
    };

    log::debug!(
        "Disassembling {} instructions at {:#x}",
        raw_insts.len(),
        start_vaddr
    );

    let mut insts = Vec::with_capacity(raw_insts.len());
    let mut vaddr_offsets = Vec::with_capacity(raw_insts.len());
    let mut skew = HashMap::new();
    let mut skew_offset = 0usize;
    let mut vaddr = start_vaddr;

    for (raw_idx, raw) in raw_insts.iter().enumerate() {
        if skew_offset > 0 {
            skew.insert(raw_idx, raw_idx + skew_offset);
        }

        let mut index = 0usize;
        let mut decoded = 0usize;
        while index < raw.len() {
            let addr = vaddr + index as Address;
            match decoder.decode(&raw[index..], addr) {
                Ok((inst, consumed)) => {
                    // Zero-length results must still make progress.
                    let consumed = consumed.max(1);
                    insts.push(inst);
                    vaddr_offsets.push((addr - start_vaddr) as u32);
                    index += consumed;
                    decoded += 1;
                    if decoded > 1 {
                        skew_offset += 1;
                    }
                }
                Err(e) => {
                    log::error!(
                        "Failed to disassemble instruction {:02x?} at {:#x}: {}",
                        &raw[index..],
                        addr,
                        e
                    );
                    break;
                }
            }
        }
        vaddr += raw.len() as Address;
    }

    TranslatedCode {
        vaddr: start_vaddr,
        insts,
        vaddr_offsets,
        skew,
    }
}
