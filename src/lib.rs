//! Trace-ingestion engine for a machine-code analysis daemon.
//!
//! A dynamic-translation emulator streams the basic blocks it executes over a
//! TCP socket. This library receives that stream, reconstructs the
//! architectural instruction sequence the guest actually ran using a
//! Capstone-backed decoder, slices it against a user-supplied table of binary
//! regions of interest, and hands the decoded instructions (plus per-access
//! memory metadata) to a downstream pipeline simulator through the
//! [`broker::Broker`] interface.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use mcad_broker::broker::{Broker, BrokerConfig, FetchedInst, TraceBroker};
//! use mcad_broker::decoder::{Architecture, CapstoneDecoder};
//!
//! // Create a decoder for the guest architecture.
//! let decoder = CapstoneDecoder::for_architecture(Architecture::X86_64).unwrap();
//!
//! // Bind the listen socket and kick off the receiver thread.
//! let config = BrokerConfig::default();
//! let mut broker = TraceBroker::new(config, Box::new(decoder)).unwrap();
//!
//! // Drain decoded instructions as the emulator executes.
//! let mut buf: Vec<Option<FetchedInst>> = vec![None; 64];
//! loop {
//!     let (count, region) = broker.fetch_region(&mut buf, -1, None);
//!     if count < 0 {
//!         break; // end of stream
//!     }
//!     // Feed buf[0..count] to the pipeline simulator...
//!     let _ = region;
//! }
//! ```

pub mod broker;
pub mod cache;
pub mod codec;
pub mod decoder;
pub mod metadata;
pub mod queue;
pub mod regions;
mod server;
mod stream_tests;

use std::fmt;

/// Represents an address in guest memory
pub type Address = u64;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Guest-instruction bytes exactly as they appeared in a translation block.
pub type RawInst = Vec<u8>;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl Insn {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.operands)
    }
}

/// One memory access performed by a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    /// True for stores, false for loads
    pub is_store: bool,
    /// Lowest virtual address touched
    pub addr: u64,
    /// Number of bytes touched
    pub size: u32,
}

impl MemAccess {
    /// Fold another access on the same instruction into this one: stores
    /// dominate and the address ranges are unioned.
    pub fn widen(&mut self, other: MemAccess) {
        self.is_store |= other.is_store;
        let start = self.addr.min(other.addr);
        let end = (self.addr + u64::from(self.size)).max(other.addr + u64::from(other.size));
        self.addr = start;
        self.size = (end - start) as u32;
    }
}

/// Decoder trait: architecture-specific disassembler.
///
/// The receiver thread owns the decoder exclusively, hence `Send` but not
/// `Sync`.
pub trait Decoder: Send {
    /// True when block start addresses carry an instruction-set mode bit in
    /// their LSB (the ARM family). The cache strips that bit before recording
    /// the block's virtual address.
    fn mode_switching(&self) -> bool {
        false
    }

    /// Choose the decoder instance for a block that starts executing at `pc`.
    /// A no-op for targets without mode switching.
    fn select_mode(&mut self, _pc: Address) {}

    /// Decode one instruction from the front of `bytes`, reporting `addr` as
    /// its address.
    ///
    /// # Returns
    /// The decoded instruction and the number of bytes consumed.
    fn decode(&self, bytes: &[u8], addr: Address) -> Result<(Insn, usize), decoder::DecoderError>;
}

/// Error type for broker construction and plugin registration
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Failed to bind the listen socket
    #[error("Failed to bind listen socket: {0}")]
    Bind(#[source] std::io::Error),

    /// Malformed plugin argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Decoder error
    #[error(transparent)]
    Decoder(#[from] decoder::DecoderError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
