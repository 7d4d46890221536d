//! Capstone-based decoder adapter behind the [`Decoder`] trait.
//!
//! ARM-family targets can switch between the ARM and Thumb instruction sets
//! half-way through a trace, so the adapter keeps two Capstone instances and
//! picks one per translation block from the low bit of the block's start
//! address. M-class profiles execute Thumb only and get a single instance.

use std::fmt;

use capstone::arch::arm::ArchMode as ArmMode;
use capstone::arch::arm64::ArchMode as Arm64Mode;
use capstone::arch::riscv::ArchMode as RiscVMode;
use capstone::arch::x86::ArchMode as X86Mode;
use capstone::prelude::BuildsCapstone;
use capstone::Capstone;

use crate::{Address, Decoder, Insn, MAX_INSTRUCTION_SIZE};

/// Errors that can occur during decoding
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    Capstone(#[from] capstone::Error),

    /// Bytes do not form a valid instruction
    #[error("Invalid instruction at {0:#x}")]
    InvalidInstruction(Address),
}

/// Supported guest architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM starting in ARM mode
    Arm,
    /// ARM starting in Thumb mode
    Thumb,
    /// M-class ARM profile (Thumb only, no mode switching)
    ArmMClass,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// RISC-V 32-bit
    RiscV32,
    /// RISC-V 64-bit
    RiscV64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::Thumb => write!(f, "Thumb"),
            Architecture::ArmMClass => write!(f, "ARM M-class"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::RiscV32 => write!(f, "RISC-V 32"),
            Architecture::RiscV64 => write!(f, "RISC-V 64"),
        }
    }
}

/// A Capstone-backed decoder with optional ARM/Thumb duality.
pub struct CapstoneDecoder {
    arch: Architecture,
    primary: Capstone,
    /// Instance for the opposite ARM/Thumb mode, when the target has one
    secondary: Option<Capstone>,
    primary_is_thumb: bool,
    use_secondary: bool,
}

// SAFETY: Capstone's C-API handle is thread-safe if you never decode
// concurrently on the *same* handle; the receiver thread owns this decoder
// exclusively.
unsafe impl Send for CapstoneDecoder {}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture.
    pub fn for_architecture(arch: Architecture) -> Result<Self, DecoderError> {
        let (primary, secondary, primary_is_thumb) = match arch {
            Architecture::X86_32 => (build_x86_32()?, None, false),
            Architecture::X86_64 => (build_x86_64()?, None, false),
            Architecture::Arm => (build_arm()?, Some(build_thumb()?), false),
            Architecture::Thumb => (build_thumb()?, Some(build_arm()?), true),
            Architecture::ArmMClass => (build_thumb()?, None, true),
            Architecture::AArch64 => (build_aarch64()?, None, false),
            Architecture::RiscV32 => (build_riscv32()?, None, false),
            Architecture::RiscV64 => (build_riscv64()?, None, false),
        };

        Ok(Self {
            arch,
            primary,
            secondary,
            primary_is_thumb,
            use_secondary: false,
        })
    }

    /// Get the architecture of this decoder
    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    fn active(&self) -> &Capstone {
        match &self.secondary {
            Some(secondary) if self.use_secondary => secondary,
            _ => &self.primary,
        }
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.arch)
    }
}

/// Build an x86 32-bit decoder
fn build_x86_32() -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .x86()
        .mode(X86Mode::Mode32)
        .detail(false)
        .build()?)
}

/// Build an x86 64-bit decoder
fn build_x86_64() -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .x86()
        .mode(X86Mode::Mode64)
        .detail(false)
        .build()?)
}

/// Build an ARM (ARM mode) decoder
fn build_arm() -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .arm()
        .mode(ArmMode::Arm)
        .detail(false)
        .build()?)
}

/// Build an ARM (Thumb mode) decoder
fn build_thumb() -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .arm()
        .mode(ArmMode::Thumb)
        .detail(false)
        .build()?)
}

/// Build an AArch64 decoder
fn build_aarch64() -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .arm64()
        .mode(Arm64Mode::Arm)
        .detail(false)
        .build()?)
}

/// Build a RISC-V 32-bit decoder
fn build_riscv32() -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .riscv()
        .mode(RiscVMode::RiscV32)
        .detail(false)
        .build()?)
}

/// Build a RISC-V 64-bit decoder
fn build_riscv64() -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .riscv()
        .mode(RiscVMode::RiscV64)
        .detail(false)
        .build()?)
}

impl Decoder for CapstoneDecoder {
    fn mode_switching(&self) -> bool {
        matches!(
            self.arch,
            Architecture::Arm | Architecture::Thumb | Architecture::ArmMClass
        )
    }

    fn select_mode(&mut self, pc: Address) {
        if self.secondary.is_some() {
            let want_thumb = pc & 1 == 1;
            self.use_secondary = want_thumb != self.primary_is_thumb;
        }
    }

    fn decode(&self, bytes: &[u8], addr: Address) -> Result<(Insn, usize), DecoderError> {
        // Only look at a small window (16 bytes max)
        let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_SIZE)];

        let decoded = self.active().disasm_count(window, addr, 1)?;
        let inst = decoded
            .iter()
            .next()
            .ok_or(DecoderError::InvalidInstruction(addr))?;

        // Copy up to MAX_INSTRUCTION_SIZE bytes of encoding
        let mut encoding = [0u8; MAX_INSTRUCTION_SIZE];
        for (i, byte) in inst.bytes().iter().enumerate().take(MAX_INSTRUCTION_SIZE) {
            encoding[i] = *byte;
        }
        let size = inst.bytes().len();

        Ok((
            Insn {
                addr: inst.address(),
                size: size as u8,
                mnemonic: inst.mnemonic().unwrap_or("").to_string(),
                operands: inst.op_str().unwrap_or("").to_string(),
                bytes: encoding,
            },
            size,
        ))
    }
}
