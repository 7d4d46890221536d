//! Length-prefixed wire codec for emulator trace messages.
//!
//! Each frame on the wire is a 4-byte little-endian payload size followed by
//! exactly that many payload bytes. Framing is *exclusive*: the size does not
//! count the prefix itself. Emulator-side clients must encode with the same
//! convention; [`encode`] is the reference encoder.
//!
//! A payload is one tag byte followed by little-endian fields:
//!
//! | Tag | Message | Fields |
//! |-----|---------|--------|
//! | 0 | `Metadata` | `u64 load_addr` |
//! | 1 | `TranslatedBlock` | `u32 index`, `u32 count`, then `count` × (`u8 len`, `len` bytes) |
//! | 2 | `ExecTb` | `u32 index`, `u64 pc`, `u32 count`, then `count` × (`u32 index`, `u8 is_store`, `u64 vaddr`, `u32 size`) |
//!
//! End of stream is signaled in-band by an `ExecTb` whose index and pc are
//! all-ones; the emulator may keep the connection open afterwards.

use crate::RawInst;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

const MSG_METADATA: u8 = 0;
const MSG_TRANSLATED_BLOCK: u8 = 1;
const MSG_EXEC_TB: u8 = 2;

/// Smallest possible wire size of one memory-access entry.
const MEM_ACCESS_WIRE_SIZE: usize = 4 + 1 + 8 + 4;

/// One memory access reported by the emulator, indexed by raw instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMemAccess {
    /// Raw-instruction index within the translation block
    pub index: u32,
    /// True for stores, false for loads
    pub is_store: bool,
    /// Virtual address of the access
    pub vaddr: u64,
    /// Access size in bytes
    pub size: u32,
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Where the guest image was loaded; region offsets are relative to this.
    Metadata { load_addr: u64 },
    /// A block the emulator translated, as raw instruction byte sequences.
    TranslatedBlock { index: u32, insts: Vec<RawInst> },
    /// A block the emulator executed, with optional memory-access metadata.
    ExecTb {
        index: u32,
        pc: u64,
        mem_accesses: Vec<RawMemAccess>,
    },
}

impl Message {
    /// True for the in-band end-of-stream sentinel.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Message::ExecTb {
                index: u32::MAX,
                pc: u64::MAX,
                ..
            }
        )
    }
}

/// Errors that make a frame undecodable. Any of these terminates the current
/// client connection.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame claims a zero-byte payload
    #[error("Empty frame")]
    EmptyFrame,

    /// Frame exceeds the payload limit
    #[error("Frame size {0} exceeds the {MAX_FRAME_SIZE}-byte limit")]
    Oversize(usize),

    /// Unrecognized message tag
    #[error("Unknown message tag {0}")]
    UnknownTag(u8),

    /// Payload ended before all declared fields
    #[error("Truncated {0} payload")]
    Truncated(&'static str),

    /// Payload carries bytes past the last field
    #[error("Frame has {0} trailing bytes after the payload")]
    TrailingBytes(usize),

    /// Raw instruction length outside 1..=16
    #[error("Instruction length {0} is outside 1..=16")]
    BadInstLength(usize),

    /// Boolean field that is neither 0 nor 1
    #[error("Invalid boolean byte {0}")]
    BadBool(u8),
}

/// Little-endian field reader over one frame payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated(self.what));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Incremental frame decoder. Feed it raw socket bytes, then drain complete
/// messages; `Ok(None)` means more input is needed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the wire.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        let pending = &self.buf[self.pos..];
        if pending.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if size == 0 {
            return Err(CodecError::EmptyFrame);
        }
        if size > MAX_FRAME_SIZE {
            return Err(CodecError::Oversize(size));
        }
        if pending.len() < 4 + size {
            return Ok(None);
        }

        let msg = parse_payload(&pending[4..4 + size])?;
        self.pos += 4 + size;
        Ok(Some(msg))
    }
}

fn parse_payload(payload: &[u8]) -> Result<Message, CodecError> {
    let mut reader = Reader::new(payload, "message");
    match reader.u8()? {
        MSG_METADATA => {
            reader.what = "metadata";
            let load_addr = reader.u64()?;
            reader.finish()?;
            Ok(Message::Metadata { load_addr })
        }
        MSG_TRANSLATED_BLOCK => {
            reader.what = "translated block";
            let index = reader.u32()?;
            let count = reader.u32()? as usize;
            // Each instruction needs at least a length byte and one data byte.
            if count.saturating_mul(2) > reader.remaining() {
                return Err(CodecError::Truncated(reader.what));
            }
            let mut insts = Vec::with_capacity(count);
            for _ in 0..count {
                let len = reader.u8()? as usize;
                if !(1..=crate::MAX_INSTRUCTION_SIZE).contains(&len) {
                    return Err(CodecError::BadInstLength(len));
                }
                insts.push(reader.take(len)?.to_vec());
            }
            reader.finish()?;
            Ok(Message::TranslatedBlock { index, insts })
        }
        MSG_EXEC_TB => {
            reader.what = "exec";
            let index = reader.u32()?;
            let pc = reader.u64()?;
            let count = reader.u32()? as usize;
            if count.saturating_mul(MEM_ACCESS_WIRE_SIZE) > reader.remaining() {
                return Err(CodecError::Truncated(reader.what));
            }
            let mut mem_accesses = Vec::with_capacity(count);
            for _ in 0..count {
                let access_index = reader.u32()?;
                let is_store = match reader.u8()? {
                    0 => false,
                    1 => true,
                    other => return Err(CodecError::BadBool(other)),
                };
                let vaddr = reader.u64()?;
                let size = reader.u32()?;
                mem_accesses.push(RawMemAccess {
                    index: access_index,
                    is_store,
                    vaddr,
                    size,
                });
            }
            reader.finish()?;
            Ok(Message::ExecTb {
                index,
                pc,
                mem_accesses,
            })
        }
        tag => Err(CodecError::UnknownTag(tag)),
    }
}

/// Encode a message as a complete frame, size prefix included.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut payload = Vec::new();
    match msg {
        Message::Metadata { load_addr } => {
            payload.push(MSG_METADATA);
            payload.extend_from_slice(&load_addr.to_le_bytes());
        }
        Message::TranslatedBlock { index, insts } => {
            payload.push(MSG_TRANSLATED_BLOCK);
            payload.extend_from_slice(&index.to_le_bytes());
            payload.extend_from_slice(&(insts.len() as u32).to_le_bytes());
            for inst in insts {
                payload.push(inst.len() as u8);
                payload.extend_from_slice(inst);
            }
        }
        Message::ExecTb {
            index,
            pc,
            mem_accesses,
        } => {
            payload.push(MSG_EXEC_TB);
            payload.extend_from_slice(&index.to_le_bytes());
            payload.extend_from_slice(&pc.to_le_bytes());
            payload.extend_from_slice(&(mem_accesses.len() as u32).to_le_bytes());
            for access in mem_accesses {
                payload.extend_from_slice(&access.index.to_le_bytes());
                payload.push(access.is_store as u8);
                payload.extend_from_slice(&access.vaddr.to_le_bytes());
                payload.extend_from_slice(&access.size.to_le_bytes());
            }
        }
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}
