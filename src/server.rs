//! Receiver loop: accepts emulator connections and ingests trace messages.
//!
//! A single thread owns the listen socket. Clients are served one at a time;
//! each connection is read until EOF or a malformed frame, then closed. The
//! message dispatch itself lives in [`Ingest`], which has no socket so the
//! state machine can be exercised directly.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use crate::cache::{CacheError, TbCache, TranslatedCode};
use crate::codec::{FrameDecoder, Message, RawMemAccess};
use crate::queue::{SliceQueue, TbSlice, OPEN_END};
use crate::regions::{BinaryRegion, BinaryRegions};
use crate::{Address, Decoder, MemAccess};

/// Message dispatch state machine.
///
/// `cur_region` and `code_start` belong to the receiver thread alone; their
/// transitions interleave with queue pushes but need no locking of their own.
pub(crate) struct Ingest {
    pub(crate) cache: Arc<TbCache>,
    pub(crate) queue: Arc<SliceQueue>,
    regions: Option<Arc<BinaryRegions>>,
    decoder: Box<dyn Decoder>,
    cur_region: Option<Arc<BinaryRegion>>,
    code_start: Address,
}

impl Ingest {
    pub(crate) fn new(
        cache: Arc<TbCache>,
        queue: Arc<SliceQueue>,
        regions: Option<Arc<BinaryRegions>>,
        decoder: Box<dyn Decoder>,
    ) -> Self {
        Self {
            cache,
            queue,
            regions,
            decoder,
            cur_region: None,
            code_start: 0,
        }
    }

    pub(crate) fn handle_message(&mut self, msg: Message) {
        if msg.is_end_of_stream() {
            log::debug!("Received end-of-stream signal");
            self.queue.mark_eof();
            return;
        }

        match msg {
            Message::Metadata { load_addr } => self.code_start = load_addr,
            Message::TranslatedBlock { index, insts } => self.cache.insert(index, insts),
            Message::ExecTb {
                index,
                pc,
                mem_accesses,
            } => self.exec_tb(index, pc, mem_accesses),
        }
    }

    fn exec_tb(&mut self, index: u32, pc: Address, accesses: Vec<RawMemAccess>) {
        let code = match self
            .cache
            .ensure_translated(index, pc, self.decoder.as_mut())
        {
            Ok(code) => code,
            Err(CacheError::UnknownIndex(_)) => {
                log::error!("Invalid translation block index {}", index);
                return;
            }
        };

        let Some((begin, end, region)) = self.slice_bounds(&code) else {
            return;
        };

        let mem_accesses = materialize_accesses(&code, &accesses, begin, end);
        self.queue
            .push(TbSlice::new(index, begin, end, region, mem_accesses));
    }

    /// Compute the slice range for one executed block and track region
    /// entry/exit. Returns `None` for an empty slice.
    fn slice_bounds(
        &mut self,
        code: &TranslatedCode,
    ) -> Option<(u16, u16, Option<Arc<BinaryRegion>>)> {
        let mut begin: u16 = 0;
        let mut end: u16 = OPEN_END;
        let mut region = None;

        if let Some(regions) = self.regions.as_ref().filter(|r| !r.is_empty()) {
            let offsets = &code.vaddr_offsets;
            let mut i = 0usize;

            if self.cur_region.is_none() {
                // Not inside a region: only an exact match on a start
                // address opens one.
                begin = end;
                if code.vaddr >= self.code_start {
                    let va = code.vaddr - self.code_start;
                    while i < offsets.len() {
                        if let Some(r) = regions.lookup(va + u64::from(offsets[i])) {
                            self.cur_region = Some(r.clone());
                            break;
                        }
                        i += 1;
                    }
                    if let Some(r) = &self.cur_region {
                        begin = i as u16;
                        log::debug!("Start to analyze region {} @ offset {:#x}", r.description, va);
                    }
                }
            }

            if let Some(cur) = self.cur_region.as_ref() {
                if code.vaddr >= self.code_start {
                    // Watch for an instruction that hits the end address.
                    let va = code.vaddr - self.code_start;
                    while i < offsets.len() {
                        if cur.end == va + u64::from(offsets[i]) {
                            break;
                        }
                        i += 1;
                    }
                    if i < offsets.len() {
                        end = (i + 1) as u16;
                        region = self.cur_region.take();
                        if let Some(r) = &region {
                            log::debug!("Terminating region {}", r.description);
                        }
                    }
                }
            }
        }

        if begin == end {
            return None;
        }
        Some((begin, end, region))
    }
}

/// Remap raw-instruction indices through the block's skew table and merge
/// adjacent accesses on the same instruction. Entries outside the slice range
/// are dropped; an empty result is `None`.
fn materialize_accesses(
    code: &TranslatedCode,
    accesses: &[RawMemAccess],
    begin: u16,
    end: u16,
) -> Option<Vec<(usize, MemAccess)>> {
    if accesses.is_empty() {
        return None;
    }

    let mut chain: Vec<(usize, MemAccess)> = Vec::with_capacity(accesses.len());
    for raw in accesses {
        let mut idx = raw.index as usize;
        if let Some(&mapped) = code.skew.get(&idx) {
            idx = mapped;
        }

        let access = MemAccess {
            is_store: raw.is_store,
            addr: raw.vaddr,
            size: raw.size,
        };
        if let Some((last_idx, last)) = chain.last_mut() {
            if *last_idx == idx {
                last.widen(access);
                continue;
            }
        }
        chain.push((idx, access));
    }

    chain.retain(|(idx, _)| (begin as usize) <= *idx && *idx < end as usize);
    if chain.is_empty() {
        None
    } else {
        Some(chain)
    }
}

/// The socket side of the receiver thread.
pub(crate) struct Receiver {
    listener: TcpListener,
    /// Connections to serve before ceasing operation; 0 means unbounded
    max_connections: u32,
    ingest: Ingest,
}

impl Receiver {
    pub(crate) fn new(listener: TcpListener, max_connections: u32, ingest: Ingest) -> Self {
        Self {
            listener,
            max_connections,
            ingest,
        }
    }

    /// Accept and serve clients until the connection cap is reached.
    pub(crate) fn run(mut self) {
        match self.listener.local_addr() {
            Ok(addr) => log::info!("Listening on {}...", addr),
            Err(_) => log::info!("Listening..."),
        }

        let mut remaining = self.max_connections;
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("Got a new client {}", peer);
                    stream
                }
                Err(e) => {
                    log::error!("Failed to accept client: {}", e);
                    continue;
                }
            };

            self.serve_client(stream);

            if self.max_connections > 0 {
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }

        // However the loop ended, the consumer must not wait forever.
        self.ingest.queue.mark_eof();
        log::debug!("Receiver shutting down");
    }

    /// Read frames from one client until EOF or a malformed frame.
    fn serve_client(&mut self, mut stream: TcpStream) {
        let mut codec = FrameDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("Closing current client...");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    log::error!("Failed to read from client: {}", e);
                    return;
                }
            };

            codec.feed(&buf[..n]);
            loop {
                match codec.next_message() {
                    Ok(Some(msg)) => self.ingest.handle_message(msg),
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Malformed frame, dropping client: {}", e);
                        return;
                    }
                }
            }
        }
    }
}
