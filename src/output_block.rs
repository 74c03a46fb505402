//! Block-typed, thread-safe, append-plus-rewrite-in-place binary output
//! (spec §4.2). A trace file is a sequence of fixed-header *blocks*, each
//! reserved by bumping a file-level atomic cursor so concurrent writers to
//! different blocks never contend.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::trace_format::BlockType;

/// The byte length of a block header: 1-byte type tag + 8-byte next-block
/// offset (spec §6 file format).
pub const BLOCK_HEADER_SIZE: u64 = 9;

/// A handle permitting a later in-place rewrite of exactly the span it names
/// (spec G3). Carries no file descriptor of its own; the writer that issued
/// it owns the underlying file.
#[derive(Clone, Copy, Debug)]
pub struct WriteRecord {
    offset: u64,
    size: u64,
}

impl WriteRecord {
    pub(crate) fn new(offset: u64, size: u64) -> Self {
        WriteRecord { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// The shared trace file plus the global "next free byte" counter.
///
/// `getOutputBlock` atomically bumps the counter by the requested size and
/// returns an `OutputBlock` over the reserved region; the block's header is
/// written by the caller once it knows the block's type and has a next-block
/// offset to chain from (it may chain to itself, `0`, until a subsequent
/// block is reserved).
pub struct OutputStreamAllocator {
    file: Mutex<File>,
    next_free: AtomicU64,
    /// Header offset of the most recently reserved block, across every
    /// stream. Every new reservation patches this block's next-block offset
    /// to point at itself before replacing it, so the blocks of unrelated
    /// streams end up threaded into one file-wide chain (spec P8: starting
    /// at offset 8 and following each block's next-block offset visits every
    /// block exactly once).
    last_block_header: Mutex<Option<u64>>,
}

impl OutputStreamAllocator {
    /// Creates the allocator, writing the 8-byte magic and leaving the
    /// cursor positioned immediately after it.
    pub fn create(file: File) -> io::Result<Self> {
        let mut f = file;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(crate::trace_format::MAGIC)?;
        f.flush()?;
        Ok(OutputStreamAllocator {
            file: Mutex::new(f),
            next_free: AtomicU64::new(crate::trace_format::MAGIC.len() as u64),
            last_block_header: Mutex::new(None),
        })
    }

    /// Atomically reserves `size` bytes (including the block header) and
    /// returns an `OutputBlock` over them. Does not write a header or link
    /// the block into the file-wide chain; use `reserve_block` for that.
    pub fn get_output_block(&self, size: u64) -> io::Result<OutputBlock> {
        let start = self.next_free.fetch_add(size, Ordering::SeqCst);
        {
            let mut f = self.file.lock().unwrap();
            let end = start + size;
            f.set_len(f.metadata()?.len().max(end))?;
        }
        Ok(OutputBlock { start, cursor: AtomicU64::new(start), end: start + size })
    }

    /// Reserves `size` bytes, writes this block's header (`next` set to `0`
    /// as a provisional end-of-chain marker), and threads it after whichever
    /// block this allocator most recently reserved, regardless of stream.
    pub fn reserve_block(&self, size: u64, ty: BlockType) -> io::Result<OutputBlock> {
        let block = self.get_output_block(size)?;
        write_block_header(self, block.start(), ty, 0)?;
        let mut last = self.last_block_header.lock().unwrap();
        if let Some(prev_header) = *last {
            self.write_at(prev_header + 1, &block.start().to_le_bytes())?;
        }
        *last = Some(block.start());
        Ok(block)
    }

    /// Writes `buf` at the absolute offset `offset`, without touching the
    /// allocator's append cursor. Used for header writes and rewrites.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buf)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::io::Read;
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().unwrap().sync_all()
    }
}

/// An atomic cursor into a pre-reserved file region, plus the region's end
/// offset. One block is written by at most one logical writer (spec G1); the
/// file is append-only with respect to new reservations (spec G2).
pub struct OutputBlock {
    start: u64,
    cursor: AtomicU64,
    end: u64,
}

impl OutputBlock {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.cursor.load(Ordering::SeqCst))
    }

    /// Atomically bumps the cursor by `buf.len()` and returns the offset the
    /// bytes should land at, or `None` if that would exceed the block's end.
    fn reserve(&self, len: u64) -> Option<u64> {
        let mut cur = self.cursor.load(Ordering::SeqCst);
        loop {
            let new_cur = cur.checked_add(len)?;
            if new_cur > self.end {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                cur,
                new_cur,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(cur),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Writes `buf` at the next free offset in this block. Fails (without
    /// partial writes) if the block does not have `buf.len()` bytes left.
    pub fn write(&self, alloc: &OutputStreamAllocator, buf: &[u8]) -> io::Result<Option<u64>> {
        let Some(offset) = self.reserve(buf.len() as u64) else { return Ok(None) };
        alloc.write_at(offset, buf)?;
        Ok(Some(offset))
    }

    /// Like `write`, but also returns a `WriteRecord` permitting a later
    /// in-place rewrite of exactly this span.
    pub fn rewritable_write(
        &self,
        alloc: &OutputStreamAllocator,
        buf: &[u8],
    ) -> io::Result<Option<WriteRecord>> {
        match self.write(alloc, buf)? {
            Some(offset) => Ok(Some(WriteRecord { offset, size: buf.len() as u64 })),
            None => Ok(None),
        }
    }
}

/// Walks the file-wide block chain starting at offset 8, yielding each
/// block's `(header_offset, type, next_offset)` in chain order (spec P8).
/// Stops at the first `next_offset == 0`, which terminates the chain.
pub fn walk_blocks(alloc: &OutputStreamAllocator) -> io::Result<Vec<(u64, BlockType, u64)>> {
    let mut blocks = Vec::new();
    let mut offset = crate::trace_format::MAGIC.len() as u64;
    loop {
        let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
        if alloc.read_at(offset, &mut header).is_err() {
            break;
        }
        let Some(ty) = BlockType::from_u8(header[0]) else { break };
        let next = u64::from_le_bytes(header[1..9].try_into().unwrap());
        blocks.push((offset, ty, next));
        if next == 0 {
            break;
        }
        offset = next;
    }
    Ok(blocks)
}

/// Writes the 9-byte block header (type tag + absolute next-block offset).
pub fn write_block_header(
    alloc: &OutputStreamAllocator,
    block_start: u64,
    ty: BlockType,
    next_block_offset: u64,
) -> io::Result<()> {
    let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
    buf[0] = ty as u8;
    buf[1..9].copy_from_slice(&next_block_offset.to_le_bytes());
    alloc.write_at(block_start, &buf)
}

/// Default block size for streams that acquire fresh blocks lazily.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// A writer that lazily acquires fresh blocks of a configured size; on a
/// write that would overflow the current block, it retries once in a new
/// block (spec §4.2 `OutputBlockStream`).
pub struct OutputBlockStream<'a> {
    alloc: &'a OutputStreamAllocator,
    block_type: BlockType,
    block_size: u64,
    current: Mutex<Option<(OutputBlock, u64)>>, // (block, header offset)
}

impl<'a> OutputBlockStream<'a> {
    pub fn new(alloc: &'a OutputStreamAllocator, block_type: BlockType, block_size: u64) -> Self {
        OutputBlockStream { alloc, block_type, block_size, current: Mutex::new(None) }
    }

    fn fresh_block(&self) -> io::Result<(OutputBlock, u64)> {
        let block = self.alloc.reserve_block(self.block_size, self.block_type)?;
        let header_offset = block.start();
        Ok((block, header_offset))
    }

    /// Writes `buf`, acquiring a new block if the current one is full or
    /// absent. The new block is threaded into the file-wide chain by
    /// `reserve_block` itself; this stream does not need its own
    /// block-to-block linkage.
    pub fn write(&self, buf: &[u8]) -> io::Result<u64> {
        let mut guard = self.current.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.fresh_block()?);
        }
        {
            let (block, _) = guard.as_ref().unwrap();
            if let Some(offset) = block.write(self.alloc, buf)? {
                return Ok(offset);
            }
        }
        // Current block is full: drop it and retry once in a fresh one.
        let (old_block, _old_header) = guard.take().unwrap();
        let new = self.fresh_block()?;
        drop(old_block);
        let offset = new
            .0
            .write(self.alloc, buf)?
            .expect("payload must fit a freshly reserved block of the configured size");
        *guard = Some(new);
        Ok(offset)
    }
}

/// Buffers an arbitrary-size payload in memory, then on flush reserves a
/// block of exactly the right size and writes it in one shot (spec §4.2
/// `OutputBlockBuilder`).
#[derive(Default)]
pub struct OutputBlockBuilder {
    payload: Vec<u8>,
}

impl OutputBlockBuilder {
    pub fn new() -> Self {
        OutputBlockBuilder { payload: Vec::new() }
    }

    pub fn write(&mut self, buf: &[u8]) {
        self.payload.extend_from_slice(buf);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    /// Reserves a block exactly large enough for the header plus the
    /// buffered payload, writes both, and returns the block's start offset.
    pub fn flush(self, alloc: &OutputStreamAllocator, ty: BlockType) -> io::Result<u64> {
        let size = BLOCK_HEADER_SIZE + self.payload.len() as u64;
        let block = alloc.reserve_block(size, ty)?;
        block
            .write(alloc, &self.payload)?
            .expect("exactly-sized block must accept its own payload");
        Ok(block.start())
    }
}

/// Variant of `OutputBlockStream` that writes small records into a shared
/// pooled block, but gives oversize records their own exactly-sized block
/// (spec §4.2 `OutputBlockProcessDataStream`).
pub struct OutputBlockProcessDataStream<'a> {
    pooled: OutputBlockStream<'a>,
    oversize_threshold: u64,
    alloc: &'a OutputStreamAllocator,
}

impl<'a> OutputBlockProcessDataStream<'a> {
    pub fn new(alloc: &'a OutputStreamAllocator) -> Self {
        OutputBlockProcessDataStream {
            pooled: OutputBlockStream::new(alloc, BlockType::ProcessData, DEFAULT_BLOCK_SIZE),
            oversize_threshold: DEFAULT_BLOCK_SIZE / 4,
            alloc,
        }
    }

    /// Writes `bytes` and returns their file offset, to be embedded in an
    /// event payload that needs variable-sized data (spec §4.10
    /// `recordData`).
    pub fn record(&self, bytes: &[u8]) -> io::Result<u64> {
        if bytes.len() as u64 > self.oversize_threshold {
            let mut builder = OutputBlockBuilder::new();
            builder.write(bytes);
            let block_start = builder.flush(self.alloc, BlockType::ProcessData)?;
            Ok(block_start + BLOCK_HEADER_SIZE)
        } else {
            self.pooled.write(bytes)
        }
    }
}

/// A per-thread event stream whose first block additionally carries the
/// thread ID (spec §4.2 `OutputBlockThreadEventStream`). The ID is stamped
/// eagerly at construction so the stream's head offset is known immediately,
/// for the `ProcessTrace` block's initial-stream address table (spec §6).
pub struct OutputBlockThreadEventStream<'a> {
    stream: OutputBlockStream<'a>,
    thread_id: u32,
    head_offset: u64,
}

impl<'a> OutputBlockThreadEventStream<'a> {
    pub fn new(alloc: &'a OutputStreamAllocator, thread_id: u32) -> io::Result<Self> {
        let stream = OutputBlockStream::new(alloc, BlockType::ThreadEvents, DEFAULT_BLOCK_SIZE);
        let head_offset = stream.write(&thread_id.to_le_bytes())?;
        Ok(OutputBlockThreadEventStream { stream, thread_id, head_offset })
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Offset of this stream's first block, i.e. the offset the thread-id
    /// prefix was written at.
    pub fn head_offset(&self) -> u64 {
        self.head_offset
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<u64> {
        self.stream.write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn alloc() -> OutputStreamAllocator {
        OutputStreamAllocator::create(tempfile().unwrap()).unwrap()
    }

    #[test]
    fn magic_is_written_on_create() {
        let a = alloc();
        let mut buf = [0u8; 8];
        a.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, crate::trace_format::MAGIC);
    }

    #[test]
    fn block_write_fails_past_end() {
        let a = alloc();
        let block = a.get_output_block(BLOCK_HEADER_SIZE + 4).unwrap();
        assert!(block.write(&a, &[0u8; 4]).unwrap().is_some());
        assert!(block.write(&a, &[0u8; 1]).unwrap().is_none());
    }

    #[test]
    fn rewrite_touches_only_its_span() {
        let a = alloc();
        let block = a.get_output_block(BLOCK_HEADER_SIZE + 8).unwrap();
        let rec = block.rewritable_write(&a, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap().unwrap();
        a.write_at(rec.offset(), &[9, 9, 9, 9]).unwrap();
        let mut buf = [0u8; 8];
        a.read_at(rec.offset(), &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9, 9, 5, 6, 7, 8]);
    }

    #[test]
    fn stream_chains_across_blocks() {
        let a = alloc();
        let stream = OutputBlockStream::new(&a, BlockType::ProcessData, BLOCK_HEADER_SIZE + 4);
        stream.write(&[1, 2, 3, 4]).unwrap();
        // This write does not fit the first block and forces a new one.
        stream.write(&[5, 6, 7, 8]).unwrap();
    }

    #[test]
    fn file_wide_chain_visits_every_block_once_across_streams() {
        let a = alloc();
        let process_data = OutputBlockStream::new(&a, BlockType::ProcessData, BLOCK_HEADER_SIZE + 4);
        let thread_events = OutputBlockStream::new(&a, BlockType::ThreadEvents, BLOCK_HEADER_SIZE + 4);
        // Interleave writes to two unrelated streams, each forcing at least
        // one block rollover, so their blocks land interleaved in the file.
        process_data.write(&[1, 2, 3, 4]).unwrap();
        thread_events.write(&[5, 6, 7, 8]).unwrap();
        process_data.write(&[9, 9, 9, 9]).unwrap();
        thread_events.write(&[8, 8, 8, 8]).unwrap();

        let blocks = walk_blocks(&a).unwrap();
        // Every block reserved (two per stream) is visited exactly once, and
        // the chain terminates at the last-reserved block.
        assert_eq!(blocks.len(), 4);
        let mut seen: Vec<u64> = blocks.iter().map(|(off, _, _)| *off).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4);
        assert_eq!(blocks.last().unwrap().2, 0);
    }
}
