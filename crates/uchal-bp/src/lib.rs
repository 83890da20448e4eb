#![no_std]
#![forbid(unsafe_code)]

//! Chained buffer pool.
//!
//! A pool owns `N` chunks of one aligned size. A [`PartialBuffer`] borrows as
//! many chunks as it needs and presents them as one continuous byte range of
//! exactly the requested length. Chunks are never shared between two live
//! buffers: a chunk is either in its pool slot or in exactly one chain.

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use log::{debug, trace};
use spin::Mutex;
use uchal_core::BP_MEM_ALIGN;
use zeroize::Zeroize;

struct PoolSlots {
    // `None` while the chunk is lent to a chain.
    chunks: Vec<Option<Box<[u8]>>>,
    available: usize,
}

pub struct BufferPool {
    slots: Mutex<PoolSlots>,
    chunk_size: usize,
    total: usize,
}

struct Chunk {
    slot: usize,
    data: Box<[u8]>,
}

enum Backing {
    Pooled { pool: Arc<BufferPool>, chain: Vec<Chunk> },
    Standalone(Vec<u8>),
}

/// Logically contiguous buffer, either a chain of pool chunks or a wrapper
/// over caller memory.
///
/// Dropping a pooled buffer returns its chunks to the pool.
pub struct PartialBuffer {
    size: usize,
    backing: Backing,
}

fn align_up(size: usize) -> Option<usize> {
    let padded = size.checked_add(BP_MEM_ALIGN - 1)?;
    Some(BP_MEM_ALIGN * (padded / BP_MEM_ALIGN))
}

fn alloc_chunk(size: usize) -> Option<Box<[u8]>> {
    let mut mem = Vec::new();
    mem.try_reserve_exact(size).ok()?;
    mem.resize(size, 0);
    Some(mem.into_boxed_slice())
}

impl BufferPool {
    /// Allocate `chunk_count` chunks of `chunk_size` (rounded up to
    /// [`BP_MEM_ALIGN`]). Returns `None` on zero arguments or allocation failure.
    pub fn create(chunk_count: usize, chunk_size: usize) -> Option<Arc<Self>> {
        if chunk_count == 0 || chunk_size == 0 {
            return None;
        }
        let chunk_size = align_up(chunk_size)?;

        let mut chunks = Vec::new();
        chunks.try_reserve_exact(chunk_count).ok()?;
        for _ in 0..chunk_count {
            // Early return drops whatever was allocated so far.
            chunks.push(Some(alloc_chunk(chunk_size)?));
        }

        debug!("bp: created pool of {} x {} bytes", chunk_count, chunk_size);
        Some(Arc::new(Self {
            slots: Mutex::new(PoolSlots { chunks, available: chunk_count }),
            chunk_size,
            total: chunk_count,
        }))
    }

    pub fn chunk_size(&self) -> usize { self.chunk_size }

    pub fn total_chunks(&self) -> usize { self.total }

    pub fn available(&self) -> usize {
        self.slots.lock().available
    }

    /// Take enough free chunks to hold `length` bytes.
    ///
    /// Chunks are taken in ascending slot order; they need not be adjacent.
    pub fn get_buffer(self: &Arc<Self>, length: usize) -> Option<PartialBuffer> {
        if length == 0 {
            return None;
        }
        let needed = length.div_ceil(self.chunk_size);
        if needed > self.total {
            return None;
        }

        let mut chain = Vec::new();
        chain.try_reserve_exact(needed).ok()?;

        let mut slots = self.slots.lock();
        if slots.available < needed {
            trace!("bp: {} chunks requested, {} available", needed, slots.available);
            return None;
        }
        for (slot, entry) in slots.chunks.iter_mut().enumerate() {
            if chain.len() == needed {
                break;
            }
            if let Some(data) = entry.take() {
                chain.push(Chunk { slot, data });
            }
        }
        slots.available -= needed;
        drop(slots);

        Some(PartialBuffer {
            size: length,
            backing: Backing::Pooled { pool: self.clone(), chain },
        })
    }

    fn give_back(&self, chain: &mut Vec<Chunk>) {
        let mut slots = self.slots.lock();
        for mut chunk in chain.drain(..) {
            chunk.data[..].zeroize();
            slots.chunks[chunk.slot] = Some(chunk.data);
            slots.available += 1;
        }
    }
}

impl PartialBuffer {
    /// Wrap memory that does not belong to any pool. `None` for empty memory.
    pub fn standalone(memory: Vec<u8>) -> Option<Self> {
        if memory.is_empty() {
            return None;
        }
        Some(Self { size: memory.len(), backing: Backing::Standalone(memory) })
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize { self.size }

    pub fn is_empty(&self) -> bool { self.size == 0 }

    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled { .. })
    }

    /// Number of nodes in the chain (1 for standalone).
    pub fn chunk_count(&self) -> usize {
        match &self.backing {
            Backing::Pooled { chain, .. } => chain.len(),
            Backing::Standalone(_) => 1,
        }
    }

    /// Pool slot indices backing this chain, in chain order.
    pub fn slots(&self) -> Vec<usize> {
        match &self.backing {
            Backing::Pooled { chain, .. } => chain.iter().map(|c| c.slot).collect(),
            Backing::Standalone(_) => Vec::new(),
        }
    }

    /// Raw storage of node `node`, including any bytes past the logical end.
    pub fn chunk(&self, node: usize) -> Option<&[u8]> {
        match &self.backing {
            Backing::Pooled { chain, .. } => chain.get(node).map(|c| &c.data[..]),
            Backing::Standalone(mem) if node == 0 => Some(&mem[..]),
            Backing::Standalone(_) => None,
        }
    }

    pub fn as_standalone_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            Backing::Standalone(mem) => Some(&mut mem[..]),
            Backing::Pooled { .. } => None,
        }
    }

    /// Recover the wrapped memory of a standalone buffer.
    pub fn into_standalone(mut self) -> Option<Vec<u8>> {
        match &mut self.backing {
            Backing::Standalone(mem) => Some(core::mem::take(mem)),
            Backing::Pooled { .. } => None,
        }
    }

    /// Return all chunks to the owning pool. No-op for standalone buffers.
    pub fn release(self) {
        drop(self);
    }

    /// Copy from the buffer at `src_offset` into `dst`. Returns bytes copied.
    pub fn copy_to_mem(&self, dst: &mut [u8], src_offset: usize) -> usize {
        if dst.is_empty() || src_offset >= self.size {
            return 0;
        }
        let len = min(dst.len(), self.size - src_offset);

        match &self.backing {
            Backing::Standalone(mem) => {
                dst[..len].copy_from_slice(&mem[src_offset..src_offset + len]);
            }
            Backing::Pooled { pool, chain } => {
                let stride = pool.chunk_size;
                let mut done = 0;
                while done < len {
                    let pos = src_offset + done;
                    let node = &chain[pos / stride];
                    let at = pos % stride;
                    let n = min(stride - at, len - done);
                    dst[done..done + n].copy_from_slice(&node.data[at..at + n]);
                    done += n;
                }
            }
        }
        len
    }

    /// Copy `src` into the buffer at `dst_offset`. Returns bytes copied.
    pub fn copy_to_buf(&mut self, src: &[u8], dst_offset: usize) -> usize {
        if src.is_empty() || dst_offset >= self.size {
            return 0;
        }
        let len = min(src.len(), self.size - dst_offset);

        match &mut self.backing {
            Backing::Standalone(mem) => {
                mem[dst_offset..dst_offset + len].copy_from_slice(&src[..len]);
            }
            Backing::Pooled { pool, chain } => {
                let stride = pool.chunk_size;
                let mut done = 0;
                while done < len {
                    let pos = dst_offset + done;
                    let node = &mut chain[pos / stride];
                    let at = pos % stride;
                    let n = min(stride - at, len - done);
                    node.data[at..at + n].copy_from_slice(&src[done..done + n]);
                    done += n;
                }
            }
        }
        len
    }
}

impl Drop for PartialBuffer {
    fn drop(&mut self) {
        if let Backing::Pooled { pool, chain } = &mut self.backing {
            if !chain.is_empty() {
                pool.give_back(chain);
            }
        }
    }
}

impl core::fmt::Debug for PartialBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartialBuffer")
            .field("size", &self.size)
            .field("pooled", &self.is_pooled())
            .field("slots", &self.slots())
            .finish()
    }
}
