use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::{fmt, slice};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::buddy::BuddyAllocator;
use super::region::Region;
use crate::error::MemError;
use crate::msg::RdmaBufDesc;
use crate::rdma::verbs::{LKey, Mr, Pd, RKey, Sge};

/// One registered region with the buddy allocator carving it.
pub(crate) struct MemInstance {
    /// Registration of `region`, dropped first.
    mr: Mr,
    region: Region,
    buddy: Mutex<BuddyAllocator>,
}

impl MemInstance {
    fn new(pd: &Pd, min_level: u32, max_level: u32, hugepage: bool) -> Result<Self, MemError> {
        let buddy = BuddyAllocator::new(min_level, max_level)?;
        let region = Region::new(buddy.mem_total(), hugepage)?;
        // SAFETY: the region outlives the registration (field order).
        let mr = unsafe { Mr::reg(pd, region.addr(), region.len()) }.map_err(MemError::Register)?;
        Ok(Self {
            mr,
            region,
            buddy: Mutex::new(buddy),
        })
    }
}

/// A block of registered memory.
///
/// The block goes back to its allocator when the buffer is dropped; the
/// region it lives in stays mapped and registered at least as long as the
/// buffer.
pub struct RdmaBuffer {
    inst: Option<Arc<MemInstance>>,
    addr: *mut u8,
    offset: usize,
    size: usize,
    len: usize,
    lkey: LKey,
    rkey: RKey,
}

// SAFETY: the buffer exclusively owns its block.
unsafe impl Send for RdmaBuffer {}
unsafe impl Sync for RdmaBuffer {}

impl fmt::Debug for RdmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaBuffer")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("len", &self.len)
            .field("lkey", &self.lkey)
            .finish()
    }
}

impl RdmaBuffer {
    fn new(inst: &Arc<MemInstance>, offset: usize, size: usize, len: usize) -> Self {
        Self {
            // SAFETY: the buddy allocator hands out offsets within the region.
            addr: unsafe { inst.region.addr().add(offset) },
            offset,
            size,
            len,
            lkey: inst.mr.lkey(),
            rkey: inst.mr.rkey(),
            inst: Some(inst.clone()),
        }
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Block size, at least the requested size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes in use.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the number of bytes in use, capped at the block size.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.size);
    }

    #[inline]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    #[inline]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    /// The bytes in use.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the block is owned by this buffer and `len <= size`.
        unsafe { slice::from_raw_parts(self.addr, self.len) }
    }

    /// The whole block.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the block is owned by this buffer.
        unsafe { slice::from_raw_parts_mut(self.addr, self.size) }
    }

    /// Scatter-gather element covering the first `len` bytes.
    #[inline]
    pub fn sge(&self, len: usize) -> Sge {
        Sge {
            addr: self.addr as u64,
            length: len.min(self.size) as u32,
            lkey: self.lkey,
        }
    }

    /// Descriptor a peer uses to access the bytes in use.
    #[inline]
    pub fn desc(&self) -> RdmaBufDesc {
        RdmaBufDesc {
            addr: self.addr as u64,
            rkey: self.rkey,
            len: self.len as u32,
        }
    }
}

impl Drop for RdmaBuffer {
    fn drop(&mut self) {
        if let Some(inst) = self.inst.take() {
            inst.buddy.lock().free(self.offset);
        }
    }
}

/// Upper bound of regions a pool holds.
pub const MAX_REGIONS: usize = 256;

/// A pool of registered memory made of independent buddy allocators, one
/// per region.
///
/// Regions are appended when every existing one is exhausted and are only
/// released when the pool and all buffers are dropped. The region list is
/// read without locking; appends are serialized.
pub struct RdmaBufferAllocator {
    pd: Pd,
    min_level: u32,
    max_level: u32,
    hugepage: bool,
    slots: Box<[OnceLock<Arc<MemInstance>>]>,
    count: AtomicUsize,
    expand_lock: Mutex<()>,
}

impl RdmaBufferAllocator {
    /// Create an allocator with blocks between `2^min_level` and
    /// `2^max_level` bytes and at most `max_regions` regions. No region is
    /// registered until the first allocation.
    pub fn new(
        pd: &Pd,
        min_level: u32,
        max_level: u32,
        max_regions: usize,
        hugepage: bool,
    ) -> Result<Self, MemError> {
        // Validate the levels up front.
        BuddyAllocator::new(min_level, max_level)?;
        let max_regions = max_regions.clamp(1, MAX_REGIONS);
        Ok(Self {
            pd: pd.clone(),
            min_level,
            max_level,
            hugepage,
            slots: (0..max_regions).map(|_| OnceLock::new()).collect(),
            count: AtomicUsize::new(0),
            expand_lock: Mutex::new(()),
        })
    }

    /// Largest block size.
    #[inline]
    pub fn max_block(&self) -> usize {
        1 << self.max_level
    }

    fn instances(&self) -> impl Iterator<Item = &Arc<MemInstance>> {
        let n = self.count.load(Ordering::Acquire);
        self.slots[..n].iter().filter_map(OnceLock::get)
    }

    fn try_alloc(&self, size: usize) -> Option<RdmaBuffer> {
        self.instances().find_map(|inst| {
            let mut buddy = inst.buddy.lock();
            let offset = buddy.alloc(size)?;
            let block = buddy.block_size(offset)?;
            Some(RdmaBuffer::new(inst, offset, block, size))
        })
    }

    /// Add a region unless another one was added since `seen` regions were
    /// observed.
    fn expand(&self, seen: usize) -> Result<(), MemError> {
        let _guard = self.expand_lock.lock();
        let n = self.count.load(Ordering::Acquire);
        if n != seen {
            return Ok(());
        }
        if n >= self.slots.len() {
            return Err(MemError::Exhausted(n));
        }
        let inst = MemInstance::new(&self.pd, self.min_level, self.max_level, self.hugepage)?;
        info!(
            "registered memory region #{} ({} bytes{})",
            n,
            inst.region.len(),
            if inst.region.is_hugepage() { ", huge pages" } else { "" }
        );
        // Slot `n` is only ever set here, under the lock.
        let _ = self.slots[n].set(Arc::new(inst));
        self.count.store(n + 1, Ordering::Release);
        Ok(())
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// Sizes above the largest block are rejected. When every region is
    /// exhausted, one region is added and the allocation retried; `None`
    /// means the pool could not grow any more.
    pub fn alloc(&self, size: usize) -> Option<RdmaBuffer> {
        if size > self.max_block() {
            warn!("{}", MemError::TooLarge(size, self.max_block()));
            return None;
        }
        let seen = self.count.load(Ordering::Acquire);
        if let Some(buf) = self.try_alloc(size) {
            return Some(buf);
        }
        if let Err(e) = self.expand(seen) {
            warn!("cannot expand memory pool: {}", e);
            return None;
        }
        let buf = self.try_alloc(size);
        if buf.is_none() {
            debug!("memory pool drained by other threads while growing");
        }
        buf
    }

    /// Allocate up to `count` buffers of `size` bytes, locking each region
    /// once. May return fewer buffers when the pool cannot grow.
    pub fn alloc_buffers(&self, size: usize, count: usize) -> Vec<RdmaBuffer> {
        let mut bufs = Vec::with_capacity(count);
        if size > self.max_block() {
            warn!("{}", MemError::TooLarge(size, self.max_block()));
            return bufs;
        }

        let fill = |bufs: &mut Vec<RdmaBuffer>| {
            for inst in self.instances() {
                let mut buddy = inst.buddy.lock();
                let Some(level) = buddy.find_level(size) else {
                    return;
                };
                while bufs.len() < count {
                    match buddy.alloc(size) {
                        Some(offset) => bufs.push(RdmaBuffer::new(inst, offset, 1 << level, size)),
                        None => break,
                    }
                }
                if bufs.len() == count {
                    return;
                }
            }
        };

        // Every round adds a region, so this ends at the region cap.
        loop {
            let seen = self.count.load(Ordering::Acquire);
            fill(&mut bufs);
            if bufs.len() == count {
                break;
            }
            if let Err(e) = self.expand(seen) {
                warn!("cannot expand memory pool: {} ({} of {} buffers)", e, bufs.len(), count);
                break;
            }
        }
        bufs
    }

    /// Return a buffer. Same as dropping it.
    #[inline]
    pub fn free(&self, buf: RdmaBuffer) {
        drop(buf);
    }

    /// Return many buffers, locking each region once per run of buffers
    /// from it.
    pub fn free_buffers(&self, bufs: impl IntoIterator<Item = RdmaBuffer>) {
        fn flush((inst, offsets): (Arc<MemInstance>, Vec<usize>)) {
            let mut buddy = inst.buddy.lock();
            for offset in offsets {
                buddy.free(offset);
            }
        }

        let mut run: Option<(Arc<MemInstance>, Vec<usize>)> = None;
        for mut buf in bufs {
            let Some(inst) = buf.inst.take() else {
                continue;
            };
            let same = run.as_ref().is_some_and(|(cur, _)| Arc::ptr_eq(cur, &inst));
            if same {
                if let Some((_, offsets)) = run.as_mut() {
                    offsets.push(buf.offset);
                }
            } else if let Some(prev) = run.replace((inst, vec![buf.offset])) {
                flush(prev);
            }
        }
        if let Some(prev) = run {
            flush(prev);
        }
    }

    /// Bytes handed out, summed over all regions.
    pub fn mem_used(&self) -> usize {
        self.instances().map(|inst| inst.buddy.lock().mem_used()).sum()
    }

    /// Bytes registered, summed over all regions.
    pub fn mem_registered(&self) -> usize {
        self.instances().map(|inst| inst.region.len()).sum()
    }

    /// Number of regions registered.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
