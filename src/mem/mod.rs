//! Registered memory management.
//!
//! Large regions are mapped and registered once, then carved into
//! power-of-two buffers by per-region buddy allocators, so that no
//! allocation pays a registration cost.

mod buddy;
mod pool;
mod region;

pub use self::buddy::BuddyAllocator;
pub use self::pool::{RdmaBuffer, RdmaBufferAllocator, MAX_REGIONS};

use crate::config::MsgConfig;
use crate::error::MemError;
use crate::rdma::verbs::Pd;

/// The registered buffer pool of an RDMA stack, handing out transport
/// chunks of a fixed unit size.
pub struct MemoryManager {
    alloc: RdmaBufferAllocator,
    unit: usize,
}

impl MemoryManager {
    pub fn new(pd: &Pd, cfg: &MsgConfig) -> Result<Self, MemError> {
        let (min, max) = (cfg.rdma_mem_min_level, cfg.rdma_mem_max_level);
        let unit = cfg.rdma_buffer_size;
        let max_regions = if cfg.rdma_buffer_num == 0 {
            MAX_REGIONS
        } else {
            let block = unit.next_power_of_two().max(1 << min);
            let region = 1usize << max;
            (cfg.rdma_buffer_num * block).div_ceil(region)
        };
        Self::with_levels(pd, unit, min, max, max_regions, cfg.rdma_enable_hugepage)
    }

    pub fn with_levels(
        pd: &Pd,
        unit: usize,
        min_level: u32,
        max_level: u32,
        max_regions: usize,
        hugepage: bool,
    ) -> Result<Self, MemError> {
        let alloc = RdmaBufferAllocator::new(pd, min_level, max_level, max_regions, hugepage)?;
        if unit == 0 || unit > alloc.max_block() {
            return Err(MemError::TooLarge(unit, alloc.max_block()));
        }
        Ok(Self { alloc, unit })
    }

    /// Size of one transport chunk.
    #[inline]
    pub fn unit_size(&self) -> usize {
        self.unit
    }

    #[inline]
    pub fn allocator(&self) -> &RdmaBufferAllocator {
        &self.alloc
    }

    /// One transport chunk.
    #[inline]
    pub fn get_buffer(&self) -> Option<RdmaBuffer> {
        self.alloc.alloc(self.unit)
    }

    /// Up to `n` transport chunks.
    #[inline]
    pub fn get_buffers(&self, n: usize) -> Vec<RdmaBuffer> {
        self.alloc.alloc_buffers(self.unit, n)
    }

    #[inline]
    pub fn release_buffers(&self, bufs: impl IntoIterator<Item = RdmaBuffer>) {
        self.alloc.free_buffers(bufs)
    }

    #[inline]
    pub fn mem_used(&self) -> usize {
        self.alloc.mem_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::verbs::Context;
    use anyhow::Result;

    fn pd() -> Result<Pd> {
        let ctx = Context::open(None, 1, 0)?;
        Ok(Pd::new(&ctx)?)
    }

    #[test]
    fn free_then_alloc_reuses_region() -> Result<()> {
        let alloc = RdmaBufferAllocator::new(&pd()?, 12, 16, 4, false)?;
        assert_eq!(alloc.region_count(), 0);

        let buf = alloc.alloc(4096).unwrap();
        assert_eq!(alloc.region_count(), 1);
        let addr = buf.addr();
        alloc.free(buf);

        let buf = alloc.alloc(4096).unwrap();
        assert_eq!(buf.addr(), addr);
        assert_eq!(alloc.region_count(), 1);
        Ok(())
    }

    #[test]
    fn hundred_pages_freed_in_reverse() -> Result<()> {
        let alloc = RdmaBufferAllocator::new(&pd()?, 12, 20, 4, false)?;
        let mut bufs = Vec::new();
        for _ in 0..100 {
            let buf = alloc.alloc(4096).unwrap();
            assert!(buf.size() >= 4096);
            bufs.push(buf);
        }
        assert_eq!(alloc.mem_used(), 100 * 4096);

        while let Some(buf) = bufs.pop() {
            alloc.free(buf);
        }
        assert_eq!(alloc.mem_used(), 0);
        assert_eq!(alloc.region_count(), 1);
        assert_eq!(alloc.mem_registered(), 1 << 20);
        Ok(())
    }

    #[test]
    fn oversized_request_is_rejected() -> Result<()> {
        let alloc = RdmaBufferAllocator::new(&pd()?, 12, 16, 4, false)?;
        assert!(alloc.alloc((1 << 16) + 1).is_none());
        assert!(alloc.alloc_buffers((1 << 16) + 1, 2).is_empty());
        assert_eq!(alloc.region_count(), 0);

        let buf = alloc.alloc(1 << 16).unwrap();
        assert_eq!(buf.size(), 1 << 16);
        Ok(())
    }

    #[test]
    fn exhaustion_expands_up_to_the_cap() -> Result<()> {
        // Four pages per region, two regions at most.
        let alloc = RdmaBufferAllocator::new(&pd()?, 12, 14, 2, false)?;
        let mut bufs: Vec<_> = (0..4).map(|_| alloc.alloc(4000).unwrap()).collect();
        assert_eq!(alloc.region_count(), 1);

        bufs.push(alloc.alloc(4000).unwrap());
        assert_eq!(alloc.region_count(), 2);
        for _ in 0..3 {
            bufs.push(alloc.alloc(4000).unwrap());
        }
        assert!(alloc.alloc(4000).is_none());
        assert_eq!(alloc.region_count(), 2);

        drop(bufs);
        assert_eq!(alloc.mem_used(), 0);
        Ok(())
    }

    #[test]
    fn batch_allocation() -> Result<()> {
        let mm = MemoryManager::with_levels(&pd()?, 4096, 12, 14, 2, false)?;
        let mut bufs = mm.get_buffers(6);
        assert_eq!(bufs.len(), 6);
        assert_eq!(mm.allocator().region_count(), 2);
        assert!(bufs.iter().all(|b| b.len() == 4096 && b.size() == 4096));

        // Distinct, writable blocks.
        for (i, buf) in bufs.iter_mut().enumerate() {
            buf.as_mut_slice().fill(i as u8);
        }
        for (i, buf) in bufs.iter().enumerate() {
            assert!(buf.as_slice().iter().all(|&b| b == i as u8));
        }

        // Only two more fit.
        assert_eq!(mm.get_buffers(5).len(), 2);
        mm.release_buffers(bufs);
        assert_eq!(mm.mem_used(), 0);
        Ok(())
    }

    #[test]
    fn concurrent_allocation() -> Result<()> {
        // One region holds every page the threads ask for.
        let alloc = std::sync::Arc::new(RdmaBufferAllocator::new(&pd()?, 12, 20, 64, false)?);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    let bufs: Vec<_> = (0..32).filter_map(|_| alloc.alloc(4096)).collect();
                    bufs.len()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 32);
        }
        assert_eq!(alloc.mem_used(), 0);
        assert_eq!(alloc.region_count(), 1);
        Ok(())
    }
}
