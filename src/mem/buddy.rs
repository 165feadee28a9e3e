use std::collections::{BTreeSet, HashMap};

use crate::error::MemError;

/// Power-of-two buddy allocator over an abstract `[0, 2^max_level)` space.
///
/// Blocks range from `2^min_level` to `2^max_level` bytes. Only offsets are
/// handed out; mapping them to memory is up to the caller.
#[derive(Debug)]
pub struct BuddyAllocator {
    min_level: u32,
    max_level: u32,
    /// Free block offsets, indexed by `level - min_level`.
    free: Vec<BTreeSet<usize>>,
    /// Live block offset to its level.
    live: HashMap<usize, u32>,
    used: usize,
}

impl BuddyAllocator {
    pub fn new(min_level: u32, max_level: u32) -> Result<Self, MemError> {
        if min_level < 4 || max_level < min_level || max_level - min_level >= 32 || max_level >= usize::BITS {
            return Err(MemError::BadLevels(min_level, max_level));
        }
        let mut free = vec![BTreeSet::new(); (max_level - min_level + 1) as usize];
        free[(max_level - min_level) as usize].insert(0);
        Ok(Self {
            min_level,
            max_level,
            free,
            live: HashMap::new(),
            used: 0,
        })
    }

    #[inline]
    pub fn min_level(&self) -> u32 {
        self.min_level
    }

    #[inline]
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Level of the smallest block that holds `size` bytes, `None` if no
    /// block is large enough.
    pub fn find_level(&self, size: usize) -> Option<u32> {
        if size > self.mem_total() {
            return None;
        }
        let level = size.max(1).next_power_of_two().trailing_zeros();
        Some(level.max(self.min_level))
    }

    /// Allocate a block of at least `size` bytes and return its offset.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let want = self.find_level(size)?;
        let mut level = (want..=self.max_level).find(|&l| !self.free_set(l).is_empty())?;
        let offset = self.free_set_mut(level).pop_first()?;

        while level > want {
            level -= 1;
            self.free_set_mut(level).insert(offset + (1 << level));
        }
        self.live.insert(offset, want);
        self.used += 1 << want;
        Some(offset)
    }

    /// Return the block at `offset`. Return its size, or `None` if no live
    /// block starts there.
    pub fn free(&mut self, offset: usize) -> Option<usize> {
        let level = self.live.remove(&offset)?;
        let size = 1usize << level;
        self.used -= size;

        let (mut offset, mut level) = (offset, level);
        while level < self.max_level {
            let buddy = offset ^ (1 << level);
            if !self.free_set_mut(level).remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            level += 1;
        }
        self.free_set_mut(level).insert(offset);
        Some(size)
    }

    /// Size of the live block at `offset`.
    pub fn block_size(&self, offset: usize) -> Option<usize> {
        self.live.get(&offset).map(|&l| 1 << l)
    }

    #[inline]
    pub fn mem_used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn mem_free(&self) -> usize {
        self.mem_total() - self.used
    }

    #[inline]
    pub fn mem_total(&self) -> usize {
        1 << self.max_level
    }

    /// Number of free blocks on each level, smallest level first.
    pub fn stat(&self) -> Vec<(u32, usize)> {
        (self.min_level..=self.max_level)
            .map(|l| (l, self.free_set(l).len()))
            .collect()
    }

    #[inline]
    fn free_set(&self, level: u32) -> &BTreeSet<usize> {
        &self.free[(level - self.min_level) as usize]
    }

    #[inline]
    fn free_set_mut(&mut self, level: u32) -> &mut BTreeSet<usize> {
        &mut self.free[(level - self.min_level) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_bounds() {
        assert!(BuddyAllocator::new(3, 10).is_err());
        assert!(BuddyAllocator::new(12, 11).is_err());
        assert!(BuddyAllocator::new(4, 36).is_err());
        assert!(BuddyAllocator::new(4, 35).is_ok());

        let buddy = BuddyAllocator::new(12, 20).unwrap();
        assert_eq!(buddy.find_level(0), Some(12));
        assert_eq!(buddy.find_level(4096), Some(12));
        assert_eq!(buddy.find_level(4097), Some(13));
        assert_eq!(buddy.find_level(1 << 20), Some(20));
        assert_eq!(buddy.find_level((1 << 20) + 1), None);
    }

    #[test]
    fn split_and_merge() {
        let mut buddy = BuddyAllocator::new(4, 8).unwrap();
        let a = buddy.alloc(16).unwrap();
        let b = buddy.alloc(16).unwrap();
        let c = buddy.alloc(64).unwrap();
        assert_eq!((a, b, c), (0, 16, 64));
        assert_eq!(buddy.mem_used(), 96);
        assert_eq!(buddy.block_size(c), Some(64));

        // 256 = 16 + 16 + [32] + 64 + [128]
        let stat = buddy.stat();
        assert_eq!(stat[1], (5, 1));
        assert_eq!(stat[3], (7, 1));

        assert_eq!(buddy.free(b), Some(16));
        assert_eq!(buddy.free(b), None);
        assert_eq!(buddy.free(a), Some(16));
        assert_eq!(buddy.free(c), Some(64));
        assert_eq!(buddy.mem_used(), 0);
        assert_eq!(buddy.stat().last(), Some(&(8, 1)));
        assert!(buddy.stat().iter().rev().skip(1).all(|&(_, n)| n == 0));
    }

    #[test]
    fn exhaustion() {
        let mut buddy = BuddyAllocator::new(4, 6).unwrap();
        let blocks: Vec<_> = (0..4).map(|_| buddy.alloc(10).unwrap()).collect();
        assert_eq!(buddy.alloc(1), None);
        assert_eq!(buddy.mem_free(), 0);
        for b in blocks {
            buddy.free(b);
        }
        assert_eq!(buddy.alloc(64), Some(0));
    }
}
