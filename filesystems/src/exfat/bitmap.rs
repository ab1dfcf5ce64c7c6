// exFAT cluster allocation bitmap
// One bit per data cluster, bit index 0 is cluster EXFAT_FIRST_DATA_CLUSTER.
// The whole bitmap lives in memory and is written back when dirty.

use super::structures::{EXFAT_CLUSTER_END, EXFAT_FIRST_DATA_CLUSTER};

#[derive(Debug, Clone, Default)]
pub struct ClusterBitmap {
    /// First cluster of the on-disk bitmap.
    pub start_cluster: u32,
    /// Number of clusters tracked (bits).
    size: u32,
    chunk: Vec<u8>,
    dirty: bool,
}

impl ClusterBitmap {
    /// Wrap bitmap bytes read from disk. `size` is in bits.
    pub fn from_bytes(start_cluster: u32, size: u32, chunk: Vec<u8>) -> Self {
        Self {
            start_cluster,
            size,
            chunk,
            dirty: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.chunk.is_empty()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bytes to write back to disk; clears the dirty flag.
    pub fn take_dirty(&mut self) -> &[u8] {
        self.dirty = false;
        let used = ((self.size as usize) + 7) / 8;
        &self.chunk[..used.min(self.chunk.len())]
    }

    fn get(&self, index: u32) -> bool {
        self.chunk[(index / 8) as usize] & (1u8 << (index % 8)) != 0
    }

    fn set(&mut self, index: u32) {
        self.chunk[(index / 8) as usize] |= 1u8 << (index % 8);
    }

    fn clear(&mut self, index: u32) {
        self.chunk[(index / 8) as usize] &= !(1u8 << (index % 8));
    }

    /// Whether `cluster` is marked as allocated.
    pub fn is_used(&self, cluster: u32) -> bool {
        match cluster.checked_sub(EXFAT_FIRST_DATA_CLUSTER) {
            Some(index) if index < self.size => self.get(index),
            _ => false,
        }
    }

    /// Find the first zero bit in `[start, end)`, set it and return the
    /// matching cluster number, or `EXFAT_CLUSTER_END` if there is none.
    fn find_bit_and_set(&mut self, start: u32, end: u32) -> u32 {
        let mid_start = (start + 7) / 8 * 8;
        let mid_end = end / 8 * 8;

        for c in start..mid_start.min(end) {
            if !self.get(c) {
                self.set(c);
                return c + EXFAT_FIRST_DATA_CLUSTER;
            }
        }

        for byte in (mid_start / 8)..(mid_end / 8) {
            let value = self.chunk[byte as usize];
            if value != 0xff {
                let bit = value.trailing_ones();
                self.chunk[byte as usize] |= 1u8 << bit;
                return byte * 8 + bit + EXFAT_FIRST_DATA_CLUSTER;
            }
        }

        for c in mid_end.max(start)..end {
            if !self.get(c) {
                self.set(c);
                return c + EXFAT_FIRST_DATA_CLUSTER;
            }
        }

        EXFAT_CLUSTER_END
    }

    /// First-fit allocation starting at cluster `hint`, wrapping around to
    /// the beginning. Returns `None` when every cluster is in use.
    pub fn allocate(&mut self, hint: u32) -> Option<u32> {
        let mut hint = hint.wrapping_sub(EXFAT_FIRST_DATA_CLUSTER);
        if hint >= self.size {
            hint = 0;
        }

        let mut cluster = self.find_bit_and_set(hint, self.size);
        if cluster == EXFAT_CLUSTER_END {
            cluster = self.find_bit_and_set(0, hint);
        }
        if cluster == EXFAT_CLUSTER_END {
            return None;
        }
        self.dirty = true;
        Some(cluster)
    }

    /// Clear the bit of `cluster`. The caller validates the cluster number.
    pub fn free(&mut self, cluster: u32) {
        self.clear(cluster - EXFAT_FIRST_DATA_CLUSTER);
        self.dirty = true;
    }

    /// Mark `cluster` as used without going through the allocator.
    pub fn reserve(&mut self, cluster: u32) {
        self.set(cluster - EXFAT_FIRST_DATA_CLUSTER);
        self.dirty = true;
    }

    pub fn count_free(&self) -> u32 {
        let full_bytes = (self.size / 8) as usize;
        let mut used: u32 = self.chunk[..full_bytes]
            .iter()
            .map(|byte| byte.count_ones())
            .sum();
        for index in (full_bytes as u32 * 8)..self.size {
            if self.get(index) {
                used += 1;
            }
        }
        self.size - used
    }

    /// Next run of used clusters after cluster `after`, as an inclusive
    /// `(first, last)` pair. `end` is one past the last cluster to look at.
    pub fn find_used_clusters(&self, after: u32, end: u32) -> Option<(u32, u32)> {
        let end = end.min(self.size + EXFAT_FIRST_DATA_CLUSTER);
        let first = (after.saturating_add(1)..end).find(|&c| self.is_used(c))?;
        let last = (first..end)
            .find(|&c| !self.is_used(c))
            .map(|c| c - 1)
            .unwrap_or(end - 1);
        Some((first, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(clusters: u32) -> ClusterBitmap {
        ClusterBitmap::from_bytes(2, clusters, vec![0u8; ((clusters + 7) / 8) as usize])
    }

    #[test]
    fn test_allocate_first_fit() {
        let mut cmap = bitmap(100);
        assert_eq!(cmap.allocate(0), Some(2));
        assert_eq!(cmap.allocate(0), Some(3));
        assert_eq!(cmap.allocate(3), Some(4));
        assert!(cmap.is_dirty());
        assert_eq!(cmap.count_free(), 97);
    }

    #[test]
    fn test_allocate_from_hint_and_wrap() {
        let mut cmap = bitmap(40);
        // Hint in the byte-aligned middle section
        assert_eq!(cmap.allocate(2 + 17), Some(2 + 17));
        assert_eq!(cmap.allocate(2 + 17), Some(2 + 18));

        // Fill everything after the hint, then the search has to wrap
        for c in 2 + 19..2 + 40 {
            cmap.reserve(c);
        }
        assert_eq!(cmap.allocate(2 + 30), Some(2));
    }

    #[test]
    fn test_allocate_out_of_range_hint() {
        let mut cmap = bitmap(16);
        assert_eq!(cmap.allocate(0xFFFF_FFF0), Some(2));
        assert_eq!(cmap.allocate(1), Some(3));
    }

    #[test]
    fn test_no_space() {
        let mut cmap = bitmap(10);
        for _ in 0..10 {
            assert!(cmap.allocate(0).is_some());
        }
        assert_eq!(cmap.allocate(0), None);
        assert_eq!(cmap.count_free(), 0);

        cmap.free(7);
        assert_eq!(cmap.count_free(), 1);
        assert_eq!(cmap.allocate(9), Some(7));
    }

    #[test]
    fn test_find_used_clusters() {
        let mut cmap = bitmap(64);
        for c in [4, 5, 6, 20, 21] {
            cmap.reserve(c);
        }
        assert_eq!(cmap.find_used_clusters(1, 66), Some((4, 6)));
        assert_eq!(cmap.find_used_clusters(6, 66), Some((20, 21)));
        assert_eq!(cmap.find_used_clusters(21, 66), None);

        cmap.reserve(65);
        assert_eq!(cmap.find_used_clusters(21, 66), Some((65, 65)));
    }

    #[test]
    fn test_take_dirty() {
        let mut cmap = bitmap(20);
        cmap.allocate(0);
        assert_eq!(cmap.take_dirty(), &[0x01, 0x00, 0x00]);
        assert!(!cmap.is_dirty());
    }
}
