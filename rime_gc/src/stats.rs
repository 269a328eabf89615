//! Arena allocation and collection statistics.
//!
//! Each arena owns one [`AllocStats`]. The `cur_*`/`max_*` pairs track live
//! resources and their peaks; the `*_vol` counters are cumulative byte
//! volumes. When a child arena is stolen into its parent the volumes are
//! merged while the live counters are adjusted by the transfer itself.

use crate::collector::CollectMode;
use crate::heap::chunk::CHUNK_SIZE;

/// Statistics about one arena's allocation and collection activity.
#[derive(Debug, Default, Clone)]
pub struct AllocStats {
    // =========================================================================
    // Live Resources
    // =========================================================================
    /// Chunks currently linked into the arena.
    pub cur_chunks: usize,
    /// Peak of `cur_chunks`.
    pub max_chunks: usize,
    /// Large objects currently owned.
    pub cur_large_count: usize,
    /// Peak of `cur_large_count`.
    pub max_large_count: usize,
    /// Bytes held by large objects.
    pub cur_large_bytes: usize,
    /// Peak of `cur_large_bytes`.
    pub max_large_bytes: usize,
    /// ExtRefs currently tracked.
    pub cur_extrefs: usize,
    /// Peak of `cur_extrefs`.
    pub max_extrefs: usize,
    /// Peak of chunk bytes plus large-object bytes.
    pub max_total_bytes: usize,

    // =========================================================================
    // Allocation Volume
    // =========================================================================
    /// Bytes bump-allocated by the mutator.
    pub small_vol: u64,
    /// Bytes allocated out-of-band.
    pub large_vol: u64,
    /// Subset of `small_vol` spent on position placeholders.
    pub placeholder_vol: u64,
    /// Subset of `small_vol` lost at chunk ends.
    pub fragment_vol: u64,

    // =========================================================================
    // Collection Volume
    // =========================================================================
    /// Bytes copied by the collector.
    pub gc_copy_vol: u64,
    /// Bytes copied back from the shadow buffer.
    pub shadow_vol: u64,
    /// Bytes reclaimed by collections.
    pub reclaim_vol: u64,
    /// Objects visited by collections.
    pub visit_count: u64,
    /// Bytes scanned by collections, roots included.
    pub scan_vol: u64,

    // =========================================================================
    // Collection Counts
    // =========================================================================
    /// Collections with roots, per mode: runtime, manual, auto.
    pub collects: [u64; 3],
    /// Root-less sweeps, per mode: runtime, manual, auto.
    pub sweeps: [u64; 3],
}

impl AllocStats {
    /// Create new empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn update_total(&mut self) {
        let total = self.cur_chunks * CHUNK_SIZE + self.cur_large_bytes;
        self.max_total_bytes = self.max_total_bytes.max(total);
    }

    /// Adjust the live chunk count.
    #[inline]
    pub fn modify_chunks(&mut self, delta: isize) {
        self.cur_chunks = self.cur_chunks.wrapping_add_signed(delta);
        self.max_chunks = self.max_chunks.max(self.cur_chunks);
        self.update_total();
    }

    /// Adjust the live large-object count and bytes.
    #[inline]
    pub fn modify_large(&mut self, delta_count: isize, delta_bytes: isize) {
        self.cur_large_count = self.cur_large_count.wrapping_add_signed(delta_count);
        self.cur_large_bytes = self.cur_large_bytes.wrapping_add_signed(delta_bytes);
        self.max_large_count = self.max_large_count.max(self.cur_large_count);
        self.max_large_bytes = self.max_large_bytes.max(self.cur_large_bytes);
        self.update_total();
    }

    /// Adjust the live ExtRef count.
    #[inline]
    pub fn modify_extrefs(&mut self, delta: isize) {
        self.cur_extrefs = self.cur_extrefs.wrapping_add_signed(delta);
        self.max_extrefs = self.max_extrefs.max(self.cur_extrefs);
    }

    /// Record a bump allocation.
    #[inline]
    pub fn alloc_small(&mut self, size: usize) {
        self.small_vol += size as u64;
    }

    /// Record a large allocation.
    #[inline]
    pub fn alloc_large(&mut self, size: usize) {
        self.large_vol += size as u64;
    }

    /// Record space abandoned at the end of a chunk.
    #[inline]
    pub fn alloc_fragment(&mut self, size: usize) {
        self.fragment_vol += size as u64;
    }

    /// Record a placeholder allocation.
    #[inline]
    pub fn alloc_placeholder(&mut self, size: usize) {
        self.placeholder_vol += size as u64;
    }

    /// Record a copy made by the collector. Copies are not mutator volume.
    #[inline]
    pub fn alloc_gc(&mut self, size: usize) {
        self.gc_copy_vol += size as u64;
        self.small_vol = self.small_vol.saturating_sub(size as u64);
    }

    /// Record bytes restored from the shadow buffer.
    #[inline]
    pub fn alloc_shadow(&mut self, size: usize) {
        self.shadow_vol += size as u64;
    }

    /// Record reclaimed bytes.
    #[inline]
    pub fn gc_reclaim(&mut self, size: usize) {
        self.reclaim_vol += size as u64;
    }

    /// Record scanned bytes.
    #[inline]
    pub fn gc_scan(&mut self, size: usize) {
        self.scan_vol += size as u64;
    }

    /// Record visited objects.
    #[inline]
    pub fn gc_visit(&mut self, count: usize) {
        self.visit_count += count as u64;
    }

    /// Count a collection with roots.
    pub fn count_collect(&mut self, mode: CollectMode) {
        self.collects[mode.index()] += 1;
    }

    /// Count a root-less sweep.
    pub fn count_sweep(&mut self, mode: CollectMode) {
        self.sweeps[mode.index()] += 1;
    }

    /// Total collections with roots.
    pub fn total_collects(&self) -> u64 {
        self.collects.iter().sum()
    }

    /// Total sweeps.
    pub fn total_sweeps(&self) -> u64 {
        self.sweeps.iter().sum()
    }

    /// Fold `other`'s volumes into `self` and clear them in `other`.
    ///
    /// Live counters are left alone: the caller accounts for the resources
    /// it actually transfers. Peaks are ignored.
    pub fn merge(&mut self, other: &mut AllocStats) {
        fn take(l: &mut u64, r: &mut u64) {
            *l += std::mem::take(r);
        }
        take(&mut self.small_vol, &mut other.small_vol);
        take(&mut self.large_vol, &mut other.large_vol);
        take(&mut self.placeholder_vol, &mut other.placeholder_vol);
        take(&mut self.fragment_vol, &mut other.fragment_vol);
        take(&mut self.gc_copy_vol, &mut other.gc_copy_vol);
        take(&mut self.shadow_vol, &mut other.shadow_vol);
        take(&mut self.reclaim_vol, &mut other.reclaim_vol);
        take(&mut self.visit_count, &mut other.visit_count);
        take(&mut self.scan_vol, &mut other.scan_vol);
        for i in 0..3 {
            take(&mut self.collects[i], &mut other.collects[i]);
            take(&mut self.sweeps[i], &mut other.sweeps[i]);
        }
    }

    /// Log current usage.
    pub fn report(&self, usage: usize) {
        tracing::info!(
            target: "rime_gc::stats",
            usage = %format_bytes(usage as u64),
            peak = %format_bytes(self.max_total_bytes as u64),
            "arena memory usage"
        );
    }

    /// Log peak usage and cumulative volumes.
    pub fn report_final(&self) {
        tracing::info!(
            target: "rime_gc::stats",
            total = %format_bytes(self.max_total_bytes as u64),
            chunks = self.max_chunks,
            chunk_bytes = %format_bytes((self.max_chunks * CHUNK_SIZE) as u64),
            large = self.max_large_count,
            large_bytes = %format_bytes(self.max_large_bytes as u64),
            extrefs = self.max_extrefs,
            "arena peak memory"
        );
        tracing::info!(
            target: "rime_gc::stats",
            allocated = %format_bytes(self.small_vol + self.large_vol),
            large = %format_bytes(self.large_vol),
            small = %format_bytes(self.small_vol),
            placeholders = %format_bytes(self.placeholder_vol),
            fragments = %format_bytes(self.fragment_vol),
            "arena allocation volume"
        );
        tracing::info!(
            target: "rime_gc::stats",
            sweeps = self.total_sweeps(),
            runtime_sweeps = self.sweeps[0],
            manual_sweeps = self.sweeps[1],
            auto_sweeps = self.sweeps[2],
            collects = self.total_collects(),
            runtime_collects = self.collects[0],
            manual_collects = self.collects[1],
            auto_collects = self.collects[2],
            visited = self.visit_count,
            scanned = %format_bytes(self.scan_vol),
            copied = %format_bytes(self.gc_copy_vol),
            shadowed = %format_bytes(self.shadow_vol),
            reclaimed = %format_bytes(self.reclaim_vol),
            "collector volume"
        );
    }
}

/// Format bytes in human-readable form.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_counters_track_peaks() {
        let mut stats = AllocStats::new();
        stats.modify_chunks(3);
        stats.modify_chunks(-2);
        assert_eq!(stats.cur_chunks, 1);
        assert_eq!(stats.max_chunks, 3);
        assert_eq!(stats.max_total_bytes, 3 * CHUNK_SIZE);

        stats.modify_large(2, 100);
        stats.modify_large(-1, -40);
        assert_eq!(stats.cur_large_count, 1);
        assert_eq!(stats.cur_large_bytes, 60);
        assert_eq!(stats.max_large_bytes, 100);
    }

    #[test]
    fn test_gc_copies_are_not_mutator_volume() {
        let mut stats = AllocStats::new();
        stats.alloc_small(64);
        stats.alloc_gc(16);
        assert_eq!(stats.small_vol, 48);
        assert_eq!(stats.gc_copy_vol, 16);
    }

    #[test]
    fn test_merge_moves_volumes() {
        let mut parent = AllocStats::new();
        let mut child = AllocStats::new();
        child.alloc_small(10);
        child.gc_reclaim(5);
        child.count_collect(CollectMode::Manual);
        child.modify_chunks(2);

        parent.merge(&mut child);
        assert_eq!(parent.small_vol, 10);
        assert_eq!(parent.reclaim_vol, 5);
        assert_eq!(parent.collects, [0, 1, 0]);
        assert_eq!(child.small_vol, 0);
        assert_eq!(child.total_collects(), 0);
        // Live counters are not merged.
        assert_eq!(parent.cur_chunks, 0);
        assert_eq!(child.cur_chunks, 2);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }
}
