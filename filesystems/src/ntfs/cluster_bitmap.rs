// NTFS cluster allocator
// First-fit allocation over the volume's $Bitmap, starting past the metadata zone

use super::bitmap::Bitmap;
use discfs_core::DiscError;
use log::{debug, trace};

/// A contiguous physical extent, in clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterRun {
    pub start: u64,
    pub length: u64,
}

impl ClusterRun {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// One past the last cluster of the run.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Free/used state of every cluster on the volume.
#[derive(Debug, Clone)]
pub struct ClusterBitmap {
    bitmap: Bitmap,
    wraps: bool,
    dirty: bool,
}

impl ClusterBitmap {
    /// All clusters free.
    pub fn new(total_clusters: u64, wraps: bool) -> Self {
        Self {
            bitmap: Bitmap::new(total_clusters),
            wraps,
            dirty: true,
        }
    }

    /// Load from the content of the $Bitmap file.
    pub fn from_bytes(bytes: &[u8], total_clusters: u64, wraps: bool) -> Result<Self, DiscError> {
        Ok(Self {
            bitmap: Bitmap::from_bytes(bytes, total_clusters, total_clusters)?,
            wraps,
            dirty: false,
        })
    }

    pub fn total_clusters(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn free_count(&self) -> u64 {
        self.total_clusters() - self.bitmap.count_present()
    }

    pub fn is_present(&self, cluster: u64) -> bool {
        self.bitmap.is_present(cluster)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bitmap.as_bytes()
    }

    /// Size of the $Bitmap file content for this volume.
    pub fn persisted_size(&self) -> usize {
        (self.total_clusters().div_ceil(8) as usize).div_ceil(8) * 8
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Where allocation scans start: clear of the low, metadata-heavy clusters.
    pub fn heuristic_start(&self) -> u64 {
        self.total_clusters() / 8
    }

    pub fn allocate_clusters(&mut self, count: u64) -> Result<Vec<ClusterRun>, DiscError> {
        let start = self.heuristic_start();
        self.allocate_clusters_from(count, start)
    }

    /// Greedy first-fit allocation of `count` clusters scanning from `start`.
    ///
    /// Clusters are marked as soon as they are found. If the volume runs out
    /// everything taken by this call is released before the error returns.
    pub fn allocate_clusters_from(&mut self, count: u64, start: u64) -> Result<Vec<ClusterRun>, DiscError> {
        let mut runs = Vec::new();
        if count == 0 {
            return Ok(runs);
        }

        let mut found = 0u64;
        let mut focus = start.min(self.total_clusters());
        let mut wrapped = false;

        while found < count {
            let limit = if wrapped { start } else { self.total_clusters() };
            let candidate = self.bitmap.find_first_absent(focus).filter(|&c| c < limit);

            let Some(run_start) = candidate else {
                if self.wraps && !wrapped && start > 0 {
                    trace!("Cluster scan reached volume end, wrapping to cluster 0");
                    wrapped = true;
                    focus = 0;
                    continue;
                }
                self.release(&runs);
                return Err(DiscError::CapacityExceeded(format!(
                    "Volume full: needed {} clusters, found {}",
                    count, found
                )));
            };

            let length = self.bitmap.absent_run_length(run_start, count - found).min(limit - run_start);
            self.bitmap.mark_range(run_start, length, true)?;
            runs.push(ClusterRun::new(run_start, length));
            found += length;
            focus = run_start + length;
        }

        self.dirty = true;
        debug!("Allocated {} clusters in {} run(s) from scan start {}", count, runs.len(), start);
        Ok(runs)
    }

    fn release(&mut self, runs: &[ClusterRun]) {
        for run in runs {
            // Runs came from this bitmap, so they are always in range
            let _ = self.bitmap.mark_range(run.start, run.length, false);
        }
    }

    /// Claim a specific run, e.g. the fixed metadata zone during format.
    pub fn mark_allocated(&mut self, run: ClusterRun) -> Result<(), DiscError> {
        for cluster in run.start..run.end() {
            if self.bitmap.is_present(cluster) {
                return Err(DiscError::InvalidInput(format!("Cluster {} is already allocated", cluster)));
            }
        }
        self.bitmap.mark_range(run.start, run.length, true)?;
        self.dirty = true;
        Ok(())
    }

    pub fn free_clusters(&mut self, runs: &[ClusterRun]) -> Result<(), DiscError> {
        for run in runs {
            self.bitmap.mark_range(run.start, run.length, false)?;
        }
        if !runs.is_empty() {
            self.dirty = true;
            debug!(
                "Freed {} clusters in {} run(s)",
                runs.iter().map(|r| r.length).sum::<u64>(),
                runs.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_after_used_prefix() {
        let mut clusters = ClusterBitmap::new(100, false);
        clusters.mark_allocated(ClusterRun::new(0, 5)).unwrap();

        let runs = clusters.allocate_clusters_from(10, 0).unwrap();
        assert_eq!(runs, vec![ClusterRun::new(5, 10)]);
        for c in 5..=14 {
            assert!(clusters.is_present(c));
        }
        assert!(!clusters.is_present(15));
    }

    #[test]
    fn test_heuristic_start() {
        let mut clusters = ClusterBitmap::new(800, false);
        let runs = clusters.allocate_clusters(4).unwrap();
        assert_eq!(runs, vec![ClusterRun::new(100, 4)]);
    }

    #[test]
    fn test_fragmented_allocation() {
        let mut clusters = ClusterBitmap::new(64, false);
        clusters.mark_allocated(ClusterRun::new(3, 2)).unwrap();
        clusters.mark_allocated(ClusterRun::new(7, 1)).unwrap();

        let runs = clusters.allocate_clusters_from(6, 0).unwrap();
        assert_eq!(
            runs,
            vec![ClusterRun::new(0, 3), ClusterRun::new(5, 2), ClusterRun::new(8, 1)]
        );
        assert_eq!(runs.iter().map(|r| r.length).sum::<u64>(), 6);
    }

    #[test]
    fn test_exhaustion_releases_partial_allocation() {
        let mut clusters = ClusterBitmap::new(16, false);
        clusters.mark_allocated(ClusterRun::new(0, 10)).unwrap();
        let before = clusters.free_count();

        let err = clusters.allocate_clusters_from(8, 0).unwrap_err();
        assert!(matches!(err, DiscError::CapacityExceeded(_)));
        assert_eq!(clusters.free_count(), before);
    }

    #[test]
    fn test_no_wrap_by_default() {
        let mut clusters = ClusterBitmap::new(16, false);
        clusters.mark_allocated(ClusterRun::new(8, 8)).unwrap();
        assert!(clusters.allocate_clusters_from(2, 8).is_err());

        let mut wrapping = ClusterBitmap::new(16, true);
        wrapping.mark_allocated(ClusterRun::new(8, 8)).unwrap();
        let runs = wrapping.allocate_clusters_from(2, 8).unwrap();
        assert_eq!(runs, vec![ClusterRun::new(0, 2)]);
    }

    #[test]
    fn test_free_and_reuse() {
        let mut clusters = ClusterBitmap::new(32, false);
        let runs = clusters.allocate_clusters_from(4, 0).unwrap();
        clusters.free_clusters(&runs).unwrap();
        assert_eq!(clusters.free_count(), 32);
        assert!(clusters.mark_allocated(ClusterRun::new(31, 2)).is_err());
    }
}
