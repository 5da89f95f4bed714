//! Cache effectiveness counters

use serde::Serialize;

/// Counts of device work issued and avoided by a [`crate::DeviceContext`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Uploads issued to the device
    pub uploads: u64,
    /// Writes answered by the version check
    pub uploads_skipped: u64,
    /// Argument binds issued to the device
    pub binds: u64,
    /// `set_arg` calls answered by the slot cache
    pub binds_skipped: u64,
    pub launches: u64,
    pub launch_failures: u64,
}

impl CacheStats {
    /// Fraction of writes that needed no upload
    pub fn upload_elision_ratio(&self) -> f64 {
        ratio(self.uploads_skipped, self.uploads + self.uploads_skipped)
    }

    /// Fraction of `set_arg` calls that needed no bind
    pub fn bind_elision_ratio(&self) -> f64 {
        ratio(self.binds_skipped, self.binds + self.binds_skipped)
    }

    pub(crate) fn log_summary(&self) {
        tracing::debug!(
            uploads = self.uploads,
            uploads_skipped = self.uploads_skipped,
            binds = self.binds,
            binds_skipped = self.binds_skipped,
            launches = self.launches,
            launch_failures = self.launch_failures,
            upload_elision = self.upload_elision_ratio(),
            bind_elision = self.bind_elision_ratio(),
            "cache_stats"
        );
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
