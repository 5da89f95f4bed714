//! Standard events for device-resource activity.
//!
//! Every backend and every core type reports through these helpers so the
//! event names and field sets stay stable for log consumers.

use std::time::Instant;

/// Transfer direction for [`record_transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::HostToDevice => "H2D",
            Direction::DeviceToHost => "D2H",
        }
    }
}

/// RAII guard that times a device operation and logs it on drop when the
/// duration reaches the optional threshold.
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        Self {
            threshold_us,
            start_time: Instant::now(),
            span: tracing::debug_span!("perf", name = %span_name),
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(duration_us = elapsed_us, "performance_span_complete");
        }
    }
}

fn bandwidth_mbps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    }
}

/// Record a host/device transfer that was actually issued.
pub fn record_transfer(bytes: usize, direction: Direction, duration_us: u64) {
    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction.as_str(),
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps(bytes, duration_us),
        "data_transfer"
    );
}

/// Record a transfer that the version check made unnecessary.
pub fn record_transfer_elided(bytes: usize, requested_version: u64, current_version: u64) {
    tracing::trace!(
        event = "transfer_elided",
        bytes = bytes,
        requested_version = requested_version,
        current_version = current_version,
        "data_transfer_elided"
    );
}

/// Record a kernel-argument bind issued to the device.
pub fn record_bind(entry_point: &str, slot: usize, local: bool, version: u64) {
    tracing::debug!(
        event = "bind",
        entry_point = entry_point,
        slot = slot,
        memory = if local { "local" } else { "global" },
        version = version,
        "kernel_arg_bound"
    );
}

/// Record a kernel-argument bind answered from the slot cache.
pub fn record_bind_elided(entry_point: &str, slot: usize, version: u64) {
    tracing::trace!(
        event = "bind_elided",
        entry_point = entry_point,
        slot = slot,
        version = version,
        "kernel_arg_cached"
    );
}

/// Record a kernel launch. `work_items` is `None` for the default range.
pub fn record_launch(entry_point: &str, work_items: Option<usize>, duration_us: u64) {
    tracing::debug!(
        event = "launch",
        entry_point = entry_point,
        work_items = ?work_items,
        duration_us = duration_us,
        "kernel_launched"
    );
}

/// Record a device allocation.
pub fn record_allocation(bytes: usize, global: bool, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        memory = if global { "global" } else { "local" },
        duration_us = duration_us,
        "device_allocation"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_threshold_is_kept() {
        let span = PerformanceSpan::new("launch", Some(1000));
        assert_eq!(span.threshold_us, Some(1000));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::new("upload", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn direction_labels() {
        assert_eq!(Direction::HostToDevice.as_str(), "H2D");
        assert_eq!(Direction::DeviceToHost.as_str(), "D2H");
    }

    #[test]
    fn bandwidth_of_one_megabyte_per_millisecond() {
        let mbps = bandwidth_mbps(1024 * 1024, 1000);
        assert!((mbps - 1000.0).abs() < 0.01);
        assert_eq!(bandwidth_mbps(4096, 0), 0.0);
    }

    #[test]
    fn recorders_do_not_panic_without_subscriber() {
        record_transfer(80, Direction::HostToDevice, 3);
        record_transfer_elided(80, 1, 1);
        record_bind("vector_add", 0, false, 1);
        record_bind_elided("vector_add", 0, 1);
        record_launch("vector_add", Some(1024), 12);
        record_allocation(8192, true, 4);
    }
}
