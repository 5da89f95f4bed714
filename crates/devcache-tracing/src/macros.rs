//! Instrumentation macros.

/// Create a [`crate::performance::PerformanceSpan`] that logs its duration on drop.
///
/// ```rust
/// use devcache_tracing::perf_span;
///
/// {
///     let _span = perf_span!("kernel_launch", entry_point = "vector_add");
///     // ... device call ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = ::tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Run a block and return `(result, duration_us)`.
///
/// ```rust
/// use devcache_tracing::timed_block;
///
/// let (sum, _us) = timed_block!({ (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($block:block) => {{
        let start = ::std::time::Instant::now();
        let result = $block;
        (result, start.elapsed().as_micros() as u64)
    }};
}
