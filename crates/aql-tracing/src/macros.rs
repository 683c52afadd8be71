//! Performance span macro

/// Start a [`crate::performance::PerformanceSpan`] with optional fields.
///
/// A leading `threshold_us = N;` only logs spans lasting at least `N`
/// microseconds; otherwise the global threshold applies.
///
/// ```rust
/// use aql_tracing::perf_span;
///
/// {
///     let _span = perf_span!("dispatch", kernel_object = 7u64, workgroups = 4u64);
/// }
/// let _copy = perf_span!(threshold_us = 1000; "copy", bytes = 4096usize);
/// ```
#[macro_export]
macro_rules! perf_span {
    (threshold_us = $threshold:expr; $name:expr $(, $field:tt = $value:expr)* $(,)?) => {{
        let name = $name;
        $crate::performance::PerformanceSpan::from_span(
            $crate::tracing::debug_span!("perf", name = %name $(, $field = $value)*),
            name,
            Some($threshold),
        )
    }};
    ($name:expr $(, $field:tt = $value:expr)* $(,)?) => {{
        let name = $name;
        $crate::performance::PerformanceSpan::from_span(
            $crate::tracing::debug_span!("perf", name = %name $(, $field = $value)*),
            name,
            None,
        )
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_perf_span_forms() {
        let bare = perf_span!("retire");
        assert_eq!(bare.name(), "retire");
        assert_eq!(bare.threshold_us(), None);

        let fields = perf_span!("signal_wait", value = 3i64, signal = 9u64);
        assert_eq!(fields.name(), "signal_wait");

        let bounded = perf_span!(threshold_us = 1000; "copy", bytes = 64usize);
        assert_eq!(bounded.threshold_us(), Some(1000));
    }
}
