//! Timing spans and the runtime's standard performance events
//!
//! A [`PerformanceSpan`] measures from construction to drop and then emits a
//! `perf_span_closed` event inside its span, unless performance tracing is
//! switched off or the span finished under its threshold. The `record_*`
//! events are dropped while performance tracing is off.
//!
//! ```rust
//! use aql_tracing::performance::{record_dispatch, PerformanceSpan};
//!
//! {
//!     let _span = PerformanceSpan::new("dispatch", Some(100));
//! }
//! record_dispatch(0x42, 4, 256, 120);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

const NO_THRESHOLD: u64 = u64::MAX;

static ENABLED: AtomicBool = AtomicBool::new(true);
static THRESHOLD_US: AtomicU64 = AtomicU64::new(NO_THRESHOLD);

/// Process-wide switches, applied by [`crate::install`]. A span's own
/// threshold wins over `threshold_us`.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    THRESHOLD_US.store(threshold_us.unwrap_or(NO_THRESHOLD), Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    Some(THRESHOLD_US.load(Ordering::Relaxed)).filter(|&us| us != NO_THRESHOLD)
}

/// Timer logged when dropped
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    started: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = tracing::debug_span!("perf", name = %name);
        Self::from_span(span, name, threshold_us)
    }

    /// Time an existing span; [`crate::perf_span!`] uses this to attach fields.
    pub fn from_span(span: tracing::Span, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self {
            name: name.into(),
            threshold_us,
            started: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold_us(&self) -> Option<u64> {
        self.threshold_us
    }

    pub fn elapsed_us(&self) -> u64 {
        micros(self.started)
    }

    fn should_log(&self, elapsed_us: u64) -> bool {
        if !is_enabled() {
            return false;
        }
        match self.threshold_us.or_else(global_threshold) {
            Some(threshold) => elapsed_us >= threshold,
            None => true,
        }
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.should_log(elapsed_us) {
            self.span.in_scope(|| tracing::debug!(elapsed_us, "perf_span_closed"));
        }
    }
}

/// Microseconds since `start`, saturating.
pub fn micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// A kernel dispatch finished on a command processor.
pub fn record_dispatch(kernel_object: u64, workgroups: u64, work_items: u64, duration_us: u64) {
    if !is_enabled() {
        return;
    }
    tracing::debug!(
        kernel_object,
        workgroups,
        work_items,
        duration_us,
        items_per_sec = rate(work_items as f64, duration_us),
        "kernel_dispatch"
    );
}

/// A block was carved out of a region.
pub fn record_allocation(region: &str, size_bytes: usize, alignment: usize, duration_us: u64) {
    if !is_enabled() {
        return;
    }
    tracing::debug!(region, size_bytes, alignment, duration_us, "region_allocation");
}

pub fn record_copy(bytes: usize, duration_us: u64) {
    if !is_enabled() {
        return;
    }
    tracing::debug!(
        bytes,
        duration_us,
        mib_per_sec = rate(bytes as f64, duration_us) / (1024.0 * 1024.0),
        "memory_copy"
    );
}

fn rate(amount: f64, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    amount * 1_000_000.0 / duration_us as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serial_test::serial;
    use std::io::{self, Write};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_span_elapsed() {
        let span = PerformanceSpan::new("sleep", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
        assert_eq!(span.name(), "sleep");
    }

    #[test]
    #[serial]
    fn test_threshold_resolution() {
        configure(true, Some(500));
        let inherits = PerformanceSpan::new("a", None);
        assert!(!inherits.should_log(100));
        assert!(inherits.should_log(500));

        let own = PerformanceSpan::new("b", Some(10));
        assert!(own.should_log(100));

        configure(false, None);
        assert!(!own.should_log(100));
        configure(true, None);
        assert!(inherits.should_log(0));
    }

    #[test]
    fn test_rate() {
        assert_eq!(rate(1_000_000.0, 1000), 1_000_000_000.0);
        assert_eq!(rate(5.0, 0), 0.0);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn record_all() {
        record_dispatch(1, 4, 256, 10);
        record_allocation("system", 4096, 64, 3);
        record_copy(1 << 20, 1000);
    }

    #[test]
    #[serial]
    fn test_record_events_follow_the_switch() {
        let captured = Capture::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            configure(false, None);
            record_all();
            assert_eq!(captured.text(), "");

            configure(true, None);
            record_all();
        });

        let text = captured.text();
        for event in ["kernel_dispatch", "region_allocation", "memory_copy"] {
            assert!(text.contains(event), "{event} missing from {text:?}");
        }
    }
}
