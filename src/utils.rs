use std::future::Future;
use std::time::{Duration, Instant};

/// Format a `Duration` as a human-readable string with automatic unit scaling.
///
/// Produces output like `1.94ms`, `2.34s`, `150.00µs` using Rust's Debug format.
pub fn fmt_duration(d: Duration) -> String {
    format!("{d:.2?}")
}

/// Await `fut`, logging a warning if it takes longer than `threshold`.
pub async fn warn_if_slow<F: Future>(label: &str, threshold: Duration, fut: F) -> F::Output {
    let start = Instant::now();
    let output = fut.await;
    let elapsed = start.elapsed();
    if elapsed > threshold {
        tracing::warn!(duration = fmt_duration(elapsed), "slow operation: {label}");
    }
    output
}
