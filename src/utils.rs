//! Common utilities used across the crate.

// =============================================================================
// Thread Pool Setup
// =============================================================================

/// Run a closure inside a rayon pool of the requested width.
///
/// Thread count semantics:
/// - `0` = auto (use all available cores)
/// - `n >= 1` = use exactly `n` threads
///
/// All parallel operations in this crate run on whatever pool is installed,
/// so pinning the width here makes an entire training round sequential or
/// fixed-width. The reproducibility tests rely on this to compare runs
/// across thread counts.
pub fn run_with_threads<T: Send>(n_threads: usize, f: impl FnOnce() -> T + Send) -> T {
    if n_threads == 0 {
        return f();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build()
        .expect("failed to create thread pool");
    pool.install(f)
}
