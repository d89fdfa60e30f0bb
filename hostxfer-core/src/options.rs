//! Engine configuration options.
//!
//! `EngineOptions` is seeded from the environment variables named
//! (`AL_USE_PRIORITY_STREAM`, `AL_PROGRESS_CORE_AFFINITY`,
//! `AL_SYNC_MEM_PREALLOC`) and can be overridden programmatically before
//! `init()` via the `with_*` builder methods, mirroring the corpus's
//! options-struct convention.

use std::env;

/// Engine-wide configuration, read once at `init()` time.
///
/// # Examples
///
/// ```
/// use hostxfer_core::options::EngineOptions;
///
/// let opts = EngineOptions::default()
///     .with_internal_stream_pool_size(8)
///     .with_sync_mem_prealloc(64);
/// ```
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Allocate internal streams at the greatest device-stream priority.
    /// Seeded from `AL_USE_PRIORITY_STREAM` (presence-only).
    pub use_priority_stream: bool,

    /// Progress-thread core-affinity list, implementation-defined format.
    /// Seeded from `AL_PROGRESS_CORE_AFFINITY`. `None` means "no pinning".
    pub progress_core_affinity: Option<Vec<usize>>,

    /// Number of sync-flag slots to preallocate at `init()`.
    /// Seeded from `AL_SYNC_MEM_PREALLOC`.
    pub sync_mem_prealloc: usize,

    /// Size of the fixed-size internal device-stream pool the backend
    /// façade draws from round-robin (default: 5).
    pub internal_stream_pool_size: usize,

    /// Idle back-off the progress engine sleeps for when no state made
    /// progress in a given iteration, to avoid spinning at 100% CPU.
    pub progress_idle_backoff: std::time::Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            use_priority_stream: env::var("AL_USE_PRIORITY_STREAM").is_ok(),
            progress_core_affinity: parse_affinity_env("AL_PROGRESS_CORE_AFFINITY"),
            sync_mem_prealloc: parse_usize_env("AL_SYNC_MEM_PREALLOC").unwrap_or(0),
            internal_stream_pool_size: 5,
            progress_idle_backoff: std::time::Duration::from_micros(50),
        }
    }
}

impl EngineOptions {
    /// Build options purely from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Override whether internal streams request the highest device-stream
    /// priority.
    #[must_use]
    pub const fn with_use_priority_stream(mut self, enabled: bool) -> Self {
        self.use_priority_stream = enabled;
        self
    }

    /// Override the progress-thread core-affinity list.
    #[must_use]
    pub fn with_progress_core_affinity(mut self, cores: Vec<usize>) -> Self {
        self.progress_core_affinity = Some(cores);
        self
    }

    /// Override the number of sync-flag slots to preallocate.
    #[must_use]
    pub const fn with_sync_mem_prealloc(mut self, slots: usize) -> Self {
        self.sync_mem_prealloc = slots;
        self
    }

    /// Override the size of the internal device-stream pool.
    #[must_use]
    pub const fn with_internal_stream_pool_size(mut self, size: usize) -> Self {
        self.internal_stream_pool_size = size;
        self
    }

    /// Override the progress engine's idle back-off.
    #[must_use]
    pub const fn with_progress_idle_backoff(mut self, backoff: std::time::Duration) -> Self {
        self.progress_idle_backoff = backoff;
        self
    }
}

fn parse_usize_env(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_affinity_env(name: &str) -> Option<Vec<usize>> {
    let raw = env::var(name).ok()?;
    let cores: Vec<usize> = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if cores.is_empty() {
        None
    } else {
        Some(cores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_affinity_and_default_pool_size() {
        // Guard against leakage from a parallel test touching these env
        // vars; this test only asserts on fields unaffected by env state
        // that other tests in this module mutate.
        let opts = EngineOptions::default();
        assert_eq!(opts.internal_stream_pool_size, 5);
        assert_eq!(opts.progress_idle_backoff, std::time::Duration::from_micros(50));
    }

    #[test]
    fn builder_overrides_defaults() {
        let opts = EngineOptions::default()
            .with_internal_stream_pool_size(8)
            .with_sync_mem_prealloc(64)
            .with_use_priority_stream(true)
            .with_progress_core_affinity(vec![0, 1, 2]);

        assert_eq!(opts.internal_stream_pool_size, 8);
        assert_eq!(opts.sync_mem_prealloc, 64);
        assert!(opts.use_priority_stream);
        assert_eq!(opts.progress_core_affinity, Some(vec![0, 1, 2]));
    }

    #[test]
    fn affinity_env_parses_comma_separated_list() {
        assert_eq!(
            parse_affinity_env_from_str("0,1,2"),
            Some(vec![0, 1, 2])
        );
        assert_eq!(parse_affinity_env_from_str(""), None);
        assert_eq!(parse_affinity_env_from_str("a,b"), None);
    }

    // Test helper mirroring `parse_affinity_env`'s logic without touching
    // process environment state, so this test is parallel-safe.
    fn parse_affinity_env_from_str(raw: &str) -> Option<Vec<usize>> {
        let cores: Vec<usize> = raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if cores.is_empty() {
            None
        } else {
            Some(cores)
        }
    }
}
