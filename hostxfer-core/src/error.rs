//! Engine error types.
//!
//! Comprehensive error handling for the host-transfer collective engine,
//! covering the four error kinds the design calls out: device runtime
//! failure, transport failure, user misuse, and resource exhaustion.

use std::io;
use thiserror::Error;

/// Main error type for host-transfer engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A device runtime call failed. Always fatal, no attempt at recovery.
    #[error("device runtime error in `{call}`: {source}")]
    DeviceRuntime {
        /// Identifier of the failing device call (e.g. `cudaMemcpyAsync`).
        call: &'static str,
        /// Underlying OS/driver error, when one is available.
        #[source]
        source: io::Error,
    },

    /// A non-blocking transport call failed at issue or at query time.
    #[error("transport error: {0}")]
    Transport(String),

    /// An unrecognized algorithm selection was requested.
    #[error("unrecognized algorithm for {collective}: {requested}")]
    UnknownAlgorithm {
        /// The collective the algorithm was requested for.
        collective: &'static str,
        /// The unrecognized value, for diagnostics.
        requested: String,
    },

    /// A non-blocking call was submitted after `finalize()`.
    #[error("submission after finalize")]
    SubmittedAfterFinalize,

    /// The pinned-host allocator could not satisfy a request. Fatal: the
    /// state cannot proceed without its staging buffer.
    #[error("pinned allocation of {bytes} bytes failed: {reason}")]
    PinnedAllocFailed {
        /// Requested size in bytes.
        bytes: usize,
        /// Underlying allocator failure description.
        reason: String,
    },

    /// The engine was asked to initialize twice, or used before `init()`.
    #[error("engine already initialized")]
    AlreadyInitialized,

    /// The engine was used before `init()` was called.
    #[error("engine not initialized")]
    NotInitialized,
}

/// Result type alias for host-transfer engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a device runtime error for the named call.
    pub fn device_runtime(call: &'static str, source: io::Error) -> Self {
        Self::DeviceRuntime { call, source }
    }

    /// Create a transport error with a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an unknown-algorithm error.
    pub fn unknown_algorithm(collective: &'static str, requested: impl Into<String>) -> Self {
        Self::UnknownAlgorithm {
            collective,
            requested: requested.into(),
        }
    }

    /// True for errors the design treats as process-fatal: the engine
    /// cannot make forward progress for *any* communicator afterward.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceRuntime { .. } | Self::PinnedAllocFailed { .. }
        )
    }
}
