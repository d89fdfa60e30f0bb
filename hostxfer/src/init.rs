//! Global init/finalize, per spec §6 and §9.
//!
//! "Global state (device/event pools, internal stream array, progress
//! engine singleton) maps to a module-scoped object constructed by `init`
//! and destroyed by `finalize`; no re-initialization is permitted
//! mid-run." That object is exactly [`crate::backend::HostTransferBackend`];
//! this module is only the singleton slot around it, following the
//! corpus's `OnceCell`-guarded-global pattern.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use hostxfer_core::error::{EngineError, Result};
use hostxfer_core::options::EngineOptions;

use crate::backend::HostTransferBackend;
use crate::device::SimDeviceStream;
use crate::transport::Transport;

static ENGINE: OnceCell<Mutex<Option<HostTransferBackend>>> = OnceCell::new();

fn slot() -> &'static Mutex<Option<HostTransferBackend>> {
    ENGINE.get_or_init(|| Mutex::new(None))
}

/// Establish the internal device stream pool, preallocate sync memory, and
/// start the progress thread, over `transport`.
///
/// # Errors
/// Returns [`EngineError::AlreadyInitialized`] if called again before a
/// matching [`finalize`].
pub fn init(transport: Arc<dyn Transport>, options: EngineOptions) -> Result<()> {
    let mut guard = slot().lock();
    if guard.is_some() {
        return Err(EngineError::AlreadyInitialized);
    }
    *guard = Some(HostTransferBackend::new(transport, &options)?);
    Ok(())
}

/// Drain in-flight ops, stop the progress thread, and tear down pools and
/// streams (unless they were previously replaced with externally owned
/// ones via [`replace_internal_streams`]).
///
/// # Errors
/// Returns [`EngineError::NotInitialized`] if [`init`] was never called,
/// or already finalized.
pub fn finalize() -> Result<()> {
    let mut guard = slot().lock();
    match guard.take() {
        Some(backend) => {
            drop(backend);
            Ok(())
        }
        None => Err(EngineError::NotInitialized),
    }
}

/// True if [`init`] has been called and [`finalize`] has not.
#[must_use]
pub fn is_initialized() -> bool {
    slot().lock().is_some()
}

/// Run `f` against the initialized backend.
///
/// # Errors
/// Returns [`EngineError::NotInitialized`] if the engine has not been
/// initialized (or has already been finalized).
pub fn with_backend<R>(f: impl FnOnce(&HostTransferBackend) -> Result<R>) -> Result<R> {
    let guard = slot().lock();
    match guard.as_ref() {
        Some(backend) => f(backend),
        None => Err(EngineError::NotInitialized),
    }
}

/// Swap the internal stream pool for externally owned streams (spec §6).
/// Streams supplied this way are not destroyed by a later [`finalize`]
/// as long as the caller keeps its own handle to them alive.
///
/// # Errors
/// Returns [`EngineError::NotInitialized`] if called before [`init`].
pub fn replace_internal_streams(streams: Vec<SimDeviceStream>) -> Result<()> {
    let mut guard = slot().lock();
    match guard.as_mut() {
        Some(backend) => {
            backend.replace_internal_streams(streams);
            Ok(())
        }
        None => Err(EngineError::NotInitialized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;

    // A single test drives the whole init/finalize lifecycle sequentially:
    // the engine is one process-wide singleton, so exercising it from more
    // than one test function would race against the `cargo test` default
    // thread-per-test parallelism.
    #[test]
    fn init_finalize_lifecycle_enforces_single_instance() {
        assert!(!is_initialized());
        assert!(matches!(finalize(), Err(EngineError::NotInitialized)));

        let transport = InProcessTransport::new_world(1).into_iter().next().unwrap();
        init(Arc::new(transport), EngineOptions::default()).unwrap();
        assert!(is_initialized());

        let transport2 = InProcessTransport::new_world(1).into_iter().next().unwrap();
        assert!(matches!(init(Arc::new(transport2), EngineOptions::default()), Err(EngineError::AlreadyInitialized)));

        let name = with_backend(|b| Ok(b.name())).unwrap();
        assert!(!name.is_empty());

        let extra = SimDeviceStream::new(false);
        replace_internal_streams(vec![extra]).unwrap();

        finalize().unwrap();
        assert!(!is_initialized());
        assert!(matches!(with_backend(|_| Ok(())), Err(EngineError::NotInitialized)));
        assert!(matches!(replace_internal_streams(vec![SimDeviceStream::new(false)]), Err(EngineError::NotInitialized)));

        // Re-init after a clean finalize is allowed.
        let transport3 = InProcessTransport::new_world(1).into_iter().next().unwrap();
        init(Arc::new(transport3), EngineOptions::default()).unwrap();
        assert!(is_initialized());
        finalize().unwrap();
    }
}
