//! Request handle, the host- and device-observable completion token
//! produced by every non-blocking collective call, per spec §4.6.
//!
//! `wait` is the design's key subtlety: it never blocks the calling host
//! thread. It only enqueues a wait on the request's end-side device event
//! into the caller's original stream, so *subsequent device work on that
//! stream* is correctly ordered after the collective, while the host itself
//! stays free. `test` is the only way to observe completion from the host
//! synchronously, and it is itself non-blocking (a single event query).

use std::sync::Arc;

use hostxfer_core::event_pool::DeviceEventToken;

use crate::device::DeviceStream;
use crate::state::ErrorSlot;

struct RequestInner {
    end_event: Arc<DeviceEventToken>,
    stream: Arc<dyn DeviceStream>,
    error: ErrorSlot,
}

/// A reference-counted completion handle for one non-blocking collective.
///
/// Cloning shares the same underlying event and error slot. The error
/// slot is shared with the [`crate::state::CollectiveState`] that is
/// still driving the collective when this handle is created, so the
/// outcome isn't known yet: `error` starts empty and the progress
/// engine fills it in if the transport ultimately fails.
#[derive(Clone)]
pub struct Request {
    inner: Option<Arc<RequestInner>>,
}

impl Request {
    /// Wrap an end-side device event, the stream it was recorded on, and
    /// the error slot shared with the driving state into a request
    /// handle. Called by the backend façade once a state has been
    /// constructed and handed to the progress engine.
    #[must_use]
    pub(crate) fn new(end_event: Arc<DeviceEventToken>, stream: Arc<dyn DeviceStream>, error: ErrorSlot) -> Self {
        Self {
            inner: Some(Arc::new(RequestInner { end_event, stream, error })),
        }
    }

    /// The sentinel "no request" value. Passing this to [`test`] or
    /// [`wait`] is a documented no-op (spec §4.6, §7 "user misuse").
    #[must_use]
    pub const fn null() -> Self {
        Self { inner: None }
    }

    /// True if this handle is the null sentinel.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.inner.is_none()
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::null()
    }
}

/// Non-blocking completion query.
///
/// Returns `true` if `req`'s end-side device event has completed. Once it
/// has, `req` is reset to [`Request::null`] so subsequent calls to either
/// `test` or [`wait`] with the same handle short-circuit immediately
/// (spec §8 idempotence property). A null request is a no-op that
/// returns `true`.
///
/// # Errors
/// If the underlying collective failed, that error is returned here
/// exactly once, on whichever `test` call first observes completion.
pub fn test(req: &mut Request) -> hostxfer_core::error::Result<bool> {
    let Some(inner) = req.inner.clone() else {
        return Ok(true);
    };
    if !inner.end_event.query() {
        return Ok(false);
    }
    let pending = inner.error.lock().take();
    *req = Request::null();
    match pending {
        Some(e) => Err(e),
        None => Ok(true),
    }
}

/// Stream-ordering completion wait.
///
/// Enqueues a wait on `req`'s end-side device event into `req`'s original
/// user stream. It does **not** block the calling host thread. Any
/// device work the caller subsequently enqueues on that same stream is
/// correctly ordered after the collective. A null request is a no-op.
pub fn wait(req: &Request) {
    if let Some(inner) = &req.inner {
        let inner = inner.clone();
        inner.stream.enqueue(Box::new(move || {
            while !inner.end_event.query() {
                std::hint::spin_loop();
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDeviceStream;
    use hostxfer_core::event_pool::EventPool;
    use parking_lot::Mutex;

    #[test]
    fn null_request_test_and_wait_are_no_ops() {
        let mut req = Request::null();
        assert!(test(&mut req).unwrap());
        wait(&req); // must not panic or block
    }

    #[test]
    fn test_is_idempotent_after_first_true() {
        let events = EventPool::new();
        let stream: Arc<dyn DeviceStream> = Arc::new(SimDeviceStream::new(false));
        let event = Arc::new(events.get_event());
        event.mark_complete();
        let mut req = Request::new(event, stream, Arc::new(Mutex::new(None)));

        assert!(test(&mut req).unwrap());
        assert!(req.is_null(), "test must null out the request once complete");
        assert!(test(&mut req).unwrap(), "testing a nulled request is a no-op returning true");
    }

    #[test]
    fn test_surfaces_pending_error_exactly_once() {
        let events = EventPool::new();
        let stream: Arc<dyn DeviceStream> = Arc::new(SimDeviceStream::new(false));
        let event = Arc::new(events.get_event());
        event.mark_complete();
        let error_slot = Arc::new(Mutex::new(Some(hostxfer_core::error::EngineError::transport("boom"))));
        let mut req = Request::new(event, stream, error_slot);

        assert!(test(&mut req).is_err());
        assert!(test(&mut req).unwrap(), "error must only surface once");
    }

    #[test]
    fn wait_does_not_block_the_host() {
        let events = EventPool::new();
        let stream: Arc<dyn DeviceStream> = Arc::new(SimDeviceStream::new(false));
        // Event never completes; if `wait` blocked the host, this test
        // would hang.
        let event = Arc::new(events.get_event());
        let req = Request::new(event, stream, Arc::new(Mutex::new(None)));
        wait(&req);
    }
}
