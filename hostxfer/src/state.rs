//! Collective state, the core device-copy / transport / device-copy
//! state machine described in spec §4.4.
//!
//! `CollectiveState` is constructed once per non-blocking collective call,
//! enqueued onto the progress engine, and polled to completion. Its
//! construction performs the deterministic device-stream sequence the
//! design calls for:
//!
//! 1. copy device→host into a pinned staging buffer (skipped for
//!    [`SignalKind::SignalAtStart`], which has no user input);
//! 2. record a device event marking that copy complete;
//! 3. enqueue a wait on the collective's [`SyncFlag`];
//! 4. for [`SignalKind::SignalAtEnd`] only: copy host→device out of the
//!    same staging buffer, then record a second device event;
//! 5. for [`SignalKind::SignalAtStart`]: no copy either way, but still
//!    record a second device event after the wait-on-flag job, so its
//!    request reflects real transport completion rather than firing
//!    before the collective has actually run.
//!
//! Every event recording happens on the submitting user thread at
//! construction time. The progress engine thread only ever polls events,
//! never records one, preserving the "cross-thread event recording"
//! invariant from the design notes.

use std::sync::Arc;

use parking_lot::Mutex;

use hostxfer_core::error::Result;
use hostxfer_core::event_pool::{DeviceEventToken, EventPool};
use hostxfer_core::pinned::{PinnedBuffer, PinnedPool};
use hostxfer_core::sync_flag::SyncFlag;

use crate::device::{DeviceStream, SharedDeviceBuffer};
use crate::transport::{Transport, TransportRequest};

/// Which of the four signaling shapes a collective follows, per spec
/// §4.4. Determines where the request-visible device event is recorded
/// and whether a device→host→device round trip or just one leg is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Every participant has device-visible output: device copy in →
    /// transport → device copy out, event recorded at the end.
    SignalAtEnd,
    /// No device-visible output for this participant; the event is
    /// recorded right after the device→host copy instead of waiting for
    /// a redundant copy back.
    SignalNonRootEarly,
    /// No user input or output to stage (barrier); the event is recorded
    /// once the sync flag has been signalled, after real transport
    /// completion, same as [`SignalKind::SignalAtEnd`], just without any
    /// data copy on either side.
    SignalAtStart,
    /// No device involvement at all. Used by the façade's blocking
    /// issuance path, which drives the transport directly on the calling
    /// thread without ever touching the progress engine.
    PureTransport,
}

/// Phase of an in-flight collective, advanced only by the progress engine
/// (never by the constructing thread, never by a blocking wait).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the start-side device event (the device→host copy, or
    /// nothing at all for [`SignalKind::SignalAtStart`]) to complete.
    WaitingForDeviceCopy,
    /// The transport's non-blocking op has been issued; waiting for its
    /// completion query to succeed.
    TransportStarted,
    /// The sync flag has been signalled. Terminal for
    /// [`SignalKind::SignalAtStart`] and [`SignalKind::SignalNonRootEarly`];
    /// for [`SignalKind::SignalAtEnd`] the state still waits for the
    /// trailing device copy-out's end event before completing.
    Signaled,
    /// Terminal. The state is removed from the in-flight list and its
    /// pinned buffer (if any) is released on the next poll after this.
    Complete,
}

/// Per-variant transport call content: the `start_transport` leg of the
/// `{prepare_device, start_transport, finish_device}` interface from the
/// design notes. `prepare_device` and `finish_device` are handled directly
/// by [`CollectiveState`] (staging into / out of the pinned buffer is
/// uniform across collectives); only the transport call itself varies.
pub trait CollectiveOp: Send {
    /// Name used in tracing spans and error messages.
    fn label(&self) -> &'static str;

    /// Issue this collective's non-blocking transport call. `sendbuf` is
    /// the bytes staged into the pinned buffer by the device→host copy;
    /// empty for variants with no input (recv, signal-at-start).
    fn start_transport(
        &mut self,
        sendbuf: Vec<u8>,
        transport: &dyn Transport,
    ) -> Result<Box<dyn TransportRequest>>;
}

/// One in-flight collective. Owned by the progress engine from the moment
/// it is handed across the intake queue until it reaches [`Phase::Complete`],
/// per the "progress engine owns every state pointer between enqueue and
/// destruction" invariant.
pub struct CollectiveState {
    label: &'static str,
    signal_kind: SignalKind,
    phase: Phase,
    transport: Arc<dyn Transport>,
    op: Box<dyn CollectiveOp>,
    pinned: Option<Arc<Mutex<PinnedBuffer>>>,
    send_len_bytes: usize,
    sync_flag: SyncFlag,
    start_event: Arc<DeviceEventToken>,
    request_event: Arc<DeviceEventToken>,
    transport_request: Option<Box<dyn TransportRequest>>,
    error_slot: ErrorSlot,
}

/// Shared error slot linking a [`CollectiveState`] to the
/// [`crate::request::Request`] issued for it: the state writes into it
/// when the progress engine observes a failure, the request reads it back
/// on `test`. Neither side knows the outcome at the moment the request is
/// handed to the user, since the collective has not run yet.
pub type ErrorSlot = Arc<Mutex<Option<hostxfer_core::error::EngineError>>>;

impl CollectiveState {
    /// Perform the deterministic device-stream construction sequence for
    /// one non-blocking collective and return the resulting state, ready
    /// to be handed to the progress engine.
    ///
    /// `device_buf` is `None` for [`SignalKind::SignalAtStart`] (barrier:
    /// nothing to stage) and for the receive side of a pure receive
    /// (staged purely as output, handled by passing a zeroed buffer the
    /// caller already owns).
    #[allow(clippy::too_many_arguments)]
    pub fn construct(
        label: &'static str,
        signal_kind: SignalKind,
        op: Box<dyn CollectiveOp>,
        transport: Arc<dyn Transport>,
        device_buf: Option<&SharedDeviceBuffer>,
        send_len_bytes: usize,
        recv_len_bytes: usize,
        stream: &dyn DeviceStream,
        pinned_pool: &PinnedPool,
        event_pool: &EventPool,
    ) -> Result<Self> {
        let stage_bytes = send_len_bytes.max(recv_len_bytes);
        let pinned = if stage_bytes > 0 || device_buf.is_some() {
            Some(Arc::new(Mutex::new(pinned_pool.allocate_bytes(stage_bytes.max(1))?)))
        } else {
            None
        };

        let has_input = matches!(signal_kind, SignalKind::SignalAtEnd | SignalKind::SignalNonRootEarly);
        if has_input {
            if let (Some(pinned), Some(device_buf)) = (&pinned, device_buf) {
                let pinned = pinned.clone();
                let device_buf = device_buf.clone();
                stream.enqueue(Box::new(move || {
                    let bytes = device_buf.to_bytes();
                    let mut guard = pinned.lock();
                    let n = bytes.len().min(guard.byte_len());
                    // SAFETY: exclusive access is guaranteed by the
                    // construction sequence; nothing else touches this
                    // buffer until the engine observes `start_event`.
                    let dst = unsafe { std::slice::from_raw_parts_mut(guard.as_mut_ptr(), n) };
                    dst.copy_from_slice(&bytes[..n]);
                }));
            }
        }

        let start_event = stream.record_event(event_pool);
        let sync_flag = SyncFlag::new();
        stream.enqueue_wait_on_flag(sync_flag.clone());

        let request_event = match signal_kind {
            SignalKind::SignalAtEnd => {
                if let (Some(pinned), Some(device_buf)) = (&pinned, device_buf) {
                    let pinned = pinned.clone();
                    let device_buf = device_buf.clone();
                    stream.enqueue(Box::new(move || {
                        let guard = pinned.lock();
                        let n = recv_len_bytes.min(guard.byte_len());
                        // SAFETY: the preceding wait-on-flag guarantees the
                        // progress engine has finished writing the result
                        // into this buffer (release on `signal`, acquire on
                        // the flag's poll loop) before this job runs.
                        let src = unsafe { std::slice::from_raw_parts(guard.as_ptr(), n) };
                        device_buf.set_bytes(&src[..n]);
                    }));
                }
                stream.record_event(event_pool)
            }
            // No data to copy back, but the request must still only
            // observe real completion: record after the wait-on-flag job
            // rather than reusing the early `start_event`.
            SignalKind::SignalAtStart => stream.record_event(event_pool),
            SignalKind::SignalNonRootEarly | SignalKind::PureTransport => start_event.clone(),
        };

        Ok(Self {
            label,
            signal_kind,
            phase: Phase::WaitingForDeviceCopy,
            transport,
            op,
            pinned,
            send_len_bytes,
            sync_flag,
            start_event,
            request_event,
            transport_request: None,
            error_slot: Arc::new(Mutex::new(None)),
        })
    }

    /// The device event the request handle should observe for host/device
    /// completion, per the variant's signaling shape.
    #[must_use]
    pub fn request_event(&self) -> Arc<DeviceEventToken> {
        self.request_event.clone()
    }

    /// The shared slot a [`crate::request::Request`] issued alongside this
    /// state should read its error from.
    #[must_use]
    pub fn error_slot(&self) -> ErrorSlot {
        self.error_slot.clone()
    }

    /// Current phase, for the progress engine's bookkeeping and tests.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Name of the collective this state is driving, for tracing.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.label
    }

    fn read_sendbuf(&self) -> Vec<u8> {
        match &self.pinned {
            Some(pinned) => {
                let guard = pinned.lock();
                let n = self.send_len_bytes.min(guard.byte_len());
                // SAFETY: `start_event` has already been observed
                // complete by the caller of `advance`, so the
                // device→host copy that populated this buffer has run.
                unsafe { std::slice::from_raw_parts(guard.as_ptr(), n) }.to_vec()
            }
            None => Vec::new(),
        }
    }

    fn write_result(&self, bytes: &[u8]) {
        if let Some(pinned) = &self.pinned {
            let mut guard = pinned.lock();
            let n = bytes.len().min(guard.byte_len());
            // SAFETY: exclusive access. The trailing copy-out job is
            // still parked behind `wait_on_flag`, which has not yet been
            // signalled when this runs.
            let dst = unsafe { std::slice::from_raw_parts_mut(guard.as_mut_ptr(), n) };
            dst.copy_from_slice(&bytes[..n]);
        }
    }

    /// Advance this state's phase by as much as is currently possible,
    /// polling every relevant handle non-blockingly. Returns `true` if any
    /// transition happened (used by the progress engine to decide whether
    /// to back off on an otherwise-idle iteration).
    pub fn advance(&mut self) -> bool {
        match self.phase {
            Phase::WaitingForDeviceCopy => {
                if !self.start_event.query() {
                    return false;
                }
                let sendbuf = self.read_sendbuf();
                match self.op.start_transport(sendbuf, self.transport.as_ref()) {
                    Ok(req) => {
                        self.transport_request = Some(req);
                        self.phase = Phase::TransportStarted;
                    }
                    Err(e) => {
                        *self.error_slot.lock() = Some(e);
                        self.sync_flag.signal();
                        self.phase = match self.signal_kind {
                            SignalKind::SignalAtEnd => Phase::Signaled,
                            _ => Phase::Complete,
                        };
                    }
                }
                true
            }
            Phase::TransportStarted => {
                let req = self.transport_request.as_mut().expect("transport request set in this phase");
                match req.test() {
                    Ok(false) => false,
                    Ok(true) => {
                        let result = req.take_result();
                        if self.signal_kind == SignalKind::SignalAtEnd {
                            self.write_result(&result);
                        }
                        self.sync_flag.signal();
                        self.phase = match self.signal_kind {
                            SignalKind::SignalAtEnd => Phase::Signaled,
                            _ => Phase::Complete,
                        };
                        true
                    }
                    Err(e) => {
                        *self.error_slot.lock() = Some(e);
                        self.sync_flag.signal();
                        self.phase = match self.signal_kind {
                            SignalKind::SignalAtEnd => Phase::Signaled,
                            _ => Phase::Complete,
                        };
                        true
                    }
                }
            }
            Phase::Signaled => {
                if self.request_event.query() {
                    self.phase = Phase::Complete;
                    true
                } else {
                    false
                }
            }
            Phase::Complete => false,
        }
    }

    /// True once this state has reached [`Phase::Complete`] and can be
    /// dropped (which releases its pinned buffer back to the pool).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDeviceStream;
    use crate::transport::{InProcessTransport, ReduceOp};
    use hostxfer_core::datatype::Datatype;

    struct AllreduceSumOp {
        count: usize,
    }

    impl CollectiveOp for AllreduceSumOp {
        fn label(&self) -> &'static str {
            "Allreduce"
        }

        fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
            transport.i_allreduce(sendbuf, self.count, Datatype::I32, ReduceOp::Sum)
        }
    }

    fn from_bytes_i32(b: &[u8]) -> Vec<i32> {
        b.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn signal_at_end_runs_to_completion_and_writes_back() {
        let ranks = InProcessTransport::new_world(2);
        let pool = PinnedPool::new();
        let events = EventPool::new();

        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                let pool = pool.clone();
                let events = events.clone();
                std::thread::spawn(move || {
                    let stream = SimDeviceStream::new(false);
                    let buf = SharedDeviceBuffer::from_elements(&[1i32, 2, 3, 4]);
                    let mut state = CollectiveState::construct(
                        "Allreduce",
                        SignalKind::SignalAtEnd,
                        Box::new(AllreduceSumOp { count: 4 }),
                        Arc::new(t),
                        Some(&buf),
                        16,
                        16,
                        &stream,
                        &pool,
                        &events,
                    )
                    .unwrap();

                    while !state.is_complete() {
                        state.advance();
                        std::thread::yield_now();
                    }
                    stream.synchronize(&events);
                    from_bytes_i32(&buf.to_bytes())
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), vec![2, 4, 6, 8]);
        }
    }

    #[test]
    fn advance_on_complete_state_is_a_no_op() {
        let ranks = InProcessTransport::new_world(1);
        let pool = PinnedPool::new();
        let events = EventPool::new();
        let stream = SimDeviceStream::new(false);
        let buf = SharedDeviceBuffer::from_elements(&[9i32]);
        let mut state = CollectiveState::construct(
            "Allreduce",
            SignalKind::SignalAtEnd,
            Box::new(AllreduceSumOp { count: 1 }),
            Arc::new(ranks.into_iter().next().unwrap()),
            Some(&buf),
            4,
            4,
            &stream,
            &pool,
            &events,
        )
        .unwrap();

        while !state.is_complete() {
            state.advance();
            std::thread::yield_now();
        }
        assert!(!state.advance(), "advancing a complete state must not transition further");
    }
}
