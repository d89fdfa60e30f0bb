//! Backend façade, the public, uniform non-blocking/blocking surface over
//! every collective, per spec §4.7.
//!
//! Every collective exposes two forms:
//! - a **blocking** form, issued directly on the caller's own stream with
//!   no pre-sync and no request created: the calling thread drives the
//!   state's phase machine to completion itself instead of handing it to
//!   the progress engine;
//! - a **non-blocking** form, issued on a library-internal stream drawn
//!   round-robin from a fixed-size pool (default 5). The internal stream
//!   is first made to wait on an event recorded on the caller's stream (so
//!   it never starts early), then the resulting state is handed to the
//!   progress engine and a [`Request`] is returned backed by an event on
//!   the internal stream but ordered against the caller's own stream (spec
//!   §4.6: `wait` enqueues onto the stream the caller supplied, not onto
//!   the internal one).
//!
//! The [`SignalKind`] used per collective follows spec §4.4's per-variant
//! assignment: symmetric collectives where every participant gets
//! device-visible output (`Allreduce`, `Allgather`, `Alltoall`, `Bcast`,
//! `ReduceScatter`, `Scatter`, `SendRecv`, `Recv`) use `SignalAtEnd` for
//! every rank; `Gather`/`Reduce` use `SignalAtEnd` only for the root and
//! `SignalNonRootEarly` elsewhere; `Send` always uses `SignalNonRootEarly`
//! (the sender has no output to wait for); `Barrier` uses `SignalAtStart`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hostxfer_core::datatype::Datatype;
use hostxfer_core::error::{EngineError, Result};
use hostxfer_core::event_pool::EventPool;
use hostxfer_core::options::EngineOptions;
use hostxfer_core::pinned::{PinnedPool, PINNED_ALIGN};

use crate::algorithm::{Algorithm, AllreduceAlgorithm};
use crate::collectives::{
    root_signal_kind, AllgatherOp, AllreduceOp, AlltoallOp, BarrierOp, BcastOp, GatherOp, RecvOp, ReduceOpCollective,
    ReduceScatterOp, ScatterOp, SendOp, SendRecvOp,
};
use crate::device::{DeviceStream, SharedDeviceBuffer, SimDeviceStream};
use crate::progress::ProgressEngine;
use crate::request::Request;
use crate::state::{CollectiveOp, CollectiveState, SignalKind};
use crate::transport::{ReduceOp, Transport};

/// The host-transfer collective engine's backend façade.
///
/// Owns the resources spec §9 calls "global state": the pinned-host pool,
/// the device-event pool, the progress engine, and the fixed-size internal
/// device-stream pool. One instance is created per communicator by
/// [`crate::init::init`].
pub struct HostTransferBackend {
    transport: Arc<dyn Transport>,
    pinned_pool: PinnedPool,
    event_pool: EventPool,
    progress: ProgressEngine,
    streams: Vec<SimDeviceStream>,
    next_stream: AtomicUsize,
}

impl HostTransferBackend {
    /// Build a backend over `transport`, starting its progress engine and
    /// preallocating its internal stream pool and pinned-memory slots per
    /// `options`.
    pub fn new(transport: Arc<dyn Transport>, options: &EngineOptions) -> Result<Self> {
        let pinned_pool = PinnedPool::with_preallocated(options.sync_mem_prealloc, PINNED_ALIGN)?;
        let event_pool = EventPool::new();
        let progress = ProgressEngine::start(options);
        let pool_size = options.internal_stream_pool_size.max(1);
        let streams = (0..pool_size).map(|_| SimDeviceStream::new(options.use_priority_stream)).collect();

        Ok(Self {
            transport,
            pinned_pool,
            event_pool,
            progress,
            streams,
            next_stream: AtomicUsize::new(0),
        })
    }

    /// Backend name, from the underlying transport.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.transport.name()
    }

    /// This process's rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    /// Number of ranks in the communicator.
    #[must_use]
    pub fn num_ranks(&self) -> usize {
        self.transport.num_ranks()
    }

    /// Replace the internal stream pool with externally supplied streams,
    /// per spec §6's `replace_internal_streams(getter)` hook. The streams
    /// this displaces are dropped normally; that only tears down their
    /// worker if no other handle to them survives elsewhere, so streams
    /// the caller means to keep owning should be kept alive by a clone on
    /// their side before calling this.
    pub fn replace_internal_streams(&mut self, streams: Vec<SimDeviceStream>) {
        assert!(!streams.is_empty(), "internal stream pool must not be empty");
        self.streams = streams;
        self.next_stream.store(0, Ordering::Relaxed);
    }

    fn next_internal_stream(&self) -> SimDeviceStream {
        // Open question resolved: protect the round-robin counter with an
        // atomic increment rather than leaving it racy across user threads.
        let idx = self.next_stream.fetch_add(1, Ordering::Relaxed) % self.streams.len();
        self.streams[idx].clone()
    }

    /// Blocking issuance: construct the state directly on `stream` and
    /// drive it to completion on the calling thread. No pre-sync, no
    /// request.
    fn issue_blocking(
        &self,
        label: &'static str,
        signal_kind: SignalKind,
        op: Box<dyn CollectiveOp>,
        device_buf: Option<&SharedDeviceBuffer>,
        send_len_bytes: usize,
        recv_len_bytes: usize,
        stream: &dyn DeviceStream,
    ) -> Result<()> {
        let mut state = CollectiveState::construct(
            label,
            signal_kind,
            op,
            self.transport.clone(),
            device_buf,
            send_len_bytes,
            recv_len_bytes,
            stream,
            &self.pinned_pool,
            &self.event_pool,
        )?;
        while !state.is_complete() {
            state.advance();
            std::thread::yield_now();
        }
        match state.error_slot().lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Non-blocking issuance: pre-sync an internal stream onto `user_stream`,
    /// construct the state there, hand it to the progress engine, and
    /// return a request backed by the internal stream's end event. The
    /// request itself is tied to `user_stream`, not the internal one: per
    /// spec §4.6, `Request::wait` must enqueue its completion spin-wait
    /// onto the stream the caller actually holds a handle to, so later
    /// work the caller enqueues there is correctly ordered after this
    /// collective. An internal stream is invisible to the caller and
    /// would make that ordering unobservable.
    fn issue_non_blocking(
        &self,
        label: &'static str,
        signal_kind: SignalKind,
        op: Box<dyn CollectiveOp>,
        device_buf: Option<&SharedDeviceBuffer>,
        send_len_bytes: usize,
        recv_len_bytes: usize,
        user_stream: Arc<dyn DeviceStream>,
    ) -> Result<Request> {
        let internal = self.next_internal_stream();

        let presync = user_stream.record_event(&self.event_pool);
        internal.enqueue(Box::new(move || {
            while !presync.query() {
                std::hint::spin_loop();
            }
        }));

        let state = CollectiveState::construct(
            label,
            signal_kind,
            op,
            self.transport.clone(),
            device_buf,
            send_len_bytes,
            recv_len_bytes,
            &internal,
            &self.pinned_pool,
            &self.event_pool,
        )?;

        let request_event = state.request_event();
        let error_slot = state.error_slot();
        self.progress.submit(state).map_err(|_| EngineError::SubmittedAfterFinalize)?;

        Ok(Request::new(request_event, user_stream, error_slot))
    }

    // ---- Allreduce --------------------------------------------------

    /// Blocking in-place allreduce.
    pub fn allreduce(
        &self,
        buf: &SharedDeviceBuffer,
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        _algorithm: AllreduceAlgorithm,
        stream: &dyn DeviceStream,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_blocking("Allreduce", SignalKind::SignalAtEnd, Box::new(AllreduceOp { count, dtype, op }), Some(buf), bytes, bytes, stream)
    }

    /// Non-blocking in-place allreduce.
    pub fn i_allreduce(
        &self,
        buf: &SharedDeviceBuffer,
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        _algorithm: AllreduceAlgorithm,
        stream: Arc<dyn DeviceStream>,
    ) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_non_blocking("Allreduce", SignalKind::SignalAtEnd, Box::new(AllreduceOp { count, dtype, op }), Some(buf), bytes, bytes, stream)
    }

    // ---- Allgather ----------------------------------------------------

    /// Blocking in-place allgather. `buf` must already be sized for
    /// `num_ranks() * count` elements; this rank's own `count`-element
    /// contribution is read from its front.
    pub fn allgather(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, _algorithm: Algorithm, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let send = count * dtype.size_bytes();
        let recv = self.num_ranks() * send;
        self.issue_blocking("Allgather", SignalKind::SignalAtEnd, Box::new(AllgatherOp { count, dtype }), Some(buf), send, recv, stream)
    }

    /// Non-blocking in-place allgather.
    pub fn i_allgather(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, _algorithm: Algorithm, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let send = count * dtype.size_bytes();
        let recv = self.num_ranks() * send;
        self.issue_non_blocking("Allgather", SignalKind::SignalAtEnd, Box::new(AllgatherOp { count, dtype }), Some(buf), send, recv, stream)
    }

    // ---- Alltoall -------------------------------------------------------

    /// Blocking in-place alltoall. `buf` holds `num_ranks() * count`
    /// elements on both legs.
    pub fn alltoall(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, _algorithm: Algorithm, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bytes = self.num_ranks() * count * dtype.size_bytes();
        self.issue_blocking("Alltoall", SignalKind::SignalAtEnd, Box::new(AlltoallOp { count, dtype }), Some(buf), bytes, bytes, stream)
    }

    /// Non-blocking in-place alltoall.
    pub fn i_alltoall(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, _algorithm: Algorithm, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let bytes = self.num_ranks() * count * dtype.size_bytes();
        self.issue_non_blocking("Alltoall", SignalKind::SignalAtEnd, Box::new(AlltoallOp { count, dtype }), Some(buf), bytes, bytes, stream)
    }

    // ---- Bcast ----------------------------------------------------------

    /// Blocking in-place broadcast from `root`.
    pub fn bcast(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, root: usize, _algorithm: Algorithm, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_blocking("Bcast", SignalKind::SignalAtEnd, Box::new(BcastOp { count, dtype, root }), Some(buf), bytes, bytes, stream)
    }

    /// Non-blocking in-place broadcast from `root`.
    pub fn i_bcast(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, root: usize, _algorithm: Algorithm, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_non_blocking("Bcast", SignalKind::SignalAtEnd, Box::new(BcastOp { count, dtype, root }), Some(buf), bytes, bytes, stream)
    }

    // ---- Gather ----------------------------------------------------------

    /// Blocking in-place gather to `root`. On `root`, `buf` must be sized
    /// for `num_ranks() * count` elements with this rank's own slice at
    /// its front; elsewhere `buf` need only hold `count` elements.
    pub fn gather(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, root: usize, _algorithm: Algorithm, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let send = count * dtype.size_bytes();
        let recv = if self.rank() == root { self.num_ranks() * send } else { 0 };
        let signal_kind = root_signal_kind(self.rank(), root);
        self.issue_blocking("Gather", signal_kind, Box::new(GatherOp { count, dtype, root }), Some(buf), send, recv, stream)
    }

    /// Non-blocking in-place gather to `root`.
    pub fn i_gather(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, root: usize, _algorithm: Algorithm, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let send = count * dtype.size_bytes();
        let recv = if self.rank() == root { self.num_ranks() * send } else { 0 };
        let signal_kind = root_signal_kind(self.rank(), root);
        self.issue_non_blocking("Gather", signal_kind, Box::new(GatherOp { count, dtype, root }), Some(buf), send, recv, stream)
    }

    // ---- Reduce ----------------------------------------------------------

    /// Blocking in-place reduce to `root`.
    pub fn reduce(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, op: ReduceOp, root: usize, _algorithm: Algorithm, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bytes = count * dtype.size_bytes();
        let recv = if self.rank() == root { bytes } else { 0 };
        let signal_kind = root_signal_kind(self.rank(), root);
        self.issue_blocking("Reduce", signal_kind, Box::new(ReduceOpCollective { count, dtype, op, root }), Some(buf), bytes, recv, stream)
    }

    /// Non-blocking in-place reduce to `root`.
    pub fn i_reduce(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, op: ReduceOp, root: usize, _algorithm: Algorithm, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let bytes = count * dtype.size_bytes();
        let recv = if self.rank() == root { bytes } else { 0 };
        let signal_kind = root_signal_kind(self.rank(), root);
        self.issue_non_blocking("Reduce", signal_kind, Box::new(ReduceOpCollective { count, dtype, op, root }), Some(buf), bytes, recv, stream)
    }

    // ---- ReduceScatter -----------------------------------------------------

    /// Blocking in-place reduce-scatter. `buf` holds
    /// `num_ranks() * count_per_rank` elements on input, `count_per_rank`
    /// on output.
    pub fn reduce_scatter(&self, buf: &SharedDeviceBuffer, count_per_rank: usize, dtype: Datatype, op: ReduceOp, _algorithm: Algorithm, stream: &dyn DeviceStream) -> Result<()> {
        if count_per_rank == 0 {
            return Ok(());
        }
        let elem = dtype.size_bytes();
        let send = self.num_ranks() * count_per_rank * elem;
        let recv = count_per_rank * elem;
        self.issue_blocking("ReduceScatter", SignalKind::SignalAtEnd, Box::new(ReduceScatterOp { count_per_rank, dtype, op }), Some(buf), send, recv, stream)
    }

    /// Non-blocking in-place reduce-scatter.
    pub fn i_reduce_scatter(&self, buf: &SharedDeviceBuffer, count_per_rank: usize, dtype: Datatype, op: ReduceOp, _algorithm: Algorithm, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count_per_rank == 0 {
            return Ok(Request::null());
        }
        let elem = dtype.size_bytes();
        let send = self.num_ranks() * count_per_rank * elem;
        let recv = count_per_rank * elem;
        self.issue_non_blocking("ReduceScatter", SignalKind::SignalAtEnd, Box::new(ReduceScatterOp { count_per_rank, dtype, op }), Some(buf), send, recv, stream)
    }

    // ---- Scatter ------------------------------------------------------------

    /// Blocking in-place scatter from `root`. Every rank (including
    /// `root`) receives device-visible output, per spec §4.4.
    pub fn scatter(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, root: usize, _algorithm: Algorithm, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let recv = count * dtype.size_bytes();
        let send = if self.rank() == root { self.num_ranks() * recv } else { 0 };
        self.issue_blocking("Scatter", SignalKind::SignalAtEnd, Box::new(ScatterOp { count, dtype, root }), Some(buf), send, recv, stream)
    }

    /// Non-blocking in-place scatter from `root`.
    pub fn i_scatter(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, root: usize, _algorithm: Algorithm, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let recv = count * dtype.size_bytes();
        let send = if self.rank() == root { self.num_ranks() * recv } else { 0 };
        self.issue_non_blocking("Scatter", SignalKind::SignalAtEnd, Box::new(ScatterOp { count, dtype, root }), Some(buf), send, recv, stream)
    }

    // ---- Send / Recv / SendRecv --------------------------------------------

    /// Blocking point-to-point send of `buf`'s contents.
    pub fn send(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, dest: usize, tag: i32, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_blocking("Send", SignalKind::SignalNonRootEarly, Box::new(SendOp { count, dtype, dest, tag }), Some(buf), bytes, 0, stream)
    }

    /// Non-blocking point-to-point send.
    pub fn i_send(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, dest: usize, tag: i32, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_non_blocking("Send", SignalKind::SignalNonRootEarly, Box::new(SendOp { count, dtype, dest, tag }), Some(buf), bytes, 0, stream)
    }

    /// Blocking point-to-point receive into `buf`.
    pub fn recv(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, source: usize, tag: i32, stream: &dyn DeviceStream) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_blocking("Recv", SignalKind::SignalAtEnd, Box::new(RecvOp { count, dtype, source, tag }), Some(buf), bytes, bytes, stream)
    }

    /// Non-blocking point-to-point receive.
    pub fn i_recv(&self, buf: &SharedDeviceBuffer, count: usize, dtype: Datatype, source: usize, tag: i32, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        if count == 0 {
            return Ok(Request::null());
        }
        let bytes = count * dtype.size_bytes();
        self.issue_non_blocking("Recv", SignalKind::SignalAtEnd, Box::new(RecvOp { count, dtype, source, tag }), Some(buf), bytes, bytes, stream)
    }

    /// Blocking combined send/receive. `buf` carries the outgoing payload
    /// on input and the incoming payload on output.
    #[allow(clippy::too_many_arguments)]
    pub fn sendrecv(
        &self,
        buf: &SharedDeviceBuffer,
        dtype: Datatype,
        dest: usize,
        send_count: usize,
        send_tag: i32,
        recv_count: usize,
        source: usize,
        recv_tag: i32,
        stream: &dyn DeviceStream,
    ) -> Result<()> {
        if send_count == 0 && recv_count == 0 {
            return Ok(());
        }
        let elem = dtype.size_bytes();
        self.issue_blocking(
            "SendRecv",
            SignalKind::SignalAtEnd,
            Box::new(SendRecvOp { dtype, dest, send_tag, recv_count, source, recv_tag }),
            Some(buf),
            send_count * elem,
            recv_count * elem,
            stream,
        )
    }

    /// Non-blocking combined send/receive.
    #[allow(clippy::too_many_arguments)]
    pub fn i_sendrecv(
        &self,
        buf: &SharedDeviceBuffer,
        dtype: Datatype,
        dest: usize,
        send_count: usize,
        send_tag: i32,
        recv_count: usize,
        source: usize,
        recv_tag: i32,
        stream: Arc<dyn DeviceStream>,
    ) -> Result<Request> {
        if send_count == 0 && recv_count == 0 {
            return Ok(Request::null());
        }
        let elem = dtype.size_bytes();
        self.issue_non_blocking(
            "SendRecv",
            SignalKind::SignalAtEnd,
            Box::new(SendRecvOp { dtype, dest, send_tag, recv_count, source, recv_tag }),
            Some(buf),
            send_count * elem,
            recv_count * elem,
            stream,
        )
    }

    // ---- Barrier --------------------------------------------------------

    /// Blocking barrier.
    pub fn barrier(&self, stream: &dyn DeviceStream) -> Result<()> {
        self.issue_blocking("Barrier", SignalKind::SignalAtStart, Box::new(BarrierOp), None, 0, 0, stream)
    }

    /// Non-blocking barrier.
    pub fn i_barrier(&self, stream: Arc<dyn DeviceStream>) -> Result<Request> {
        self.issue_non_blocking("Barrier", SignalKind::SignalAtStart, Box::new(BarrierOp), None, 0, 0, stream)
    }
}
