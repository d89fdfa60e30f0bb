//! Progress engine, the single background thread that drives every
//! in-flight collective state to completion, per spec §4.5.
//!
//! The engine never blocks: each iteration drains newly enqueued states
//! from its intake queue, polls every in-flight state's phase machine
//! non-blockingly, reaps states that reached [`Phase::Complete`], and
//! backs off briefly only if nothing progressed this iteration (so an
//! idle engine doesn't spin at 100% CPU). Only this thread ever touches
//! the in-flight list or calls into the transport; the intake queue is
//! the sole hand-off point, matching the "progress engine owns every
//! state pointer between enqueue and destruction" invariant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, Sender};

use hostxfer_core::options::EngineOptions;

use crate::state::{CollectiveState, Phase};

/// Handle to the running progress-engine thread.
///
/// Dropping or calling [`ProgressEngine::shutdown`] stops accepting new
/// work, drains every in-flight state to completion (per spec §4.5
/// finalization: "drains the in-flight list, polling until empty, then
/// joins the thread"), and joins the worker.
pub struct ProgressEngine {
    intake: Sender<CollectiveState>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ProgressEngine {
    /// Start the background worker with the idle back-off and affinity
    /// settings from `options`.
    #[must_use]
    pub fn start(options: &EngineOptions) -> Self {
        let (intake, rx) = flume::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let idle_backoff = options.progress_idle_backoff;
        let affinity = options.progress_core_affinity.clone();

        let worker_stop = stop.clone();
        let worker = std::thread::Builder::new()
            .name("hostxfer-progress".to_owned())
            .spawn(move || {
                if let Some(cores) = affinity {
                    apply_core_affinity(&cores);
                }
                run_loop(&rx, &worker_stop, idle_backoff);
            })
            .expect("spawn progress engine thread");

        Self {
            intake,
            stop,
            worker: Some(worker),
        }
    }

    /// Hand a newly constructed state to the progress engine. Non-blocking:
    /// this only pushes onto the intake queue and returns.
    ///
    /// # Errors
    /// Returns the state back if the engine has already been shut down
    /// (spec §7: "submission after finalize" is a fatal user-misuse error;
    /// the caller is expected to turn this into
    /// [`hostxfer_core::error::EngineError::SubmittedAfterFinalize`]).
    pub fn submit(&self, state: CollectiveState) -> Result<(), CollectiveState> {
        self.intake.send(state).map_err(|e| e.into_inner())
    }

    /// Signal the worker to drain remaining in-flight work and stop, then
    /// join it. Idempotent: calling this twice is a no-op the second
    /// time.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        drop(std::mem::replace(&mut self.intake, flume::unbounded().0));
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(rx: &Receiver<CollectiveState>, stop: &AtomicBool, idle_backoff: Duration) {
    let mut in_flight: Vec<CollectiveState> = Vec::new();

    loop {
        for state in rx.try_iter() {
            in_flight.push(state);
        }

        let mut progressed = false;
        let mut i = 0;
        while i < in_flight.len() {
            let made_progress = in_flight[i].advance();
            progressed |= made_progress;
            if in_flight[i].phase() == Phase::Complete {
                let finished = in_flight.swap_remove(i);
                tracing::trace!(label = finished.label(), "collective state complete");
                drop(finished);
            } else {
                i += 1;
            }
        }

        if stop.load(Ordering::Acquire) {
            drain_to_empty(rx, &mut in_flight);
            return;
        }

        if !progressed {
            std::thread::sleep(idle_backoff);
        }
    }
}

fn drain_to_empty(rx: &Receiver<CollectiveState>, in_flight: &mut Vec<CollectiveState>) {
    loop {
        for state in rx.try_iter() {
            in_flight.push(state);
        }
        if in_flight.is_empty() {
            return;
        }
        let mut i = 0;
        while i < in_flight.len() {
            in_flight[i].advance();
            if in_flight[i].phase() == Phase::Complete {
                in_flight.swap_remove(i);
            } else {
                i += 1;
            }
        }
        if !in_flight.is_empty() {
            std::thread::yield_now();
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_core_affinity(_cores: &[usize]) {
    tracing::debug!("progress-thread core affinity requested but not supported on this platform");
}

#[cfg(target_os = "linux")]
fn apply_core_affinity(cores: &[usize]) {
    let available = num_cpus::get();
    let (valid, out_of_range): (Vec<usize>, Vec<usize>) = cores.iter().partition(|&&c| c < available);
    if !out_of_range.is_empty() {
        tracing::warn!(?out_of_range, available, "ignoring AL_PROGRESS_CORE_AFFINITY entries beyond the machine's CPU count");
    }
    if valid.is_empty() {
        return;
    }

    // SAFETY: `cpu_set_t` is a plain POD struct; `sched_setaffinity(0, ..)`
    // applies to the calling thread and cannot affect memory safety.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for core in valid {
            libc::CPU_SET(core, &mut set);
        }
        let _ = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set as *const libc::cpu_set_t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDeviceStream;
    use crate::state::{CollectiveOp, SignalKind};
    use crate::transport::{InProcessTransport, ReduceOp, Transport, TransportRequest};
    use hostxfer_core::datatype::Datatype;
    use hostxfer_core::error::Result;
    use hostxfer_core::event_pool::EventPool;
    use hostxfer_core::pinned::PinnedPool;

    #[cfg(target_os = "linux")]
    #[test]
    fn apply_core_affinity_ignores_out_of_range_cores_without_panicking() {
        // Asking to pin to a core far beyond what the machine has must be
        // tolerated (logged and skipped), never fatal to the progress
        // thread's startup.
        apply_core_affinity(&[usize::MAX / 2]);
        apply_core_affinity(&[0]);
    }

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

    #[test]
    fn submitted_states_reach_completion() {
        let engine = ProgressEngine::start(&EngineOptions::default());
        let ranks = InProcessTransport::new_world(2);
        let pool = PinnedPool::new();
        let events = EventPool::new();

        let mut reqs = Vec::new();
        for t in ranks {
            let stream = SimDeviceStream::new(false);
            let buf = crate::device::SharedDeviceBuffer::from_elements(&[10i32]);
            let state = CollectiveState::construct(
                "Allreduce",
                SignalKind::SignalAtEnd,
                Box::new(AllreduceSumOp { count: 1 }),
                Arc::new(t),
                Some(&buf),
                4,
                4,
                &stream,
                &pool,
                &events,
            )
            .unwrap();
            let request_event = state.request_event();
            engine.submit(state).unwrap();
            reqs.push((request_event, stream, buf));
        }

        for (event, stream, buf) in reqs {
            while !event.query() {
                std::thread::yield_now();
            }
            stream.synchronize(&events);
            let bytes = buf.to_bytes();
            let value = i32::from_le_bytes(bytes[..4].try_into().unwrap());
            assert_eq!(value, 20);
        }
    }

    #[test]
    fn shutdown_drains_in_flight_work() {
        let mut engine = ProgressEngine::start(&EngineOptions::default());
        let ranks = InProcessTransport::new_world(1);
        let pool = PinnedPool::new();
        let events = EventPool::new();
        let stream = SimDeviceStream::new(false);
        let buf = crate::device::SharedDeviceBuffer::from_elements(&[1i32]);
        let state = CollectiveState::construct(
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
        let request_event = state.request_event();
        engine.submit(state).unwrap();
        engine.shutdown();
        assert!(request_event.query(), "shutdown must drain in-flight states before returning");
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut engine = ProgressEngine::start(&EngineOptions::default());
        engine.shutdown();
        let ranks = InProcessTransport::new_world(1);
        let pool = PinnedPool::new();
        let events = EventPool::new();
        let stream = SimDeviceStream::new(false);
        let buf = crate::device::SharedDeviceBuffer::from_elements(&[1i32]);
        let state = CollectiveState::construct(
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
        assert!(engine.submit(state).is_err());
    }
}
