//! # hostxfer
//!
//! A host-transfer collective engine for GPU-resident buffers: non-blocking
//! collective and point-to-point operations layered over a host-memory
//! message-passing transport, kept stream-ordered with respect to a device
//! queue.
//!
//! ## Architecture
//!
//! The crate is split the way the design separates concerns:
//!
//! - **`hostxfer-core`**: runtime-agnostic primitives, namely the pinned-host
//!   memory pool, device-event pool, the cross-device/host sync flag, element
//!   datatypes, engine options and errors.
//! - **`hostxfer`** (this crate): the coordination machinery built on top,
//!   namely the collective-state phase machine, the progress engine, request
//!   handles, the twelve collectives, and the backend façade.
//!
//! ## The hard part
//!
//! Any single collective's algorithm is a straightforward host-memory
//! transport call. What this crate actually solves is the coordination
//! machinery that:
//! - suspends a transport operation on the CPU until a device copy has
//!   finished,
//! - releases the device to continue consuming the result only after the
//!   transport has finished,
//! - multiplexes many such operations onto a single progress thread that
//!   must never block on the transport,
//! - preserves stream ordering and delivers a request handle usable from
//!   both host and device.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hostxfer::prelude::*;
//! use hostxfer_core::datatype::Datatype;
//!
//! # fn example() -> hostxfer_core::error::Result<()> {
//! let ranks = hostxfer::transport::InProcessTransport::new_world(1);
//! let backend = HostTransferBackend::new(
//!     std::sync::Arc::new(ranks.into_iter().next().unwrap()),
//!     &EngineOptions::default(),
//! )?;
//!
//! let stream = SimDeviceStream::new(false);
//! let buf = SharedDeviceBuffer::from_elements(&[1i32, 2, 3, 4]);
//! backend.allreduce(&buf, 4, Datatype::I32, ReduceOp::Sum, AllreduceAlgorithm::Automatic, &stream)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Non-goals
//!
//! No in-network reductions, no topology-aware algorithm selection, no
//! device-side reduction kernels, no shared-memory optimizations between
//! peers, no overlap of multiple collectives on the same stream beyond
//! natural stream ordering.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

/// Per-collective algorithm enumerations (spec §6).
pub mod algorithm;
/// The backend façade: blocking/non-blocking forms of every collective.
pub mod backend;
/// Concrete `CollectiveOp` implementations for the twelve collectives.
pub mod collectives;
/// Device-stream boundary and the simulated device-stream implementation.
pub mod device;
/// Global init/finalize singleton.
pub mod init;
/// The single background thread that drives in-flight collectives.
pub mod progress;
/// The host- and device-observable completion token.
pub mod request;
/// The collective-state phase machine.
pub mod state;
/// Host-memory transport boundary.
pub mod transport;

/// Common imports for callers driving the engine directly against a
/// concrete backend (as opposed to through [`init`]/[`with_backend`]).
///
/// [`with_backend`]: init::with_backend
pub mod prelude {
    pub use crate::algorithm::{Algorithm, AllreduceAlgorithm};
    pub use crate::backend::HostTransferBackend;
    pub use crate::device::{DeviceStream, SharedDeviceBuffer, SimDeviceStream};
    pub use crate::request::{self, Request};
    pub use crate::transport::ReduceOp;
    pub use hostxfer_core::datatype::Datatype;
    pub use hostxfer_core::error::{EngineError, Result};
    pub use hostxfer_core::options::EngineOptions;
}
