//! The twelve collective operations, per spec §6.
//!
//! Each op here is a thin [`crate::state::CollectiveOp`] wrapper around one
//! [`crate::transport::Transport`] method. The device-copy staging and
//! phase bookkeeping is entirely uniform and lives in [`crate::state`];
//! only the transport call itself varies collective to collective. The
//! free functions alongside each op compute the [`crate::state::SignalKind`]
//! a given call site needs, since that depends on the caller's rank for
//! every root-based collective.

use hostxfer_core::datatype::Datatype;
use hostxfer_core::error::Result;

use crate::state::{CollectiveOp, SignalKind};
use crate::transport::{ReduceOp, Transport, TransportRequest};

/// `SignalKind` for a root-addressed collective (Gather, Reduce): the root
/// has device-visible output and needs the full copy-in/copy-out round
/// trip; every other rank only contributes input.
#[must_use]
pub fn root_signal_kind(rank: usize, root: usize) -> SignalKind {
    if rank == root {
        SignalKind::SignalAtEnd
    } else {
        SignalKind::SignalNonRootEarly
    }
}

pub struct AllreduceOp {
    pub count: usize,
    pub dtype: Datatype,
    pub op: ReduceOp,
}

impl CollectiveOp for AllreduceOp {
    fn label(&self) -> &'static str {
        "Allreduce"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_allreduce(sendbuf, self.count, self.dtype, self.op)
    }
}

pub struct AllgatherOp {
    pub count: usize,
    pub dtype: Datatype,
}

impl CollectiveOp for AllgatherOp {
    fn label(&self) -> &'static str {
        "Allgather"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_allgather(sendbuf, self.count, self.dtype)
    }
}

pub struct AlltoallOp {
    pub count: usize,
    pub dtype: Datatype,
}

impl CollectiveOp for AlltoallOp {
    fn label(&self) -> &'static str {
        "Alltoall"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_alltoall(sendbuf, self.count, self.dtype)
    }
}

pub struct BcastOp {
    pub count: usize,
    pub dtype: Datatype,
    pub root: usize,
}

impl CollectiveOp for BcastOp {
    fn label(&self) -> &'static str {
        "Bcast"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_bcast(sendbuf, self.count, self.dtype, self.root)
    }
}

pub struct GatherOp {
    pub count: usize,
    pub dtype: Datatype,
    pub root: usize,
}

impl CollectiveOp for GatherOp {
    fn label(&self) -> &'static str {
        "Gather"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_gather(sendbuf, self.count, self.dtype, self.root)
    }
}

pub struct ReduceOpCollective {
    pub count: usize,
    pub dtype: Datatype,
    pub op: ReduceOp,
    pub root: usize,
}

impl CollectiveOp for ReduceOpCollective {
    fn label(&self) -> &'static str {
        "Reduce"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_reduce(sendbuf, self.count, self.dtype, self.op, self.root)
    }
}

pub struct ReduceScatterOp {
    pub count_per_rank: usize,
    pub dtype: Datatype,
    pub op: ReduceOp,
}

impl CollectiveOp for ReduceScatterOp {
    fn label(&self) -> &'static str {
        "ReduceScatter"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_reduce_scatter(sendbuf, self.count_per_rank, self.dtype, self.op)
    }
}

pub struct ScatterOp {
    pub count: usize,
    pub dtype: Datatype,
    pub root: usize,
}

impl CollectiveOp for ScatterOp {
    fn label(&self) -> &'static str {
        "Scatter"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_scatter(sendbuf, self.count, self.dtype, self.root)
    }
}

pub struct SendOp {
    pub count: usize,
    pub dtype: Datatype,
    pub dest: usize,
    pub tag: i32,
}

impl CollectiveOp for SendOp {
    fn label(&self) -> &'static str {
        "Send"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_send(sendbuf, self.count, self.dtype, self.dest, self.tag)
    }
}

pub struct RecvOp {
    pub count: usize,
    pub dtype: Datatype,
    pub source: usize,
    pub tag: i32,
}

impl CollectiveOp for RecvOp {
    fn label(&self) -> &'static str {
        "Recv"
    }

    fn start_transport(&mut self, _sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_recv(self.count, self.dtype, self.source, self.tag)
    }
}

pub struct SendRecvOp {
    pub dtype: Datatype,
    pub dest: usize,
    pub send_tag: i32,
    pub recv_count: usize,
    pub source: usize,
    pub recv_tag: i32,
}

impl CollectiveOp for SendRecvOp {
    fn label(&self) -> &'static str {
        "SendRecv"
    }

    fn start_transport(&mut self, sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_sendrecv(sendbuf, self.dtype, self.dest, self.send_tag, self.recv_count, self.source, self.recv_tag)
    }
}

pub struct BarrierOp;

impl CollectiveOp for BarrierOp {
    fn label(&self) -> &'static str {
        "Barrier"
    }

    fn start_transport(&mut self, _sendbuf: Vec<u8>, transport: &dyn Transport) -> Result<Box<dyn TransportRequest>> {
        transport.i_barrier()
    }
}
