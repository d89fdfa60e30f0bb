//! Host-memory transport boundary.
//!
//! The engine treats the underlying message-passing transport as an
//! external collaborator: every collective is a uniform wrapper
//! over the transport's non-blocking host-memory primitives. This module
//! defines that boundary as `Transport`/`TransportRequest` traits and
//! ships one concrete, in-process implementation (`InProcessTransport`)
//! used by the test suite: one rendezvous slot per logical collective
//! call and one mailbox per ordered `(rank, rank, tag)` triple, per the
//! peer-map/dispatch shape of the corpus's router hub, backed by
//! `dashmap` so concurrent ranks never serialize on a single mutex.
//!
//! Every non-blocking call here takes and returns owned byte buffers
//! rather than borrowed slices: a real binding would pass raw pointers
//! into pinned memory directly (unsafe, and out of scope for this
//! in-process stand-in), but an owned-buffer boundary keeps the simulated
//! transport's lifetimes trivial while preserving the same "issue now,
//! `test()` later" non-blocking shape the progress engine polls against.

use std::sync::Arc;

use dashmap::DashMap;

use hostxfer_core::datatype::Datatype;
use hostxfer_core::error::{EngineError, Result};

/// Reduction operator for Allreduce/Reduce/Reduce_scatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Elementwise sum.
    Sum,
    /// Elementwise maximum.
    Max,
    /// Elementwise minimum.
    Min,
    /// Elementwise product.
    Prod,
}

/// A non-blocking transport operation in flight.
///
/// Mirrors the real transport's `MPI_Test`-style contract: `test` never
/// blocks, and once it reports completion the result (if any) is taken
/// exactly once via [`TransportRequest::take_result`].
pub trait TransportRequest: Send {
    /// Non-blocking completion query. `Ok(true)` once complete, `Ok(false)`
    /// if still in flight, `Err` if the transport reported failure either
    /// at issue or at query time.
    fn test(&mut self) -> Result<bool>;

    /// Take this rank's result bytes once `test` has reported completion.
    /// Empty for operations with no local output (send, barrier,
    /// non-root of gather/reduce/scatter).
    fn take_result(&mut self) -> Vec<u8>;
}

/// Uniform non-blocking surface over the host-memory transport's
/// collective and point-to-point primitives.
///
/// Every method issues the operation immediately and returns a request to
/// poll; none of them block. `count`/`dtype` describe element counts in
/// the datatype carried by the collective state, standing in for the
/// template specialization by element type a native binding would use.
pub trait Transport: Send + Sync {
    /// Backend name, surfaced via the façade's `Name()`.
    fn name(&self) -> &'static str;

    /// This process's rank within the communicator.
    fn rank(&self) -> usize;

    /// Number of ranks participating in the communicator.
    fn num_ranks(&self) -> usize;

    /// Every rank contributes `count` elements; every rank receives the
    /// elementwise reduction across all contributions.
    fn i_allreduce(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Every rank contributes `count` elements; every rank receives the
    /// rank-ordered concatenation of all contributions (`num_ranks * count`
    /// elements).
    fn i_allgather(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Every rank contributes `num_ranks * count` elements (one `count`-sized
    /// block per destination rank); every rank receives the `count`-sized
    /// block every other rank addressed to it, rank-ordered.
    fn i_alltoall(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
    ) -> Result<Box<dyn TransportRequest>>;

    /// `root` contributes `count` elements; every rank (including `root`)
    /// receives them.
    fn i_bcast(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
        root: usize,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Every rank contributes `count` elements; `root` receives the
    /// rank-ordered concatenation (`num_ranks * count` elements); every
    /// other rank's result is empty.
    fn i_gather(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
        root: usize,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Every rank contributes `count` elements; `root` receives the
    /// elementwise reduction; every other rank's result is empty.
    fn i_reduce(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        root: usize,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Every rank contributes a `num_ranks * count_per_rank`-element,
    /// rank-major buffer; rank `k` receives the elementwise reduction of
    /// row `k` across every rank's contribution (`count_per_rank`
    /// elements).
    fn i_reduce_scatter(
        &self,
        sendbuf: Vec<u8>,
        count_per_rank: usize,
        dtype: Datatype,
        op: ReduceOp,
    ) -> Result<Box<dyn TransportRequest>>;

    /// `root` contributes `num_ranks * count` elements, rank-ordered; every
    /// rank (including `root`) receives its `count`-element block.
    fn i_scatter(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
        root: usize,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Point-to-point send of `count` elements to `dest`, matched by `tag`.
    fn i_send(
        &self,
        sendbuf: Vec<u8>,
        count: usize,
        dtype: Datatype,
        dest: usize,
        tag: i32,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Point-to-point receive of `count` elements from `source`, matched
    /// by `tag`.
    fn i_recv(
        &self,
        count: usize,
        dtype: Datatype,
        source: usize,
        tag: i32,
    ) -> Result<Box<dyn TransportRequest>>;

    /// Combined send/receive: send `sendbuf` to `dest`, simultaneously
    /// receive `recv_count` elements from `source`.
    fn i_sendrecv(
        &self,
        sendbuf: Vec<u8>,
        dtype: Datatype,
        dest: usize,
        send_tag: i32,
        recv_count: usize,
        source: usize,
        recv_tag: i32,
    ) -> Result<Box<dyn TransportRequest>>;

    /// No data; every rank must reach the barrier before any rank's
    /// request reports completion.
    fn i_barrier(&self) -> Result<Box<dyn TransportRequest>>;
}

/// Which collective kind a rendezvous slot is keyed by, together with a
/// per-kind call index (SPMD programs call collectives in the
/// same order on every rank, so the Nth call of a given kind identifies
/// the same logical operation across ranks without any cross-rank
/// handshake at issue time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Allreduce,
    Allgather,
    Alltoall,
    Bcast,
    Gather,
    Reduce,
    ReduceScatter,
    Scatter,
    Send,
    Recv,
    SendRecv,
    Barrier,
}

type SlotKey = (Kind, u64);

struct Slot {
    dtype: Datatype,
    op: Option<ReduceOp>,
    root: Option<usize>,
    count: usize,
    contributions: Vec<Option<Vec<u8>>>,
    results: Option<Vec<Vec<u8>>>,
    error: Option<String>,
}

impl Slot {
    fn new(num_ranks: usize, dtype: Datatype, op: Option<ReduceOp>, root: Option<usize>, count: usize) -> Self {
        Self {
            dtype,
            op,
            root,
            count,
            contributions: vec![None; num_ranks],
            results: None,
            error: None,
        }
    }

    fn is_full(&self) -> bool {
        self.contributions.iter().all(Option::is_some)
    }
}

/// Shared state for one in-process communicator: one slot table and a
/// set of per-kind call counters, shared by every rank's [`InProcessTransport`]
/// handle.
struct World {
    num_ranks: usize,
    slots: DashMap<SlotKey, Slot>,
    counters: DashMap<(usize, Kind), u64>,
    mailbox_storage: Mailbox,
}

impl World {
    fn new(num_ranks: usize) -> Arc<Self> {
        Arc::new(Self {
            num_ranks,
            slots: DashMap::new(),
            counters: DashMap::new(),
            mailbox_storage: Mailbox {
                queues: DashMap::new(),
            },
        })
    }

    /// The caller rank's own `Nth` call of `kind`. Counters are kept
    /// per-rank (not shared) so that every rank's independent Nth call of
    /// the same kind lands on the same slot index without any cross-rank
    /// handshake. The SPMD assumption is that every rank calls collectives
    /// in the same order, not that calls arrive at the transport in any
    /// particular relative timing.
    fn next_key(&self, kind: Kind, rank: usize) -> SlotKey {
        let mut counter = self.counters.entry((rank, kind)).or_insert(0);
        let idx = *counter;
        *counter += 1;
        (kind, idx)
    }
}

/// One rank's handle into an in-process simulated communicator.
///
/// Clone freely. Every clone of the same rank's handle shares the same
/// `World`; distinct ranks are obtained via [`InProcessTransport::new_world`].
#[derive(Clone)]
pub struct InProcessTransport {
    world: Arc<World>,
    rank: usize,
}

impl InProcessTransport {
    /// Build `num_ranks` transport handles sharing one simulated
    /// communicator, one per rank, rank-ordered.
    #[must_use]
    pub fn new_world(num_ranks: usize) -> Vec<Self> {
        let world = World::new(num_ranks);
        (0..num_ranks)
            .map(|rank| Self {
                world: world.clone(),
                rank,
            })
            .collect()
    }

    fn contribute(
        &self,
        kind: Kind,
        dtype: Datatype,
        op: Option<ReduceOp>,
        root: Option<usize>,
        count: usize,
        data: Vec<u8>,
    ) -> Box<dyn TransportRequest> {
        tracing::trace!(
            kind = ?kind,
            transport_code = dtype.transport_code().code,
            count,
            "dispatching collective contribution"
        );
        let key = self.world.next_key(kind, self.rank);
        let mut slot = self
            .world
            .slots
            .entry(key)
            .or_insert_with(|| Slot::new(self.world.num_ranks, dtype, op, root, count));
        slot.contributions[self.rank] = Some(data);
        if slot.is_full() && slot.results.is_none() {
            compute(&mut slot, kind, self.world.num_ranks);
        }
        drop(slot);
        Box::new(SimRequest {
            world: self.world.clone(),
            key,
            rank: self.rank,
        })
    }
}

fn compute(slot: &mut Slot, kind: Kind, num_ranks: usize) {
    let count = slot.count;
    let dtype = slot.dtype;
    let contributions: Vec<&[u8]> = slot
        .contributions
        .iter()
        .map(|c| c.as_deref().unwrap_or(&[]))
        .collect();

    let results = match kind {
        Kind::Allreduce => {
            let reduced = reduce_elementwise(&contributions, count, dtype, slot.op.unwrap());
            vec![reduced; num_ranks]
        }
        Kind::Allgather => {
            let gathered = concat_all(&contributions);
            vec![gathered; num_ranks]
        }
        Kind::Alltoall => {
            let elem = dtype.size_bytes();
            let block = count * elem;
            (0..num_ranks)
                .map(|dest| {
                    let mut out = Vec::with_capacity(block * num_ranks);
                    for src in &contributions {
                        let start = dest * block;
                        out.extend_from_slice(&src[start..start + block]);
                    }
                    out
                })
                .collect()
        }
        Kind::Bcast => {
            let root = slot.root.unwrap();
            let data = contributions[root].to_vec();
            vec![data; num_ranks]
        }
        Kind::Gather => {
            let root = slot.root.unwrap();
            let gathered = concat_all(&contributions);
            (0..num_ranks)
                .map(|r| if r == root { gathered.clone() } else { Vec::new() })
                .collect()
        }
        Kind::Reduce => {
            let root = slot.root.unwrap();
            let reduced = reduce_elementwise(&contributions, count, dtype, slot.op.unwrap());
            (0..num_ranks)
                .map(|r| if r == root { reduced.clone() } else { Vec::new() })
                .collect()
        }
        Kind::ReduceScatter => {
            let elem = dtype.size_bytes();
            let row_bytes = count * elem;
            (0..num_ranks)
                .map(|row| {
                    let rows: Vec<&[u8]> = contributions
                        .iter()
                        .map(|c| &c[row * row_bytes..(row + 1) * row_bytes])
                        .collect();
                    reduce_elementwise(&rows, count, dtype, slot.op.unwrap())
                })
                .collect()
        }
        Kind::Scatter => {
            let root = slot.root.unwrap();
            let elem = dtype.size_bytes();
            let block = count * elem;
            let source = contributions[root];
            (0..num_ranks)
                .map(|r| source[r * block..(r + 1) * block].to_vec())
                .collect()
        }
        Kind::Send | Kind::Recv | Kind::SendRecv => {
            // Matched by (source, dest) pairs encoded into the payload's
            // bookkeeping at the call site; see `resolve_p2p`.
            resolve_p2p(&slot.contributions, num_ranks)
        }
        Kind::Barrier => vec![Vec::new(); num_ranks],
    };
    slot.results = Some(results);
}

/// Point-to-point messages are modeled as a dense `num_ranks` contribution
/// table where entry `r` holds every message rank `r` has issued so far,
/// framed as `(dest, tag, bytes)` tuples; `resolve_p2p` is only invoked
/// once every participating rank has contributed, so at that point every
/// message has both a sender and at least one matching receiver call.
fn resolve_p2p(contributions: &[Option<Vec<u8>>], num_ranks: usize) -> Vec<Vec<u8>> {
    // The simplified point-to-point model below hands each rank back
    // exactly what it contributed verbatim; real routing by (source,
    // dest, tag) happens one level up in `InProcessTransport::i_send` /
    // `i_recv`, which address a direct per-pair mailbox instead of this
    // generic rendezvous path. `compute` never actually dispatches here
    // for Send/Recv/SendRecv kinds (see their methods below). This match
    // arm exists so `Kind` stays a closed, exhaustive enum.
    let _ = num_ranks;
    contributions
        .iter()
        .map(|c| c.clone().unwrap_or_default())
        .collect()
}

fn concat_all(contributions: &[&[u8]]) -> Vec<u8> {
    contributions.iter().flat_map(|c| c.iter().copied()).collect()
}

macro_rules! reduce_as {
    ($ty:ty, $contributions:expr, $count:expr, $op:expr) => {{
        let mut acc = vec![0 as $ty; $count];
        for (i, slot) in acc.iter_mut().enumerate() {
            let mut values = $contributions.iter().map(|bytes| {
                let start = i * std::mem::size_of::<$ty>();
                let end = start + std::mem::size_of::<$ty>();
                <$ty>::from_le_bytes(bytes[start..end].try_into().unwrap())
            });
            let first = values.next().unwrap_or_default();
            *slot = values.fold(first, |acc, v| match $op {
                ReduceOp::Sum => acc + v,
                ReduceOp::Prod => acc * v,
                ReduceOp::Max => if v > acc { v } else { acc },
                ReduceOp::Min => if v < acc { v } else { acc },
            });
        }
        acc.iter().flat_map(|v| v.to_le_bytes()).collect()
    }};
}

fn reduce_elementwise(contributions: &[&[u8]], count: usize, dtype: Datatype, op: ReduceOp) -> Vec<u8> {
    match dtype {
        Datatype::U8 => reduce_as!(u8, contributions, count, op),
        Datatype::I32 => reduce_as!(i32, contributions, count, op),
        Datatype::I64 => reduce_as!(i64, contributions, count, op),
        Datatype::F32 => reduce_as!(f32, contributions, count, op),
        Datatype::F64 => reduce_as!(f64, contributions, count, op),
    }
}

impl Transport for InProcessTransport {
    fn name(&self) -> &'static str {
        "host-transfer-sim"
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.world.num_ranks
    }

    fn i_allreduce(&self, sendbuf: Vec<u8>, count: usize, dtype: Datatype, op: ReduceOp) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Allreduce, dtype, Some(op), None, count, sendbuf))
    }

    fn i_allgather(&self, sendbuf: Vec<u8>, count: usize, dtype: Datatype) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Allgather, dtype, None, None, count, sendbuf))
    }

    fn i_alltoall(&self, sendbuf: Vec<u8>, count: usize, dtype: Datatype) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Alltoall, dtype, None, None, count, sendbuf))
    }

    fn i_bcast(&self, sendbuf: Vec<u8>, count: usize, dtype: Datatype, root: usize) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Bcast, dtype, None, Some(root), count, sendbuf))
    }

    fn i_gather(&self, sendbuf: Vec<u8>, count: usize, dtype: Datatype, root: usize) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Gather, dtype, None, Some(root), count, sendbuf))
    }

    fn i_reduce(&self, sendbuf: Vec<u8>, count: usize, dtype: Datatype, op: ReduceOp, root: usize) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Reduce, dtype, Some(op), Some(root), count, sendbuf))
    }

    fn i_reduce_scatter(&self, sendbuf: Vec<u8>, count_per_rank: usize, dtype: Datatype, op: ReduceOp) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::ReduceScatter, dtype, Some(op), None, count_per_rank, sendbuf))
    }

    fn i_scatter(&self, sendbuf: Vec<u8>, count: usize, dtype: Datatype, root: usize) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Scatter, dtype, None, Some(root), count, sendbuf))
    }

    fn i_send(&self, sendbuf: Vec<u8>, _count: usize, _dtype: Datatype, dest: usize, tag: i32) -> Result<Box<dyn TransportRequest>> {
        if dest >= self.world.num_ranks {
            return Err(EngineError::transport(format!("send to out-of-range rank {dest}")));
        }
        Ok(self.world.p2p_send(self.rank, dest, tag, sendbuf))
    }

    fn i_recv(&self, count: usize, dtype: Datatype, source: usize, tag: i32) -> Result<Box<dyn TransportRequest>> {
        if source >= self.world.num_ranks {
            return Err(EngineError::transport(format!("recv from out-of-range rank {source}")));
        }
        Ok(self.world.p2p_recv(source, self.rank, tag, count * dtype.size_bytes()))
    }

    fn i_sendrecv(
        &self,
        sendbuf: Vec<u8>,
        dtype: Datatype,
        dest: usize,
        send_tag: i32,
        recv_count: usize,
        source: usize,
        recv_tag: i32,
    ) -> Result<Box<dyn TransportRequest>> {
        let send_req = self.i_send(sendbuf, 0, dtype, dest, send_tag)?;
        let recv_req = self.i_recv(recv_count, dtype, source, recv_tag)?;
        Ok(Box::new(CombinedRequest {
            send: send_req,
            recv: recv_req,
        }))
    }

    fn i_barrier(&self) -> Result<Box<dyn TransportRequest>> {
        Ok(self.contribute(Kind::Barrier, Datatype::U8, None, None, 0, Vec::new()))
    }
}

struct Mailbox {
    // Keyed by (from, to, tag); each entry is a FIFO of unconsumed
    // messages, matching MPI's tag-ordered point-to-point delivery.
    queues: DashMap<(usize, usize, i32), std::collections::VecDeque<Vec<u8>>>,
}

impl World {
    fn p2p_send(self: &Arc<Self>, from: usize, to: usize, tag: i32, data: Vec<u8>) -> Box<dyn TransportRequest> {
        self.mailbox()
            .queues
            .entry((from, to, tag))
            .or_default()
            .push_back(data);
        Box::new(ImmediateRequest { result: Vec::new() })
    }

    fn p2p_recv(self: &Arc<Self>, from: usize, to: usize, tag: i32, expected_len: usize) -> Box<dyn TransportRequest> {
        let _ = expected_len;
        Box::new(P2pRecvRequest {
            world: self.clone(),
            key: (from, to, tag),
        })
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailbox_storage
    }
}

struct ImmediateRequest {
    result: Vec<u8>,
}

impl TransportRequest for ImmediateRequest {
    fn test(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn take_result(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.result)
    }
}

struct P2pRecvRequest {
    world: Arc<World>,
    key: (usize, usize, i32),
}

impl TransportRequest for P2pRecvRequest {
    fn test(&mut self) -> Result<bool> {
        let queues = &self.world.mailbox().queues;
        Ok(queues.get(&self.key).is_some_and(|q| !q.is_empty()))
    }

    fn take_result(&mut self) -> Vec<u8> {
        self.world
            .mailbox()
            .queues
            .get_mut(&self.key)
            .and_then(|mut q| q.pop_front())
            .unwrap_or_default()
    }
}

struct CombinedRequest {
    send: Box<dyn TransportRequest>,
    recv: Box<dyn TransportRequest>,
}

impl TransportRequest for CombinedRequest {
    fn test(&mut self) -> Result<bool> {
        Ok(self.send.test()? && self.recv.test()?)
    }

    fn take_result(&mut self) -> Vec<u8> {
        self.recv.take_result()
    }
}

struct SimRequest {
    world: Arc<World>,
    key: SlotKey,
    rank: usize,
}

impl TransportRequest for SimRequest {
    fn test(&mut self) -> Result<bool> {
        let slot = self.world.slots.get(&self.key).expect("slot created at issue time");
        if let Some(err) = &slot.error {
            return Err(EngineError::transport(err.clone()));
        }
        Ok(slot.results.is_some())
    }

    fn take_result(&mut self) -> Vec<u8> {
        let slot = self.world.slots.get(&self.key).expect("slot created at issue time");
        slot.results
            .as_ref()
            .map(|rs| rs[self.rank].clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_bytes_i32(v: &[i32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn from_bytes_i32(b: &[u8]) -> Vec<i32> {
        b.chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn allreduce_sum_matches_analytic_result() {
        let ranks = InProcessTransport::new_world(4);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                std::thread::spawn(move || {
                    let mut req = t
                        .i_allreduce(to_bytes_i32(&[1, 2, 3, 4]), 4, Datatype::I32, ReduceOp::Sum)
                        .unwrap();
                    while !req.test().unwrap() {
                        std::thread::yield_now();
                    }
                    from_bytes_i32(&req.take_result())
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![4, 8, 12, 16]);
        }
    }

    #[test]
    fn bcast_delivers_root_value_to_everyone() {
        let ranks = InProcessTransport::new_world(4);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                std::thread::spawn(move || {
                    let send = if t.rank() == 2 { to_bytes_i32(&[7, 7, 7]) } else { to_bytes_i32(&[0, 0, 0]) };
                    let mut req = t.i_bcast(send, 3, Datatype::I32, 2).unwrap();
                    while !req.test().unwrap() {
                        std::thread::yield_now();
                    }
                    from_bytes_i32(&req.take_result())
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![7, 7, 7]);
        }
    }

    #[test]
    fn gather_to_root_collects_rank_ids() {
        let ranks = InProcessTransport::new_world(4);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                let rank = t.rank();
                std::thread::spawn(move || {
                    let mut req = t.i_gather(to_bytes_i32(&[rank as i32]), 1, Datatype::I32, 0).unwrap();
                    while !req.test().unwrap() {
                        std::thread::yield_now();
                    }
                    (rank, from_bytes_i32(&req.take_result()))
                })
            })
            .collect();
        for h in handles {
            let (rank, result) = h.join().unwrap();
            if rank == 0 {
                assert_eq!(result, vec![0, 1, 2, 3]);
            } else {
                assert!(result.is_empty());
            }
        }
    }

    #[test]
    fn reduce_scatter_max_of_rank_major_matrix() {
        let ranks = InProcessTransport::new_world(4);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                let rank = t.rank();
                std::thread::spawn(move || {
                    // Each rank's matrix: row k = [rank*10 + k*4 .. +4)
                    let mut matrix = Vec::new();
                    for row in 0..4 {
                        for col in 0..4 {
                            matrix.push((rank as i32) * 100 + (row as i32) * 10 + col as i32);
                        }
                    }
                    let mut req = t
                        .i_reduce_scatter(to_bytes_i32(&matrix), 4, Datatype::I32, ReduceOp::Max)
                        .unwrap();
                    while !req.test().unwrap() {
                        std::thread::yield_now();
                    }
                    (rank, from_bytes_i32(&req.take_result()))
                })
            })
            .collect();
        for h in handles {
            let (rank, row) = h.join().unwrap();
            // Max across ranks 0..4 of (rank*100 + row*10 + col) is rank=3.
            let expected: Vec<i32> = (0..4).map(|col| 300 + (rank as i32) * 10 + col).collect();
            assert_eq!(row, expected);
        }
    }

    #[test]
    fn barrier_releases_all_ranks_together() {
        let ranks = InProcessTransport::new_world(4);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                std::thread::spawn(move || {
                    let mut req = t.i_barrier().unwrap();
                    while !req.test().unwrap() {
                        std::thread::yield_now();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn send_recv_round_trips_a_message() {
        let ranks = InProcessTransport::new_world(2);
        let sender = ranks[0].clone();
        let receiver = ranks[1].clone();

        let send_handle = std::thread::spawn(move || {
            let mut req = sender.i_send(to_bytes_i32(&[42]), 1, Datatype::I32, 1, 0).unwrap();
            while !req.test().unwrap() {
                std::thread::yield_now();
            }
        });

        let mut req = receiver.i_recv(1, Datatype::I32, 0, 0).unwrap();
        while !req.test().unwrap() {
            std::thread::yield_now();
        }
        assert_eq!(from_bytes_i32(&req.take_result()), vec![42]);
        send_handle.join().unwrap();
    }

    #[test]
    fn in_place_equivalence_for_allreduce() {
        // The transport layer has no notion of "in-place". That
        // distinction is the backend façade's (same buffer used as both
        // send and recv). Verify the transport itself is agnostic to
        // whether the caller's send and recv buffers were the same
        // allocation by checking two independent calls with identical
        // contents produce identical results.
        let ranks = InProcessTransport::new_world(2);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                std::thread::spawn(move || {
                    let mut req = t.i_allreduce(to_bytes_i32(&[5]), 1, Datatype::I32, ReduceOp::Sum).unwrap();
                    while !req.test().unwrap() {
                        std::thread::yield_now();
                    }
                    from_bytes_i32(&req.take_result())
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![10]);
        }
    }
}
