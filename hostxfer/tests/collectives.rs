//! End-to-end scenarios driving the backend façade across a simulated
//! multi-rank world, one thread per rank.

use std::sync::Arc;

use hostxfer::algorithm::{Algorithm, AllreduceAlgorithm};
use hostxfer::backend::HostTransferBackend;
use hostxfer::device::{SharedDeviceBuffer, SimDeviceStream};
use hostxfer::transport::{InProcessTransport, ReduceOp};
use hostxfer_core::datatype::Datatype;
use hostxfer_core::options::EngineOptions;

fn world(n: usize) -> Vec<HostTransferBackend> {
    let _ = tracing_subscriber::fmt::try_init();
    InProcessTransport::new_world(n)
        .into_iter()
        .map(|t| HostTransferBackend::new(Arc::new(t), &EngineOptions::default()).unwrap())
        .collect()
}

fn i32_values(bytes: &[u8]) -> Vec<i32> {
    bytes.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
}

#[test]
fn allreduce_sums_across_four_values() {
    let backends = world(4);
    let handles: Vec<_> = backends
        .into_iter()
        .enumerate()
        .map(|(rank, backend)| {
            std::thread::spawn(move || {
                let stream = SimDeviceStream::new(false);
                let data = [1i32 + rank as i32, 2, 3, 4];
                let buf = SharedDeviceBuffer::from_elements(&data);
                backend.allreduce(&buf, 4, Datatype::I32, ReduceOp::Sum, AllreduceAlgorithm::Automatic, &stream).unwrap();
                i32_values(&buf.to_bytes())
            })
        })
        .collect();

    let expected = vec![1 + 2 + 3 + 4, 8, 12, 16];
    for h in handles {
        assert_eq!(h.join().unwrap(), expected);
    }
}

#[test]
fn broadcast_from_non_zero_root_reaches_every_rank() {
    let backends = world(3);
    let handles: Vec<_> = backends
        .into_iter()
        .map(|backend| {
            std::thread::spawn(move || {
                let stream = SimDeviceStream::new(false);
                let buf = if backend.rank() == 2 {
                    SharedDeviceBuffer::from_elements(&[7i32, 7, 7])
                } else {
                    SharedDeviceBuffer::zeroed(Datatype::I32, 3)
                };
                backend.bcast(&buf, 3, Datatype::I32, 2, Algorithm::Automatic, &stream).unwrap();
                i32_values(&buf.to_bytes())
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), vec![7, 7, 7]);
    }
}

#[test]
fn gather_to_root_zero_collects_rank_ids_in_order() {
    let backends = world(4);
    let handles: Vec<_> = backends
        .into_iter()
        .map(|backend| {
            std::thread::spawn(move || {
                let stream = SimDeviceStream::new(false);
                let rank = backend.rank() as i32;
                let buf = if backend.rank() == 0 {
                    let b = SharedDeviceBuffer::zeroed(Datatype::I32, 4);
                    b.set_bytes(&rank.to_le_bytes());
                    b
                } else {
                    SharedDeviceBuffer::from_elements(&[rank])
                };
                backend.gather(&buf, 1, Datatype::I32, 0, Algorithm::Automatic, &stream).unwrap();
                (backend.rank(), buf.to_bytes())
            })
        })
        .collect();

    for h in handles {
        let (rank, bytes) = h.join().unwrap();
        if rank == 0 {
            assert_eq!(i32_values(&bytes), vec![0, 1, 2, 3]);
        }
    }
}

#[test]
fn reduce_scatter_max_of_rank_major_matrix() {
    // Each rank i contributes row [i, i+1, i+2, i+3]; reduce-scatter with
    // Max over 4 ranks, so rank r's output element is max(0..4) + r = 3 + r.
    let backends = world(4);
    let handles: Vec<_> = backends
        .into_iter()
        .map(|backend| {
            std::thread::spawn(move || {
                let rank = backend.rank() as i32;
                let stream = SimDeviceStream::new(false);
                let row: Vec<i32> = (0..4).map(|j| rank + j).collect();
                let buf = SharedDeviceBuffer::from_elements(&row);
                backend.reduce_scatter(&buf, 1, Datatype::I32, ReduceOp::Max, Algorithm::Automatic, &stream).unwrap();
                (backend.rank(), i32_values(&buf.to_bytes()))
            })
        })
        .collect();

    for h in handles {
        let (rank, values) = h.join().unwrap();
        assert_eq!(values, vec![3 + rank as i32]);
    }
}

#[test]
fn barrier_on_four_ranks_rendezvous_before_any_log_append() {
    // Every rank non-blockingly waits at the barrier, then appends its rank
    // id to a shared log only after the request completes. If the barrier
    // did not actually synchronize, a rank could append before some other
    // rank had even issued its barrier call.
    let backends = world(4);
    let log: Arc<std::sync::Mutex<Vec<usize>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let started = Arc::new(std::sync::Barrier::new(4));

    let handles: Vec<_> = backends
        .into_iter()
        .map(|backend| {
            let log = log.clone();
            let started = started.clone();
            std::thread::spawn(move || {
                let stream = SimDeviceStream::new(false);
                started.wait();
                let mut req = backend.i_barrier(Arc::new(stream)).unwrap();
                while !hostxfer::request::test(&mut req).unwrap() {
                    std::thread::yield_now();
                }
                log.lock().unwrap().push(backend.rank());
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let mut ranks = log.lock().unwrap().clone();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![0, 1, 2, 3]);
}

#[test]
fn pipelined_allreduce_on_one_stream_completes_every_request() {
    // Issue 100 non-blocking allreduces back to back on the same stream
    // without waiting between them, then drain every request. Bounded host
    // issue time means this loop returns promptly regardless of whether the
    // transport has actually progressed any of them yet.
    let backends = world(2);
    let handles: Vec<_> = backends
        .into_iter()
        .map(|backend| {
            std::thread::spawn(move || {
                let stream = SimDeviceStream::new(false);
                let buf = SharedDeviceBuffer::from_elements(&[1i32]);
                let mut reqs = Vec::with_capacity(100);
                for _ in 0..100 {
                    let user_stream: Arc<dyn hostxfer::device::DeviceStream> = Arc::new(stream.clone());
                    reqs.push(backend.i_allreduce(&buf, 1, Datatype::I32, ReduceOp::Sum, AllreduceAlgorithm::Automatic, user_stream).unwrap());
                }
                for mut req in reqs {
                    while !hostxfer::request::test(&mut req).unwrap() {
                        std::thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
