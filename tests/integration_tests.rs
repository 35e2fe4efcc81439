use std::sync::Arc;
use std::thread;
use std::time::Duration;

use xccl_coordinator::distributed::{
    AllreduceOptions, BarrierOptions, BroadcastOptions, CclBackend, CommType, DataType,
    DenseTensor, DeviceRuntime, InMemoryStore, Place, ProcessGroupCustom, ReduceOp,
    ReduceOptions, SimulatedBackend, SimulatedFabric, Store, WAIT_FOREVER,
};
use xccl_coordinator::utils::config::XcclConfig;
use xccl_coordinator::utils::error::XcclError;

const DEV: &str = "custom_cpu";

type Group = ProcessGroupCustom<SimulatedBackend>;

fn test_config() -> XcclConfig {
    XcclConfig {
        wait_poll_interval_ms: 1,
        default_wait_timeout_ms: 10_000,
        ..XcclConfig::default()
    }
}

/// A simulated job: one interconnect and one rendezvous store shared by all ranks.
struct Cluster {
    fabric: Arc<SimulatedFabric>,
    store: Arc<InMemoryStore>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            fabric: SimulatedFabric::new(),
            store: Arc::new(InMemoryStore::new()),
        }
    }

    fn group(&self, rank: usize, world_size: usize, devices: usize, config: XcclConfig) -> Group {
        let backend = Arc::new(self.fabric.backend(DEV, devices));
        let store: Arc<dyn Store> = self.store.clone();
        ProcessGroupCustom::new(store, backend, rank, world_size, 0, config).unwrap()
    }

    /// Runs `f` on one thread per rank and returns the results in rank order.
    fn run<T, F>(&self, world_size: usize, devices: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(Group) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let pg = self.group(rank, world_size, devices, test_config());
                let f = Arc::clone(&f);
                thread::spawn(move || f(pg))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }
}

fn place(id: usize) -> Place {
    Place::new(DEV, id)
}

#[test]
fn test_all_reduce_sum_across_four_ranks() {
    let cluster = Cluster::new();
    let results = cluster.run(4, 1, |pg| {
        let t = DenseTensor::from_vec(place(0), vec![pg.rank() as f32 + 1.0], &[1]).unwrap();
        let task = pg
            .all_reduce(&t, &t, &AllreduceOptions::default(), true, false)
            .unwrap();
        assert!(task.wait(WAIT_FOREVER).unwrap());
        assert_eq!(task.comm_type(), CommType::AllReduce);
        t.to_vec::<f32>().unwrap()
    });
    for r in results {
        assert_eq!(r, vec![10.0]);
    }
    assert!(cluster.store.contains("ProcessGroupCustom/ccl_ids/0/0"));
    assert_eq!(cluster.fabric.unique_ids_generated(), 1);
    assert_eq!(cluster.fabric.communicators_created(), 4);
}

#[test]
fn test_send_recv_int64() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 1, |pg| {
        if pg.rank() == 0 {
            let t = DenseTensor::from_vec(place(0), vec![7i64, 8, 9], &[3]).unwrap();
            let task = pg.send(&t, 1, 0, 0, true, false).unwrap();
            task.synchronize().unwrap();
            assert_eq!(task.comm_type(), CommType::Send);
            t.to_vec::<i64>().unwrap()
        } else {
            let t = DenseTensor::zeros(place(0), DataType::Int64, &[3]);
            let task = pg.recv(&t, 0, 0, 0, true, false).unwrap();
            task.synchronize().unwrap();
            assert_eq!(task.outputs().len(), 1);
            t.to_vec::<i64>().unwrap()
        }
    });
    assert_eq!(results[1], vec![7, 8, 9]);
}

#[test]
fn test_partial_send_recv_windows() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 1, |pg| {
        if pg.rank() == 0 {
            let t = DenseTensor::from_vec(place(0), vec![1.0f64, 2.0, 3.0, 4.0], &[4]).unwrap();
            pg.send(&t, 1, 1, 2, true, false).unwrap().synchronize().unwrap();
            t.to_vec::<f64>().unwrap()
        } else {
            let t = DenseTensor::zeros(place(0), DataType::Float64, &[4]);
            pg.recv(&t, 0, 2, 2, true, false).unwrap().synchronize().unwrap();
            t.to_vec::<f64>().unwrap()
        }
    });
    assert_eq!(results[0], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(results[1], vec![0.0, 0.0, 2.0, 3.0]);
}

#[test]
fn test_rejected_barrier_does_not_break_the_next_one() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 1, |pg| {
        let err = pg.barrier(&BarrierOptions::on_device(5)).unwrap_err();
        assert!(matches!(err, XcclError::PreconditionNotMet(_)));
        assert!(pg.cache().is_empty());

        let task = pg.barrier(&BarrierOptions::on_device(0)).unwrap();
        task.wait(Duration::from_secs(5)).unwrap()
    });
    assert_eq!(results, vec![true, true]);
    assert!(cluster.store.contains("ProcessGroupCustom/ccl_ids/0/0"));
    assert!(!cluster.store.contains("ProcessGroupCustom/ccl_ids/0/1"));
    assert_eq!(cluster.fabric.unique_ids_generated(), 1);
}

#[test]
fn test_mismatched_all_reduce_fails_every_rank() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 1, |pg| {
        let t = DenseTensor::from_vec(place(0), vec![1.0f32; 2 + pg.rank()], &[2 + pg.rank()]).unwrap();
        let task = pg
            .all_reduce(&t, &t, &AllreduceOptions::default(), true, false)
            .unwrap();
        let err = task.synchronize().unwrap_err();
        (matches!(err, XcclError::Communication(_)), t.to_vec::<f32>().unwrap())
    });
    assert!(results[0].0 && results[1].0);
    assert_eq!(results[0].1, vec![1.0; 2]);
    assert_eq!(results[1].1, vec![1.0; 3]);
}

#[test]
fn test_oversized_message_fails_the_receiver() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 1, |pg| {
        if pg.rank() == 0 {
            let t = DenseTensor::from_vec(place(0), vec![7i64, 8, 9], &[3]).unwrap();
            pg.send(&t, 1, 0, 0, true, false).unwrap().synchronize().is_ok()
        } else {
            let t = DenseTensor::zeros(place(0), DataType::Int64, &[2]);
            let err = pg.recv(&t, 0, 0, 0, true, false).unwrap().synchronize().unwrap_err();
            assert_eq!(t.to_vec::<i64>().unwrap(), vec![0, 0]);
            matches!(err, XcclError::Communication(_))
        }
    });
    assert!(results[1]);
}

#[test]
fn test_barrier_without_prior_collectives() {
    let cluster = Cluster::new();
    let results = cluster.run(3, 1, |pg| {
        assert!(pg.cache().is_empty());
        let task = pg.barrier(&BarrierOptions::on_device(0)).unwrap();
        task.synchronize().unwrap();
        (task.is_completed().unwrap(), task.comm_type(), task.barrier_tensor().is_some())
    });
    for (completed, comm_type, has_tensor) in results {
        assert!(completed);
        assert_eq!(comm_type, CommType::Barrier);
        assert!(has_tensor);
    }
}

#[test]
fn test_all_gather_rejects_wrong_output_size() {
    let cluster = Cluster::new();
    let pg = cluster.group(0, 4, 1, test_config());
    let input = DenseTensor::zeros(place(0), DataType::Float32, &[5]);
    let out = DenseTensor::zeros(place(0), DataType::Float32, &[15]);

    let err = pg.all_gather(&out, &input, 0, 0, true, false).unwrap_err();
    assert!(matches!(err, XcclError::InvalidArgument(_)));
    assert!(pg.cache().is_empty());
    assert!(cluster.store.is_empty());
    assert_eq!(cluster.fabric.communicators_created(), 0);
}

#[test]
fn test_all_gather_rank_order_with_window() {
    let cluster = Cluster::new();
    let results = cluster.run(3, 1, |pg| {
        let r = pg.rank() as i32;
        let input = DenseTensor::from_vec(place(0), vec![-1, r, r * 10, -1], &[4]).unwrap();
        let out = DenseTensor::zeros(place(0), DataType::Int32, &[6]);
        pg.all_gather(&out, &input, 1, 2, true, false)
            .unwrap()
            .synchronize()
            .unwrap();
        out.to_vec::<i32>().unwrap()
    });
    for r in results {
        assert_eq!(r, vec![0, 0, 1, 10, 2, 20]);
    }
}

#[test]
fn test_concurrent_first_use_creates_one_communicator() {
    let cluster = Cluster::new();
    let pg = Arc::new(cluster.group(0, 1, 1, test_config()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pg = Arc::clone(&pg);
            thread::spawn(move || {
                let t = DenseTensor::from_vec(place(0), vec![i as f32], &[1]).unwrap();
                pg.all_reduce(&t, &t, &AllreduceOptions::default(), true, false)
                    .unwrap()
                    .synchronize()
                    .unwrap();
                t.to_vec::<f32>().unwrap()[0]
            })
        })
        .collect();
    for (i, h) in handles.into_iter().enumerate() {
        assert_eq!(h.join().unwrap(), i as f32);
    }

    assert_eq!(pg.cache().len(), 1);
    assert_eq!(cluster.fabric.communicators_created(), 1);
    assert_eq!(cluster.fabric.unique_ids_generated(), 1);
}

#[test]
fn test_completion_stays_latched() {
    let cluster = Cluster::new();
    let pg = cluster.group(0, 1, 1, test_config());
    let t = DenseTensor::from_vec(place(0), vec![1.0f32], &[1]).unwrap();
    let task = pg
        .all_reduce(&t, &t, &AllreduceOptions::default(), true, false)
        .unwrap();
    task.synchronize().unwrap();
    for _ in 0..100 {
        assert!(task.is_completed().unwrap());
    }
}

#[test]
fn test_back_to_back_collectives_keep_order() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 1, |pg| {
        let t = DenseTensor::from_vec(place(0), vec![1i64], &[1]).unwrap();
        let opts = AllreduceOptions::default();
        let first = pg.all_reduce(&t, &t, &opts, true, false).unwrap();
        let second = pg.all_reduce(&t, &t, &opts, true, false).unwrap();
        let max = DenseTensor::from_vec(place(0), vec![pg.rank() as i64 * 5], &[1]).unwrap();
        let third = pg
            .all_reduce(&max, &max, &AllreduceOptions::new(ReduceOp::Max), true, false)
            .unwrap();

        second.synchronize().unwrap();
        assert!(first.is_completed().unwrap());
        third.synchronize().unwrap();
        (t.to_vec::<i64>().unwrap(), max.to_vec::<i64>().unwrap())
    });
    for (sum, max) in results {
        assert_eq!(sum, vec![4]);
        assert_eq!(max, vec![5]);
    }
}

#[test]
fn test_broadcast_root_reads_input_others_write_output() {
    let cluster = Cluster::new();
    let root = 2;
    let results = cluster.run(3, 1, move |pg| {
        let r = pg.rank() as f32;
        let input = DenseTensor::from_vec(place(0), vec![r, r + 0.5], &[2]).unwrap();
        let out = DenseTensor::zeros(place(0), DataType::Float32, &[2]);
        let opts = BroadcastOptions {
            source_rank: root,
            source_root: 0,
        };
        pg.broadcast(&out, &input, &opts, true, false)
            .unwrap()
            .synchronize()
            .unwrap();
        (input.to_vec::<f32>().unwrap(), out.to_vec::<f32>().unwrap())
    });

    for (rank, (input, out)) in results.into_iter().enumerate() {
        assert_eq!(input, vec![rank as f32, rank as f32 + 0.5]);
        if rank == root {
            assert_eq!(out, vec![0.0, 0.0]);
        } else {
            assert_eq!(out, vec![2.0, 2.5]);
        }
    }
}

#[test]
fn test_reduce_writes_only_root() {
    let cluster = Cluster::new();
    let results = cluster.run(3, 1, |pg| {
        let input = DenseTensor::from_vec(place(0), vec![pg.rank() as i32 + 2], &[1]).unwrap();
        let out = DenseTensor::zeros(place(0), DataType::Int32, &[1]);
        let opts = ReduceOptions {
            reduce_op: ReduceOp::Prod,
            root_rank: 1,
        };
        let task = pg.reduce(&out, &input, &opts, true, false).unwrap();
        task.synchronize().unwrap();
        assert_eq!(task.comm_type(), CommType::Reduce);
        out.to_vec::<i32>().unwrap()
    });
    assert_eq!(results[0], vec![0]);
    assert_eq!(results[1], vec![24]);
    assert_eq!(results[2], vec![0]);
}

#[test]
fn test_calc_stream_dispatch() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 1, |pg| {
        let t = DenseTensor::from_vec(place(0), vec![3.0f32, 4.0], &[2]).unwrap();
        let task = pg
            .all_reduce(&t, &t, &AllreduceOptions::new(ReduceOp::Avg), true, true)
            .unwrap();
        assert!(task.is_completed().unwrap());

        let backend = pg.backend();
        let compute = backend.default_stream(&place(0)).unwrap();
        backend.synchronize_stream(&compute).unwrap();
        t.to_vec::<f32>().unwrap()
    });
    for r in results {
        assert_eq!(r, vec![3.0, 4.0]);
    }
}

#[test]
fn test_blocking_wait_returns_completed_task() {
    let cluster = Cluster::new();
    let config = XcclConfig {
        blocking_wait: true,
        ..test_config()
    };
    let pg = cluster.group(0, 1, 1, config);
    let t = DenseTensor::from_vec(place(0), vec![5u8], &[1]).unwrap();
    let task = pg
        .all_reduce(&t, &t, &AllreduceOptions::default(), true, false)
        .unwrap();
    assert!(task.is_completed().unwrap());
    assert_eq!(t.to_vec::<u8>().unwrap(), vec![5]);
}

#[test]
fn test_strict_wait_times_out_on_unanswered_recv() {
    let cluster = Cluster::new();
    let pg = cluster.group(0, 2, 1, test_config());
    let t = DenseTensor::zeros(place(0), DataType::Float32, &[1]);
    let task = pg.recv(&t, 1, 0, 0, true, false).unwrap();

    let err = task.wait(Duration::from_millis(30)).unwrap_err();
    assert!(matches!(err, XcclError::Timeout(_)));
    assert!(!task.is_completed().unwrap());
}

#[test]
fn test_multi_device_collectives() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 2, |pg| {
        let r = pg.rank() as f32;
        let tensors: Vec<DenseTensor> = (0..2)
            .map(|i| DenseTensor::from_vec(place(i), vec![10.0 * r + i as f32], &[1]).unwrap())
            .collect();

        let gathered: Vec<DenseTensor> = (0..2)
            .map(|i| DenseTensor::zeros(place(i), DataType::Float32, &[4]))
            .collect();
        pg.all_gather_multi(&tensors, &gathered).unwrap().synchronize().unwrap();

        let opts = BroadcastOptions {
            source_rank: 1,
            source_root: 1,
        };
        pg.broadcast_multi(&tensors, &tensors, &opts)
            .unwrap()
            .synchronize()
            .unwrap();

        let summed: Vec<DenseTensor> = (0..2)
            .map(|i| DenseTensor::from_vec(place(i), vec![1.0f32], &[1]).unwrap())
            .collect();
        pg.all_reduce_multi(&summed, &summed, &AllreduceOptions::default())
            .unwrap()
            .synchronize()
            .unwrap();

        let key_entry = pg.cache().get("custom_cpu:0,custom_cpu:1").is_some();
        (
            gathered.iter().map(|t| t.to_vec::<f32>().unwrap()).collect::<Vec<_>>(),
            tensors.iter().map(|t| t.to_vec::<f32>().unwrap()[0]).collect::<Vec<_>>(),
            summed.iter().map(|t| t.to_vec::<f32>().unwrap()[0]).collect::<Vec<_>>(),
            key_entry,
        )
    });

    for (gathered, broadcast, summed, key_entry) in results {
        for g in gathered {
            assert_eq!(g, vec![0.0, 1.0, 10.0, 11.0]);
        }
        assert_eq!(broadcast, vec![11.0, 11.0]);
        assert_eq!(summed, vec![4.0, 4.0]);
        assert!(key_entry);
    }
}

#[test]
fn test_multi_device_send_recv() {
    let cluster = Cluster::new();
    let results = cluster.run(2, 2, |pg| {
        if pg.rank() == 0 {
            let tensors: Vec<DenseTensor> = (0..2)
                .map(|i| DenseTensor::from_vec(place(i), vec![i as i64 + 100], &[1]).unwrap())
                .collect();
            pg.send_multi(&tensors, 1).unwrap().synchronize().unwrap();
            vec![]
        } else {
            let tensors: Vec<DenseTensor> = (0..2)
                .map(|i| DenseTensor::zeros(place(i), DataType::Int64, &[1]))
                .collect();
            pg.recv_multi(&tensors, 0).unwrap().synchronize().unwrap();
            tensors.iter().map(|t| t.to_vec::<i64>().unwrap()[0]).collect()
        }
    });
    assert_eq!(results[1], vec![100, 101]);
}

#[test]
fn test_device_context_is_dedicated_stream() {
    let cluster = Cluster::new();
    let pg = cluster.group(0, 1, 1, test_config());
    let t = DenseTensor::from_vec(place(0), vec![1.0f32], &[1]).unwrap();
    pg.all_reduce(&t, &t, &AllreduceOptions::default(), true, false)
        .unwrap()
        .synchronize()
        .unwrap();

    let ctx = pg.get_device_context(&place(0)).unwrap();
    let compute = pg.backend().default_stream(&place(0)).unwrap();
    assert_ne!(ctx.stream().id(), compute.id());

    let comm = pg.get_communicator(&place(0)).unwrap();
    assert_eq!(pg.backend().comm_rank(&comm), 0);
    assert_eq!(comm.place(), &place(0));
}

#[tokio::test]
async fn test_wait_async() {
    let cluster = Cluster::new();
    let pg = cluster.group(0, 1, 1, test_config());
    let t = DenseTensor::from_vec(place(0), vec![2.0f64], &[1]).unwrap();
    let task = pg
        .all_reduce(&t, &t, &AllreduceOptions::default(), false, false)
        .unwrap();
    assert!(task.wait_async(Duration::from_secs(5)).await.unwrap());
    assert_eq!(t.to_vec::<f64>().unwrap(), vec![2.0]);
}
