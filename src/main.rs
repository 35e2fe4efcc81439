use std::env;
use std::sync::Arc;
use std::thread;

use candle_core::{Device, Tensor};
use tracing::{error, info};

use xccl_coordinator::distributed::{
    AllreduceOptions, BarrierOptions, BroadcastOptions, DataType, DenseTensor, InMemoryStore,
    Place, ProcessGroupCustom, ReduceOp, SimulatedBackend, SimulatedFabric, Store,
};
use xccl_coordinator::utils::config::XcclConfig;
use xccl_coordinator::utils::error::{Result, XcclError};
use xccl_coordinator::utils::{logging, metrics};

fn main() -> Result<()> {
    logging::init_logging_from_env();
    let config = XcclConfig::from_env();
    config.validate()?;

    let world_size = env::var("XCCL_DEMO_RANKS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n >= 2)
        .unwrap_or(4);
    info!(world_size, device_type = %config.device_type, "Starting collective demo");

    let fabric = SimulatedFabric::new();
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let backend = Arc::new(fabric.backend(config.device_type.clone(), 1));
            let store = Arc::clone(&store);
            let config = config.clone();
            thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || -> Result<()> {
                    let pg = ProcessGroupCustom::new(store, backend, rank, world_size, 0, config)?;
                    run_rank(&pg)
                })
        })
        .collect::<std::io::Result<_>>()?;

    let mut failures = 0;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(rank, error = %e, "Rank failed");
                failures += 1;
            }
            Err(_) => {
                error!(rank, "Rank panicked");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(XcclError::Communication(format!("{} ranks failed", failures)));
    }

    println!("\n--- Metrics ---");
    println!("{}", metrics::get_metrics().gather());
    println!("Demo successful!");
    Ok(())
}

fn run_rank(pg: &ProcessGroupCustom<SimulatedBackend>) -> Result<()> {
    let rank = pg.rank();
    let size = pg.size();
    let place = Place::new(pg.device_type(), 0);

    // All-reduce of a host tensor
    let host = Tensor::new(&[rank as f32 + 1.0, 1.0], &Device::Cpu)?;
    let grad = DenseTensor::from_candle(&host, place.clone())?;
    let opts = AllreduceOptions::new(ReduceOp::Sum);
    pg.all_reduce(&grad, &grad, &opts, true, false)?.synchronize()?;
    let reduced = grad.to_candle()?.to_vec1::<f32>()?;
    info!(rank, ?reduced, "All-reduce done");

    // All-gather of every rank id
    let mine = DenseTensor::from_vec(place.clone(), vec![rank as i64], &[1])?;
    let all = DenseTensor::zeros(place.clone(), DataType::Int64, &[size]);
    pg.all_gather(&all, &mine, 0, 0, true, false)?.synchronize()?;
    info!(rank, gathered = ?all.to_vec::<i64>()?, "All-gather done");

    // Broadcast from the last rank
    let root = size - 1;
    let buf = DenseTensor::from_vec(place.clone(), vec![rank as f32 * 10.0; 3], &[3])?;
    pg.broadcast(&buf, &buf, &BroadcastOptions::from_rank(root), true, false)?
        .synchronize()?;
    info!(rank, received = ?buf.to_vec::<f32>()?, "Broadcast done");

    // Ring of send/recv
    let next = (rank + 1) % size;
    let prev = (rank + size - 1) % size;
    let outgoing = DenseTensor::from_vec(place.clone(), vec![rank as i64; 2], &[2])?;
    let incoming = DenseTensor::zeros(place, DataType::Int64, &[2]);
    let sent = pg.send(&outgoing, next, 0, 0, true, false)?;
    let received = pg.recv(&incoming, prev, 0, 0, true, false)?;
    sent.synchronize()?;
    received.synchronize()?;
    info!(rank, from = prev, payload = ?incoming.to_vec::<i64>()?, "Send/recv done");

    pg.barrier(&BarrierOptions::on_device(0))?.synchronize()?;
    info!(rank, "Barrier passed");
    Ok(())
}
