//! Collective communication for multi-device processes.
//!
//! Provides:
//! - Rendezvous of communicator root ids through a key-value store
//! - A per-device-set communicator cache with dedicated comm streams
//! - Stream-ordered dispatch of collectives with pollable completion tasks
//! - All-reduce, all-gather, broadcast, reduce, send/recv and barrier

pub mod backend;
pub mod cache;
pub mod check;
pub mod collective;
pub mod options;
pub mod place;
pub mod process_group;
pub mod registry;
pub mod rendezvous;
pub mod simulation;
pub mod store;
pub mod task;
pub mod tensor;

use std::fmt;

pub use backend::{CclBackend, DeviceContext, DeviceRuntime, ReduceOp};
pub use cache::{CommunicatorCache, CommunicatorEntry};
pub use options::{AllreduceOptions, BarrierOptions, BroadcastOptions, ReduceOptions};
pub use place::{DeviceSet, Place};
pub use process_group::ProcessGroupCustom;
pub use registry::create_process_group_custom;
pub use rendezvous::RootId;
pub use simulation::{SimulatedBackend, SimulatedFabric};
pub use store::{InMemoryStore, Store};
pub use task::{CollectiveTask, WAIT_FOREVER};
pub use tensor::{DataType, DenseTensor, Element};

/// Kind of communication a task was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommType {
    AllReduce,
    AllGather,
    Broadcast,
    Send,
    Recv,
    Reduce,
    Barrier,
}

impl CommType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommType::AllReduce => "ALLREDUCE",
            CommType::AllGather => "ALLGATHER",
            CommType::Broadcast => "BROADCAST",
            CommType::Send => "SEND",
            CommType::Recv => "RECV",
            CommType::Reduce => "REDUCE",
            CommType::Barrier => "BARRIER",
        }
    }
}

impl fmt::Display for CommType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-independent view of a process group, as kept by the registry.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process inside the group
    fn rank(&self) -> usize;

    /// Number of processes in the group
    fn size(&self) -> usize;

    fn gid(&self) -> i32;

    fn backend_name(&self) -> &str;
}
