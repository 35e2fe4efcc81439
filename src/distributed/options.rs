//! Per-call options of the collective operations.

use super::backend::ReduceOp;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllreduceOptions {
    pub reduce_op: ReduceOp,
}

/// The root is device `source_root` of process `source_rank`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    pub source_rank: usize,
    pub source_root: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    pub reduce_op: ReduceOp,
    pub root_rank: usize,
}

/// `device_id` must be non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierOptions {
    pub device_id: i64,
}

impl AllreduceOptions {
    pub fn new(reduce_op: ReduceOp) -> Self {
        Self { reduce_op }
    }
}

impl BroadcastOptions {
    pub fn from_rank(source_rank: usize) -> Self {
        Self {
            source_rank,
            source_root: 0,
        }
    }
}

impl BarrierOptions {
    pub fn on_device(device_id: i64) -> Self {
        Self { device_id }
    }
}
