//! Interfaces consumed from the device driver and the communication library.
//!
//! A backend bundles the device context provider (streams and events) with
//! the collective primitives. The process group is generic over it, so the
//! per-operation closures are monomorphized instead of dispatched virtually.

use super::place::Place;
use super::rendezvous::RootId;
use super::tensor::{DataType, DenseTensor};
use crate::utils::error::Result;

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReduceOp {
    #[default]
    Sum,
    Prod,
    Max,
    Min,
    Avg,
}

/// Streams, events and contexts of one device type.
pub trait DeviceRuntime: Send + Sync + 'static {
    type Stream: Clone + Send + Sync + 'static;
    type Event: Send + Sync + 'static;

    fn device_type(&self) -> &str;

    /// Number of devices of this type visible to the process.
    fn device_count(&self) -> usize;

    /// The compute stream callers enqueue their own work on.
    fn default_stream(&self, place: &Place) -> Result<Self::Stream>;

    fn create_stream(&self, place: &Place) -> Result<Self::Stream>;

    /// A fresh event; querying it before any record reports completion.
    fn create_event(&self, place: &Place) -> Result<Self::Event>;

    /// Captures the current tail of `stream` into `event`.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> Result<()>;

    /// Makes future work on `stream` wait for the last record of `event`.
    fn stream_wait_event(&self, stream: &Self::Stream, event: &Self::Event) -> Result<()>;

    /// Non-blocking: has the last record of `event` retired.
    fn query_event(&self, event: &Self::Event) -> bool;

    /// Blocks the host until all work enqueued on `stream` has retired.
    fn synchronize_stream(&self, stream: &Self::Stream) -> Result<()>;
}

/// Collective communication primitives.
///
/// Every call only enqueues work on `stream` and returns; argument errors are
/// reported synchronously. A failure while the enqueued work runs poisons the
/// communicator: [`comm_async_error`](Self::comm_async_error) reports it from
/// then on and later calls on that communicator are rejected.
pub trait CclBackend: DeviceRuntime {
    type Comm: Clone + Send + Sync + 'static;

    fn get_unique_id(&self) -> Result<RootId>;

    fn create_communicator(
        &self,
        place: &Place,
        nranks: usize,
        rank: usize,
        root_id: &RootId,
    ) -> Result<Self::Comm>;

    fn comm_rank(&self, comm: &Self::Comm) -> usize;

    fn comm_count(&self, comm: &Self::Comm) -> usize;

    /// The first failure hit by work already run on `comm`, if any.
    fn comm_async_error(&self, comm: &Self::Comm) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn all_reduce(
        &self,
        send: &DenseTensor,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Gathers `count` elements from every rank into `recv`, in rank order.
    fn all_gather(
        &self,
        send: &DenseTensor,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// In place: the root's `buf` is sent, every other rank receives into `buf`.
    fn broadcast(
        &self,
        buf: &DenseTensor,
        count: usize,
        dtype: DataType,
        root: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &self,
        send: &DenseTensor,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    fn send(
        &self,
        send: &DenseTensor,
        count: usize,
        dtype: DataType,
        peer: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    fn recv(
        &self,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        peer: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;
}

/// A device placement paired with the stream work for it is enqueued on.
#[derive(Debug, Clone)]
pub struct DeviceContext<S> {
    place: Place,
    stream: S,
}

impl<S> DeviceContext<S> {
    pub fn new(place: Place, stream: S) -> Self {
        Self { place, stream }
    }

    pub fn place(&self) -> &Place {
        &self.place
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }
}
