//! Process group over a pluggable device communication library.
//!
//! Every operation validates its arguments, builds the per-device call and
//! hands it to [`ProcessGroupCustom::collective`], which returns a
//! [`CollectiveTask`] the caller can poll or block on.
//!
//! The single-tensor entry points take `sync_op` and `use_calc_stream`:
//! `use_calc_stream` enqueues directly on the caller's compute stream, and
//! `sync_op` together with the `blocking_wait` config option makes the call
//! wait for completion before returning.

use std::slice;
use std::sync::Arc;

use tracing::info;

use super::backend::{CclBackend, DeviceContext, ReduceOp};
use super::cache::{Bootstrap, CommunicatorCache};
use super::check;
use super::options::{AllreduceOptions, BarrierOptions, BroadcastOptions, ReduceOptions};
use super::place::Place;
use super::store::Store;
use super::task::{CollectiveTask, WaitPolicy};
use super::tensor::{DataType, DenseTensor};
use super::{CommType, ProcessGroup};
use crate::utils::config::XcclConfig;
use crate::utils::error::{Result, XcclError};

pub struct ProcessGroupCustom<B: CclBackend> {
    pub(super) rank: usize,
    pub(super) size: usize,
    pub(super) gid: i32,
    pub(super) backend: Arc<B>,
    pub(super) cache: CommunicatorCache<B>,
    store: Arc<dyn Store>,
    config: XcclConfig,
}

impl<B: CclBackend> ProcessGroupCustom<B> {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<B>,
        rank: usize,
        size: usize,
        gid: i32,
        config: XcclConfig,
    ) -> Result<Self> {
        config.validate()?;
        if size == 0 || rank >= size {
            return Err(XcclError::InvalidArgument(format!(
                "Rank {} is outside of a group of {}",
                rank, size
            )));
        }
        if backend.device_type() != config.device_type {
            return Err(XcclError::PreconditionNotMet(format!(
                "Backend drives {} devices but the group is configured for {}",
                backend.device_type(),
                config.device_type
            )));
        }
        info!(
            gid,
            rank,
            size,
            device_type = %config.device_type,
            devices = backend.device_count(),
            "Process group created"
        );
        Ok(Self {
            rank,
            size,
            gid,
            backend,
            cache: CommunicatorCache::new(),
            store,
            config,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gid(&self) -> i32 {
        self.gid
    }

    pub fn device_type(&self) -> &str {
        &self.config.device_type
    }

    pub fn config(&self) -> &XcclConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn cache(&self) -> &CommunicatorCache<B> {
        &self.cache
    }

    pub(super) fn bootstrap(&self) -> Bootstrap<'_, B> {
        Bootstrap {
            backend: &*self.backend,
            store: &*self.store,
            namespace: &self.config.store_namespace,
            gid: self.gid,
            rank: self.rank,
            size: self.size,
        }
    }

    pub(super) fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::from_config(&self.config)
    }

    fn finish(&self, task: CollectiveTask<B>, sync_op: bool) -> Result<CollectiveTask<B>> {
        if sync_op && self.config.blocking_wait {
            task.wait(self.config.default_wait_timeout())?;
        }
        Ok(task)
    }

    /// Dedicated communication context of a device used alone.
    pub fn get_device_context(&self, place: &Place) -> Result<DeviceContext<B::Stream>> {
        self.cache
            .get(&place.to_string())
            .and_then(|entry| entry.context_for(place).cloned())
            .ok_or_else(|| {
                XcclError::NotFound(format!(
                    "Cannot find the device context in this process group for {}",
                    place
                ))
            })
    }

    /// Communicator of a device used alone, for raw library calls.
    pub fn get_communicator(&self, place: &Place) -> Result<B::Comm> {
        self.cache
            .get(&place.to_string())
            .and_then(|entry| entry.comm_for(place).cloned())
            .ok_or_else(|| {
                XcclError::NotFound(format!(
                    "Cannot find the communicator in this process group for {}",
                    place
                ))
            })
    }

    fn check_device_lists(&self, inputs: &[DenseTensor], outputs: &[DenseTensor]) -> Result<()> {
        let devices = self.backend.device_count();
        check::check_tensors_in_different_devices(inputs, devices, self.device_type())?;
        check::check_tensors_in_different_devices(outputs, devices, self.device_type())?;
        if inputs.len() != outputs.len() {
            return Err(XcclError::InvalidArgument(format!(
                "{} inputs but {} outputs",
                inputs.len(),
                outputs.len()
            )));
        }
        for (input, output) in inputs.iter().zip(outputs) {
            if input.place() != output.place() {
                return Err(XcclError::InvalidArgument(format!(
                    "Input on {} is paired with an output on {}",
                    input.place(),
                    output.place()
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // All-reduce
    // ------------------------------------------------------------------

    pub fn all_reduce(
        &self,
        out: &DenseTensor,
        input: &DenseTensor,
        opts: &AllreduceOptions,
        sync_op: bool,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        check::same_shape(out, input, 0, self.rank, self.size, self.device_type())?;
        let task = self.dispatch_all_reduce(
            slice::from_ref(input),
            slice::from_ref(out),
            opts,
            use_calc_stream,
        )?;
        self.finish(task, sync_op)
    }

    /// One tensor per local device, always on the dedicated streams.
    pub fn all_reduce_multi(
        &self,
        inputs: &[DenseTensor],
        outputs: &[DenseTensor],
        opts: &AllreduceOptions,
    ) -> Result<CollectiveTask<B>> {
        self.check_device_lists(inputs, outputs)?;
        for (input, output) in inputs.iter().zip(outputs) {
            check::same_shape(output, input, 0, self.rank, self.size, self.device_type())?;
        }
        self.dispatch_all_reduce(inputs, outputs, opts, false)
    }

    fn dispatch_all_reduce(
        &self,
        inputs: &[DenseTensor],
        outputs: &[DenseTensor],
        opts: &AllreduceOptions,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        let op = opts.reduce_op;
        self.collective(
            inputs,
            outputs,
            CommType::AllReduce,
            use_calc_stream,
            |input, output, comm, stream| {
                self.backend
                    .all_reduce(input, output, input.numel(), input.dtype(), op, comm, stream)
            },
        )
    }

    // ------------------------------------------------------------------
    // All-gather
    // ------------------------------------------------------------------

    /// Gathers `input` (or its `[offset, offset + numel)` window when
    /// `numel > 0`) from every rank into `out`, in rank order.
    pub fn all_gather(
        &self,
        out: &DenseTensor,
        input: &DenseTensor,
        offset: i64,
        numel: i64,
        sync_op: bool,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        let input = partial_view(input, offset, numel)?;
        check::gather_like_shape(out, &input, self.size, self.rank, self.size, self.device_type())?;
        let task = self.dispatch_all_gather(
            slice::from_ref(&input),
            slice::from_ref(out),
            use_calc_stream,
        )?;
        self.finish(task, sync_op)
    }

    pub fn all_gather_multi(
        &self,
        inputs: &[DenseTensor],
        outputs: &[DenseTensor],
    ) -> Result<CollectiveTask<B>> {
        self.check_device_lists(inputs, outputs)?;
        let participants = self.size * inputs.len();
        for (input, output) in inputs.iter().zip(outputs) {
            check::gather_like_shape(output, input, participants, self.rank, self.size, self.device_type())?;
        }
        self.dispatch_all_gather(inputs, outputs, false)
    }

    fn dispatch_all_gather(
        &self,
        inputs: &[DenseTensor],
        outputs: &[DenseTensor],
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        self.collective(
            inputs,
            outputs,
            CommType::AllGather,
            use_calc_stream,
            |input, output, comm, stream| {
                self.backend
                    .all_gather(input, output, input.numel(), input.dtype(), comm, stream)
            },
        )
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// The root reads `input`; every other participant receives into `out`.
    pub fn broadcast(
        &self,
        out: &DenseTensor,
        input: &DenseTensor,
        opts: &BroadcastOptions,
        sync_op: bool,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        check::same_shape(out, input, opts.source_rank, self.rank, self.size, self.device_type())?;
        let task = self.dispatch_broadcast(
            slice::from_ref(input),
            slice::from_ref(out),
            opts,
            use_calc_stream,
        )?;
        self.finish(task, sync_op)
    }

    pub fn broadcast_multi(
        &self,
        inputs: &[DenseTensor],
        outputs: &[DenseTensor],
        opts: &BroadcastOptions,
    ) -> Result<CollectiveTask<B>> {
        self.check_device_lists(inputs, outputs)?;
        for (input, output) in inputs.iter().zip(outputs) {
            check::same_shape(output, input, opts.source_rank, self.rank, self.size, self.device_type())?;
        }
        self.dispatch_broadcast(inputs, outputs, opts, false)
    }

    fn dispatch_broadcast(
        &self,
        inputs: &[DenseTensor],
        outputs: &[DenseTensor],
        opts: &BroadcastOptions,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        let n = inputs.len();
        if opts.source_root >= n {
            return Err(XcclError::InvalidArgument(format!(
                "Broadcast source root {} but only {} tensors were given",
                opts.source_root, n
            )));
        }
        let root = opts.source_rank * n + opts.source_root;
        self.collective(
            inputs,
            outputs,
            CommType::Broadcast,
            use_calc_stream,
            |input, output, comm, stream| {
                let buf = if self.backend.comm_rank(comm) == root {
                    input
                } else {
                    output
                };
                self.backend
                    .broadcast(buf, input.numel(), input.dtype(), root, comm, stream)
            },
        )
    }

    // ------------------------------------------------------------------
    // Reduce
    // ------------------------------------------------------------------

    /// Reduces onto `opts.root_rank`; `out` is only written on the root.
    pub fn reduce(
        &self,
        out: &DenseTensor,
        input: &DenseTensor,
        opts: &ReduceOptions,
        sync_op: bool,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        check::same_shape(out, input, opts.root_rank, self.rank, self.size, self.device_type())?;
        let (op, root) = (opts.reduce_op, opts.root_rank);
        let task = self.collective(
            slice::from_ref(input),
            slice::from_ref(out),
            CommType::Reduce,
            use_calc_stream,
            |input, output, comm, stream| {
                self.backend
                    .reduce(input, output, input.numel(), input.dtype(), op, root, comm, stream)
            },
        )?;
        self.finish(task, sync_op)
    }

    // ------------------------------------------------------------------
    // Point to point
    // ------------------------------------------------------------------

    /// Sends `tensor` (or its window when `numel > 0`) to `dst_rank`.
    pub fn send(
        &self,
        tensor: &DenseTensor,
        dst_rank: usize,
        offset: i64,
        numel: i64,
        sync_op: bool,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        check::check_shape(tensor, dst_rank, self.size, self.device_type())?;
        let tensor = partial_view(tensor, offset, numel)?;
        let task = self.dispatch_send(slice::from_ref(&tensor), dst_rank, use_calc_stream)?;
        self.finish(task, sync_op)
    }

    pub fn send_multi(&self, tensors: &[DenseTensor], dst_rank: usize) -> Result<CollectiveTask<B>> {
        check::check_tensors_in_different_devices(
            tensors,
            self.backend.device_count(),
            self.device_type(),
        )?;
        for tensor in tensors {
            check::check_shape(tensor, dst_rank, self.size, self.device_type())?;
        }
        self.dispatch_send(tensors, dst_rank, false)
    }

    fn dispatch_send(
        &self,
        tensors: &[DenseTensor],
        dst_rank: usize,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        let n = tensors.len();
        self.collective(
            tensors,
            tensors,
            CommType::Send,
            use_calc_stream,
            |input, _, comm, stream| {
                let peer = dst_rank * n + self.backend.comm_rank(comm) % n;
                self.backend
                    .send(input, input.numel(), input.dtype(), peer, comm, stream)
            },
        )
    }

    /// Receives into `tensor` (or its window when `numel > 0`) from `src_rank`.
    pub fn recv(
        &self,
        tensor: &DenseTensor,
        src_rank: usize,
        offset: i64,
        numel: i64,
        sync_op: bool,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        check::check_shape(tensor, src_rank, self.size, self.device_type())?;
        let tensor = partial_view(tensor, offset, numel)?;
        let task = self.dispatch_recv(slice::from_ref(&tensor), src_rank, use_calc_stream)?;
        self.finish(task, sync_op)
    }

    pub fn recv_multi(&self, tensors: &[DenseTensor], src_rank: usize) -> Result<CollectiveTask<B>> {
        check::check_tensors_in_different_devices(
            tensors,
            self.backend.device_count(),
            self.device_type(),
        )?;
        for tensor in tensors {
            check::check_shape(tensor, src_rank, self.size, self.device_type())?;
        }
        self.dispatch_recv(tensors, src_rank, false)
    }

    fn dispatch_recv(
        &self,
        tensors: &[DenseTensor],
        src_rank: usize,
        use_calc_stream: bool,
    ) -> Result<CollectiveTask<B>> {
        let n = tensors.len();
        self.collective(
            tensors,
            tensors,
            CommType::Recv,
            use_calc_stream,
            |_, output, comm, stream| {
                let peer = src_rank * n + self.backend.comm_rank(comm) % n;
                self.backend
                    .recv(output, output.numel(), output.dtype(), peer, comm, stream)
            },
        )
    }

    // ------------------------------------------------------------------
    // Barrier
    // ------------------------------------------------------------------

    /// All-reduce of a one-element buffer on `opts.device_id`. Blocks until
    /// the barrier completed on every rank, whatever `blocking_wait` says. The
    /// buffer is kept alive by the returned task.
    pub fn barrier(&self, opts: &BarrierOptions) -> Result<CollectiveTask<B>> {
        if opts.device_id < 0 {
            return Err(XcclError::PreconditionNotMet(
                "The barrier device id must greater or equal than 0.".to_string(),
            ));
        }
        let place = Place::new(self.device_type(), opts.device_id as usize);
        let barrier_tensor = DenseTensor::zeros(place, DataType::Float32, &[1]);
        check::check_shape(&barrier_tensor, self.rank, self.size, self.device_type())?;

        let mut task = self.collective(
            slice::from_ref(&barrier_tensor),
            slice::from_ref(&barrier_tensor),
            CommType::Barrier,
            false,
            |input, output, comm, stream| {
                self.backend.all_reduce(
                    input,
                    output,
                    input.numel(),
                    input.dtype(),
                    ReduceOp::Sum,
                    comm,
                    stream,
                )
            },
        )?;
        task.attach_barrier_tensor(barrier_tensor);
        task.wait(self.config.default_wait_timeout())?;
        Ok(task)
    }
}

impl<B: CclBackend> ProcessGroup for ProcessGroupCustom<B> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn gid(&self) -> i32 {
        self.gid
    }

    fn backend_name(&self) -> &str {
        self.device_type()
    }
}

/// A flat window of `tensor` when `numel > 0`, the whole tensor otherwise.
fn partial_view(tensor: &DenseTensor, offset: i64, numel: i64) -> Result<DenseTensor> {
    if numel <= 0 {
        return Ok(tensor.clone());
    }
    if offset < 0 {
        return Err(XcclError::InvalidArgument(format!(
            "Slice offset must be non-negative, got {}",
            offset
        )));
    }
    tensor.partial(offset as usize, numel as usize)
}
