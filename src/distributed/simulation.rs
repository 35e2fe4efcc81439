//! In-process communication library over host memory.
//!
//! A [`SimulatedFabric`] plays the interconnect: every rank thread obtains its
//! own [`SimulatedBackend`] from the shared fabric, and communicators
//! initialised with the same [`RootId`] join one clique. Streams are worker
//! threads draining a job queue, so work runs asynchronously and in enqueue
//! order like on a device stream.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use bytemuck::Pod;
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use tracing::{debug, error, trace};

use super::backend::{CclBackend, DeviceRuntime, ReduceOp};
use super::place::Place;
use super::rendezvous::{RootId, ROOT_ID_BYTES};
use super::tensor::{DataType, DenseTensor};
use crate::utils::error::{Result, XcclError};

type Job = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// Streams and events
// ---------------------------------------------------------------------------

/// FIFO work queue bound to one device.
#[derive(Clone)]
pub struct SimStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    place: Place,
    id: u64,
    jobs: Sender<Job>,
}

impl SimStream {
    fn spawn(place: Place, id: u64) -> Result<Self> {
        let (jobs, queue) = unbounded::<Job>();
        thread::Builder::new()
            .name(format!("sim-stream-{}-{}", place, id))
            .spawn(move || {
                for job in queue {
                    job();
                }
            })?;
        Ok(Self {
            inner: Arc::new(StreamInner { place, id, jobs }),
        })
    }

    pub fn place(&self) -> &Place {
        &self.inner.place
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        self.inner.jobs.send(job).map_err(|_| {
            XcclError::Communication(format!("{:?} no longer accepts work", self))
        })
    }

    fn synchronize(&self) -> Result<()> {
        let (done, retired) = bounded::<()>(1);
        self.enqueue(Box::new(move || {
            let _ = done.send(());
        }))?;
        retired
            .recv()
            .map_err(|_| XcclError::Communication(format!("{:?} stopped before draining", self)))
    }
}

impl fmt::Debug for SimStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimStream({}#{})", self.inner.place, self.inner.id)
    }
}

/// Marker recorded on a stream; fires once the stream reaches it.
pub struct SimEvent {
    place: Place,
    state: Arc<EventState>,
}

#[derive(Default)]
struct EventState {
    marks: Mutex<EventMarks>,
    fired: Condvar,
}

#[derive(Default)]
struct EventMarks {
    recorded: u64,
    completed: u64,
}

impl EventState {
    fn fire(&self, generation: u64) {
        let mut marks = self.marks.lock();
        marks.completed = marks.completed.max(generation);
        drop(marks);
        self.fired.notify_all();
    }

    fn block_until(&self, generation: u64) {
        let mut marks = self.marks.lock();
        while marks.completed < generation {
            self.fired.wait(&mut marks);
        }
    }

    fn is_fired(&self) -> bool {
        let marks = self.marks.lock();
        marks.completed >= marks.recorded
    }
}

impl SimEvent {
    pub fn place(&self) -> &Place {
        &self.place
    }
}

impl fmt::Debug for SimEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marks = self.state.marks.lock();
        write!(
            f,
            "SimEvent({} recorded={} completed={})",
            self.place, marks.recorded, marks.completed
        )
    }
}

// ---------------------------------------------------------------------------
// Cliques
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    AllReduce,
    AllGather,
    Broadcast,
    Reduce,
}

/// Arguments every rank of a collective has to agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signature {
    kind: OpKind,
    count: usize,
    dtype: DataType,
    op: Option<ReduceOp>,
    root: Option<usize>,
}

impl Signature {
    fn new(kind: OpKind, count: usize, dtype: DataType) -> Self {
        Self {
            kind,
            count,
            dtype,
            op: None,
            root: None,
        }
    }

    fn with_op(mut self, op: ReduceOp) -> Self {
        self.op = Some(op);
        self
    }

    fn with_root(mut self, root: usize) -> Self {
        self.root = Some(root);
        self
    }

    fn nbytes(&self) -> usize {
        self.count * self.dtype.size_of()
    }
}

struct Round {
    signature: Signature,
    mismatched: bool,
    contributions: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
}

/// Ranks sharing one root id.
struct Clique {
    nranks: usize,
    rounds: Mutex<HashMap<u64, Round>>,
    round_progress: Condvar,
    mailboxes: Mutex<HashMap<(usize, usize), VecDeque<Vec<u8>>>>,
    delivered: Condvar,
    /// First failure hit by any member; the clique is unusable afterwards.
    failure: Mutex<Option<String>>,
}

impl Clique {
    fn new(nranks: usize) -> Self {
        Self {
            nranks,
            rounds: Mutex::new(HashMap::new()),
            round_progress: Condvar::new(),
            mailboxes: Mutex::new(HashMap::new()),
            delivered: Condvar::new(),
            failure: Mutex::new(None),
        }
    }

    fn fail(&self, rank: usize, reason: String) {
        error!(rank, reason = %reason, "Communicator failed");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(reason) => Err(XcclError::Communication(reason.clone())),
            None => Ok(()),
        }
    }

    /// Blocks until every rank has joined round `seq`, then returns all
    /// contributions in rank order, or `None` if the ranks disagreed.
    fn exchange(
        &self,
        seq: u64,
        rank: usize,
        signature: Signature,
        contribution: Option<Vec<u8>>,
    ) -> Option<Vec<Option<Vec<u8>>>> {
        let mut rounds = self.rounds.lock();
        let round = rounds.entry(seq).or_insert_with(|| Round {
            signature,
            mismatched: false,
            contributions: vec![None; self.nranks],
            arrived: 0,
            departed: 0,
        });
        if round.signature != signature {
            round.mismatched = true;
        }
        if let Some(slot) = round.contributions.get_mut(rank) {
            *slot = contribution;
        }
        round.arrived += 1;
        if round.arrived == self.nranks {
            self.round_progress.notify_all();
        }

        while rounds
            .get(&seq)
            .map_or(false, |round| round.arrived < self.nranks)
        {
            self.round_progress.wait(&mut rounds);
        }

        let round = rounds.get_mut(&seq)?;
        round.departed += 1;
        let result = (!round.mismatched).then(|| round.contributions.clone());
        if round.departed == self.nranks {
            rounds.remove(&seq);
        }
        result
    }

    fn post(&self, src: usize, dst: usize, payload: Vec<u8>) {
        self.mailboxes
            .lock()
            .entry((src, dst))
            .or_default()
            .push_back(payload);
        self.delivered.notify_all();
    }

    fn take(&self, src: usize, dst: usize) -> Vec<u8> {
        let mut mailboxes = self.mailboxes.lock();
        loop {
            if let Some(payload) = mailboxes.get_mut(&(src, dst)).and_then(VecDeque::pop_front) {
                return payload;
            }
            self.delivered.wait(&mut mailboxes);
        }
    }
}

/// Shared interconnect all simulated ranks of a job attach to.
#[derive(Default)]
pub struct SimulatedFabric {
    cliques: Mutex<HashMap<RootId, Arc<Clique>>>,
    unique_ids: AtomicUsize,
    comm_inits: AtomicUsize,
}

impl SimulatedFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A backend for one process seeing `device_count` devices.
    pub fn backend(
        self: &Arc<Self>,
        device_type: impl Into<String>,
        device_count: usize,
    ) -> SimulatedBackend {
        SimulatedBackend {
            fabric: Arc::clone(self),
            device_type: device_type.into(),
            device_count,
            default_streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
        }
    }

    pub fn unique_ids_generated(&self) -> usize {
        self.unique_ids.load(Ordering::SeqCst)
    }

    pub fn communicators_created(&self) -> usize {
        self.comm_inits.load(Ordering::SeqCst)
    }

    fn join(&self, root_id: &RootId, nranks: usize) -> Result<Arc<Clique>> {
        let mut cliques = self.cliques.lock();
        let clique = cliques
            .entry(*root_id)
            .or_insert_with(|| Arc::new(Clique::new(nranks)));
        if clique.nranks != nranks {
            return Err(XcclError::Communication(format!(
                "{:?} was initialised with {} ranks, not {}",
                root_id, clique.nranks, nranks
            )));
        }
        Ok(Arc::clone(clique))
    }
}

/// One rank's membership in a clique.
#[derive(Clone)]
pub struct SimComm {
    inner: Arc<CommInner>,
}

struct CommInner {
    place: Place,
    rank: usize,
    nranks: usize,
    clique: Arc<Clique>,
    next_seq: AtomicU64,
}

impl SimComm {
    pub fn place(&self) -> &Place {
        &self.inner.place
    }

    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    pub fn nranks(&self) -> usize {
        self.inner.nranks
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::SeqCst)
    }
}

impl fmt::Debug for SimComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SimComm({} rank {}/{})",
            self.inner.place, self.inner.rank, self.inner.nranks
        )
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct SimulatedBackend {
    fabric: Arc<SimulatedFabric>,
    device_type: String,
    device_count: usize,
    default_streams: Mutex<HashMap<Place, SimStream>>,
    next_stream_id: AtomicU64,
}

impl SimulatedBackend {
    pub fn fabric(&self) -> &Arc<SimulatedFabric> {
        &self.fabric
    }

    fn check_place(&self, place: &Place) -> Result<()> {
        if place.device_type() != self.device_type {
            return Err(XcclError::PreconditionNotMet(format!(
                "{} is not a {} device",
                place, self.device_type
            )));
        }
        if place.device_id() >= self.device_count {
            return Err(XcclError::PreconditionNotMet(format!(
                "{} is out of range, {} devices visible",
                place, self.device_count
            )));
        }
        Ok(())
    }

    fn new_stream(&self, place: &Place) -> Result<SimStream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        SimStream::spawn(place.clone(), id)
    }

    fn enqueue_collective<F>(
        &self,
        comm: &SimComm,
        stream: &SimStream,
        signature: Signature,
        source: Option<DenseTensor>,
        finish: F,
    ) -> Result<()>
    where
        F: FnOnce(usize, Vec<Option<Vec<u8>>>) -> Result<()> + Send + 'static,
    {
        comm.inner.clique.check()?;
        let seq = comm.next_seq();
        let rank = comm.rank();
        let clique = Arc::clone(&comm.inner.clique);
        let nbytes = signature.nbytes();
        trace!(rank, seq, kind = ?signature.kind, count = signature.count, "Enqueue collective");

        stream.enqueue(Box::new(move || {
            let contribution = source.map(|tensor| tensor.read_prefix(nbytes));
            let Some(parts) = clique.exchange(seq, rank, signature, contribution) else {
                clique.fail(
                    rank,
                    format!("Ranks disagree on the arguments of {:?} #{}", signature.kind, seq),
                );
                return;
            };
            if let Err(e) = finish(rank, parts) {
                clique.fail(rank, format!("{:?} #{} failed: {}", signature.kind, seq, e));
            }
        }))
    }
}

impl DeviceRuntime for SimulatedBackend {
    type Stream = SimStream;
    type Event = SimEvent;

    fn device_type(&self) -> &str {
        &self.device_type
    }

    fn device_count(&self) -> usize {
        self.device_count
    }

    fn default_stream(&self, place: &Place) -> Result<SimStream> {
        self.check_place(place)?;
        let mut streams = self.default_streams.lock();
        if let Some(stream) = streams.get(place) {
            return Ok(stream.clone());
        }
        let stream = self.new_stream(place)?;
        streams.insert(place.clone(), stream.clone());
        Ok(stream)
    }

    fn create_stream(&self, place: &Place) -> Result<SimStream> {
        self.check_place(place)?;
        self.new_stream(place)
    }

    fn create_event(&self, place: &Place) -> Result<SimEvent> {
        self.check_place(place)?;
        Ok(SimEvent {
            place: place.clone(),
            state: Arc::new(EventState::default()),
        })
    }

    fn record_event(&self, event: &SimEvent, stream: &SimStream) -> Result<()> {
        let generation = {
            let mut marks = event.state.marks.lock();
            marks.recorded += 1;
            marks.recorded
        };
        let state = Arc::clone(&event.state);
        stream.enqueue(Box::new(move || state.fire(generation)))
    }

    fn stream_wait_event(&self, stream: &SimStream, event: &SimEvent) -> Result<()> {
        let target = {
            let marks = event.state.marks.lock();
            if marks.completed >= marks.recorded {
                return Ok(());
            }
            marks.recorded
        };
        let state = Arc::clone(&event.state);
        stream.enqueue(Box::new(move || state.block_until(target)))
    }

    fn query_event(&self, event: &SimEvent) -> bool {
        event.state.is_fired()
    }

    fn synchronize_stream(&self, stream: &SimStream) -> Result<()> {
        stream.synchronize()
    }
}

impl CclBackend for SimulatedBackend {
    type Comm = SimComm;

    fn get_unique_id(&self) -> Result<RootId> {
        let mut bytes = [0u8; ROOT_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.fabric.unique_ids.fetch_add(1, Ordering::SeqCst);
        Ok(RootId::from_array(bytes))
    }

    fn create_communicator(
        &self,
        place: &Place,
        nranks: usize,
        rank: usize,
        root_id: &RootId,
    ) -> Result<SimComm> {
        self.check_place(place)?;
        if rank >= nranks {
            return Err(XcclError::InvalidArgument(format!(
                "Communicator rank {} outside of {} ranks",
                rank, nranks
            )));
        }
        let clique = self.fabric.join(root_id, nranks)?;
        self.fabric.comm_inits.fetch_add(1, Ordering::SeqCst);
        debug!(place = %place, rank, nranks, root_id = %root_id.fingerprint(), "Communicator initialised");
        Ok(SimComm {
            inner: Arc::new(CommInner {
                place: place.clone(),
                rank,
                nranks,
                clique,
                next_seq: AtomicU64::new(0),
            }),
        })
    }

    fn comm_rank(&self, comm: &SimComm) -> usize {
        comm.rank()
    }

    fn comm_count(&self, comm: &SimComm) -> usize {
        comm.nranks()
    }

    fn comm_async_error(&self, comm: &SimComm) -> Result<()> {
        comm.inner.clique.check()
    }

    fn all_reduce(
        &self,
        send: &DenseTensor,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        comm: &SimComm,
        stream: &SimStream,
    ) -> Result<()> {
        check_buffer(send, count, dtype)?;
        check_buffer(recv, count, dtype)?;
        check_reduction(dtype, op)?;

        let recv = recv.clone();
        let signature = Signature::new(OpKind::AllReduce, count, dtype).with_op(op);
        self.enqueue_collective(comm, stream, signature, Some(send.clone()), move |_, parts| {
            let reduced = reduce_bytes(&present(&parts), dtype, op)?;
            recv.write_bytes(&reduced)
        })
    }

    fn all_gather(
        &self,
        send: &DenseTensor,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        comm: &SimComm,
        stream: &SimStream,
    ) -> Result<()> {
        check_buffer(send, count, dtype)?;
        check_buffer(recv, count * comm.nranks(), dtype)?;

        let recv = recv.clone();
        let signature = Signature::new(OpKind::AllGather, count, dtype);
        self.enqueue_collective(comm, stream, signature, Some(send.clone()), move |_, parts| {
            let gathered: Vec<u8> = parts.into_iter().flatten().flatten().collect();
            recv.write_bytes(&gathered)
        })
    }

    fn broadcast(
        &self,
        buf: &DenseTensor,
        count: usize,
        dtype: DataType,
        root: usize,
        comm: &SimComm,
        stream: &SimStream,
    ) -> Result<()> {
        check_buffer(buf, count, dtype)?;
        check_root(comm, root)?;

        let source = (comm.rank() == root).then(|| buf.clone());
        let buf = buf.clone();
        let signature = Signature::new(OpKind::Broadcast, count, dtype).with_root(root);
        self.enqueue_collective(comm, stream, signature, source, move |rank, parts| {
            if rank == root {
                return Ok(());
            }
            match parts.into_iter().nth(root).flatten() {
                Some(bytes) => buf.write_bytes(&bytes),
                None => Err(XcclError::Communication(format!(
                    "Broadcast root {} contributed no data",
                    root
                ))),
            }
        })
    }

    fn reduce(
        &self,
        send: &DenseTensor,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: usize,
        comm: &SimComm,
        stream: &SimStream,
    ) -> Result<()> {
        check_buffer(send, count, dtype)?;
        check_buffer(recv, count, dtype)?;
        check_reduction(dtype, op)?;
        check_root(comm, root)?;

        let recv = recv.clone();
        let signature = Signature::new(OpKind::Reduce, count, dtype)
            .with_op(op)
            .with_root(root);
        self.enqueue_collective(comm, stream, signature, Some(send.clone()), move |rank, parts| {
            if rank != root {
                return Ok(());
            }
            let reduced = reduce_bytes(&present(&parts), dtype, op)?;
            recv.write_bytes(&reduced)
        })
    }

    fn send(
        &self,
        send: &DenseTensor,
        count: usize,
        dtype: DataType,
        peer: usize,
        comm: &SimComm,
        stream: &SimStream,
    ) -> Result<()> {
        check_buffer(send, count, dtype)?;
        check_peer(comm, peer)?;
        comm.inner.clique.check()?;

        let send = send.clone();
        let rank = comm.rank();
        let clique = Arc::clone(&comm.inner.clique);
        let nbytes = count * dtype.size_of();
        stream.enqueue(Box::new(move || {
            trace!(rank, peer, nbytes, "Send");
            clique.post(rank, peer, send.read_prefix(nbytes));
        }))
    }

    fn recv(
        &self,
        recv: &DenseTensor,
        count: usize,
        dtype: DataType,
        peer: usize,
        comm: &SimComm,
        stream: &SimStream,
    ) -> Result<()> {
        check_buffer(recv, count, dtype)?;
        check_peer(comm, peer)?;
        comm.inner.clique.check()?;

        let recv = recv.clone();
        let rank = comm.rank();
        let clique = Arc::clone(&comm.inner.clique);
        stream.enqueue(Box::new(move || {
            let payload = clique.take(peer, rank);
            trace!(rank, peer, nbytes = payload.len(), "Recv");
            if let Err(e) = recv.write_bytes(&payload) {
                clique.fail(rank, format!("Message from rank {} does not fit: {}", peer, e));
            }
        }))
    }
}

fn check_buffer(tensor: &DenseTensor, count: usize, dtype: DataType) -> Result<()> {
    if tensor.dtype() != dtype {
        return Err(XcclError::InvalidArgument(format!(
            "Buffer holds {:?}, operation expects {:?}",
            tensor.dtype(),
            dtype
        )));
    }
    if tensor.numel() < count {
        return Err(XcclError::InvalidArgument(format!(
            "Buffer of {} elements cannot hold {}",
            tensor.numel(),
            count
        )));
    }
    Ok(())
}

fn check_reduction(dtype: DataType, op: ReduceOp) -> Result<()> {
    match dtype {
        DataType::Float16 | DataType::Bfloat16 => Err(XcclError::Unimplemented(format!(
            "Reductions over {:?}",
            dtype
        ))),
        _ if op == ReduceOp::Avg && !dtype.is_float() => Err(XcclError::Unimplemented(format!(
            "Average over integer type {:?}",
            dtype
        ))),
        _ => Ok(()),
    }
}

fn check_root(comm: &SimComm, root: usize) -> Result<()> {
    if root >= comm.nranks() {
        return Err(XcclError::InvalidArgument(format!(
            "Root {} outside of {} ranks",
            root,
            comm.nranks()
        )));
    }
    Ok(())
}

fn check_peer(comm: &SimComm, peer: usize) -> Result<()> {
    if peer >= comm.nranks() || peer == comm.rank() {
        return Err(XcclError::InvalidArgument(format!(
            "Invalid peer {} for rank {} of {}",
            peer,
            comm.rank(),
            comm.nranks()
        )));
    }
    Ok(())
}

fn present(parts: &[Option<Vec<u8>>]) -> Vec<&[u8]> {
    parts.iter().flatten().map(Vec::as_slice).collect()
}

// ---------------------------------------------------------------------------
// Reductions
// ---------------------------------------------------------------------------

trait Reducible: Pod + PartialOrd {
    fn combine(self, other: Self, op: ReduceOp) -> Self;
    fn average(self, n: usize) -> Self;
}

macro_rules! impl_int_reducible {
    ($($t:ty),*) => {$(
        impl Reducible for $t {
            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum | ReduceOp::Avg => self.wrapping_add(other),
                    ReduceOp::Prod => self.wrapping_mul(other),
                    ReduceOp::Max => self.max(other),
                    ReduceOp::Min => self.min(other),
                }
            }

            fn average(self, n: usize) -> Self {
                self / (n.max(1) as $t)
            }
        }
    )*};
}

macro_rules! impl_float_reducible {
    ($($t:ty),*) => {$(
        impl Reducible for $t {
            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum | ReduceOp::Avg => self + other,
                    ReduceOp::Prod => self * other,
                    ReduceOp::Max => self.max(other),
                    ReduceOp::Min => self.min(other),
                }
            }

            fn average(self, n: usize) -> Self {
                self / n as $t
            }
        }
    )*};
}

impl_int_reducible!(i8, u8, i32, u32, i64);
impl_float_reducible!(f32, f64);

fn reduce_typed<T: Reducible>(parts: &[&[u8]], op: ReduceOp) -> Vec<u8> {
    let decode = |bytes: &[u8]| -> Vec<T> {
        bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect()
    };
    let Some((first, rest)) = parts.split_first() else {
        return Vec::new();
    };
    let mut acc = decode(first);
    for part in rest {
        for (a, b) in acc.iter_mut().zip(decode(part)) {
            *a = (*a).combine(b, op);
        }
    }
    if op == ReduceOp::Avg {
        for a in acc.iter_mut() {
            *a = (*a).average(parts.len());
        }
    }
    bytemuck::cast_slice::<T, u8>(&acc).to_vec()
}

fn reduce_bytes(parts: &[&[u8]], dtype: DataType, op: ReduceOp) -> Result<Vec<u8>> {
    let reduced = match dtype {
        DataType::Int8 => reduce_typed::<i8>(parts, op),
        DataType::Uint8 => reduce_typed::<u8>(parts, op),
        DataType::Int32 => reduce_typed::<i32>(parts, op),
        DataType::Uint32 => reduce_typed::<u32>(parts, op),
        DataType::Int64 => reduce_typed::<i64>(parts, op),
        DataType::Float32 => reduce_typed::<f32>(parts, op),
        DataType::Float64 => reduce_typed::<f64>(parts, op),
        DataType::Float16 | DataType::Bfloat16 => {
            return Err(XcclError::Unimplemented(format!(
                "Reductions over {:?}",
                dtype
            )))
        }
    };
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: &str = "custom_cpu";

    /// One backend and communicator per simulated rank, all in one clique.
    fn clique(world_size: usize) -> Vec<(SimulatedBackend, SimComm)> {
        let fabric = SimulatedFabric::new();
        let root = fabric.backend(DEV, 1).get_unique_id().unwrap();
        (0..world_size)
            .map(|rank| {
                let backend = fabric.backend(DEV, 1);
                let comm = backend
                    .create_communicator(&Place::new(DEV, 0), world_size, rank, &root)
                    .unwrap();
                (backend, comm)
            })
            .collect()
    }

    fn tensor_f32(data: Vec<f32>) -> DenseTensor {
        let n = data.len();
        DenseTensor::from_vec(Place::new(DEV, 0), data, &[n]).unwrap()
    }

    fn sync_all(ranks: &[(SimulatedBackend, SimComm)]) {
        for (backend, _) in ranks {
            let stream = backend.default_stream(&Place::new(DEV, 0)).unwrap();
            backend.synchronize_stream(&stream).unwrap();
        }
    }

    #[test]
    fn test_fresh_event_reports_complete() {
        let backend = SimulatedFabric::new().backend(DEV, 1);
        let event = backend.create_event(&Place::new(DEV, 0)).unwrap();
        assert!(backend.query_event(&event));
    }

    #[test]
    fn test_place_validation() {
        let backend = SimulatedFabric::new().backend(DEV, 2);
        assert!(backend.create_stream(&Place::new(DEV, 1)).is_ok());
        assert!(backend.create_stream(&Place::new(DEV, 2)).is_err());
        assert!(backend.create_stream(&Place::new("gpu", 0)).is_err());
    }

    #[test]
    fn test_event_fires_after_pending_recv() {
        let ranks = clique(2);
        let place = Place::new(DEV, 0);
        let (b1, c1) = &ranks[1];
        let stream = b1.default_stream(&place).unwrap();
        let out = tensor_f32(vec![0.0; 2]);
        b1.recv(&out, 2, DataType::Float32, 0, c1, &stream).unwrap();

        let event = b1.create_event(&place).unwrap();
        b1.record_event(&event, &stream).unwrap();
        assert!(!b1.query_event(&event));

        let (b0, c0) = &ranks[0];
        let s0 = b0.default_stream(&place).unwrap();
        b0.send(&tensor_f32(vec![3.0, 4.0]), 2, DataType::Float32, 1, c0, &s0)
            .unwrap();

        b1.synchronize_stream(&stream).unwrap();
        assert!(b1.query_event(&event));
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_stream_wait_event_orders_streams() {
        let ranks = clique(2);
        let place = Place::new(DEV, 0);
        let (b1, c1) = &ranks[1];
        let comm_stream = b1.create_stream(&place).unwrap();
        let compute = b1.default_stream(&place).unwrap();

        let out = tensor_f32(vec![0.0]);
        b1.recv(&out, 1, DataType::Float32, 0, c1, &comm_stream).unwrap();
        let event = b1.create_event(&place).unwrap();
        b1.record_event(&event, &comm_stream).unwrap();
        b1.stream_wait_event(&compute, &event).unwrap();

        let marker = b1.create_event(&place).unwrap();
        b1.record_event(&marker, &compute).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!b1.query_event(&marker));

        let (b0, c0) = &ranks[0];
        let s0 = b0.default_stream(&place).unwrap();
        b0.send(&tensor_f32(vec![9.0]), 1, DataType::Float32, 1, c0, &s0)
            .unwrap();
        b1.synchronize_stream(&compute).unwrap();
        assert!(b1.query_event(&marker));
    }

    #[test]
    fn test_all_reduce_sum() {
        let ranks = clique(3);
        let place = Place::new(DEV, 0);
        let outputs: Vec<DenseTensor> = ranks
            .iter()
            .enumerate()
            .map(|(rank, (backend, comm))| {
                let input = tensor_f32(vec![rank as f32, 1.0]);
                let output = tensor_f32(vec![0.0; 2]);
                let stream = backend.default_stream(&place).unwrap();
                backend
                    .all_reduce(&input, &output, 2, DataType::Float32, ReduceOp::Sum, comm, &stream)
                    .unwrap();
                output
            })
            .collect();
        sync_all(&ranks);
        for output in outputs {
            assert_eq!(output.to_vec::<f32>().unwrap(), vec![3.0, 3.0]);
        }
    }

    #[test]
    fn test_all_gather_and_broadcast() {
        let ranks = clique(2);
        let place = Place::new(DEV, 0);
        let mut gathered = Vec::new();
        let mut bufs = Vec::new();
        for (rank, (backend, comm)) in ranks.iter().enumerate() {
            let stream = backend.default_stream(&place).unwrap();
            let input = tensor_f32(vec![rank as f32 + 1.0; 2]);
            let output = tensor_f32(vec![0.0; 4]);
            backend
                .all_gather(&input, &output, 2, DataType::Float32, comm, &stream)
                .unwrap();
            gathered.push(output);

            let buf = tensor_f32(vec![10.0 * (rank as f32 + 1.0)]);
            backend
                .broadcast(&buf, 1, DataType::Float32, 1, comm, &stream)
                .unwrap();
            bufs.push(buf);
        }
        sync_all(&ranks);
        for output in gathered {
            assert_eq!(output.to_vec::<f32>().unwrap(), vec![1.0, 1.0, 2.0, 2.0]);
        }
        for buf in bufs {
            assert_eq!(buf.to_vec::<f32>().unwrap(), vec![20.0]);
        }
    }

    #[test]
    fn test_mismatched_counts_poison_the_clique() {
        let ranks = clique(2);
        let place = Place::new(DEV, 0);
        let mut outputs = Vec::new();
        for (rank, (backend, comm)) in ranks.iter().enumerate() {
            let stream = backend.default_stream(&place).unwrap();
            let input = tensor_f32(vec![1.0; 3]);
            let output = tensor_f32(vec![0.0; 3]);
            backend
                .all_reduce(&input, &output, 2 + rank, DataType::Float32, ReduceOp::Sum, comm, &stream)
                .unwrap();
            outputs.push(output);
        }
        sync_all(&ranks);
        for output in outputs {
            assert_eq!(output.to_vec::<f32>().unwrap(), vec![0.0; 3]);
        }
        for (backend, comm) in &ranks {
            let err = backend.comm_async_error(comm).unwrap_err();
            assert!(matches!(err, XcclError::Communication(_)));
        }

        let (backend, comm) = &ranks[0];
        let stream = backend.default_stream(&place).unwrap();
        let t = tensor_f32(vec![1.0]);
        let err = backend
            .all_reduce(&t, &t, 1, DataType::Float32, ReduceOp::Sum, comm, &stream)
            .unwrap_err();
        assert!(matches!(err, XcclError::Communication(_)));
        let err = backend.send(&t, 1, DataType::Float32, 1, comm, &stream).unwrap_err();
        assert!(matches!(err, XcclError::Communication(_)));
    }

    #[test]
    fn test_oversized_message_fails_the_receiver() {
        let ranks = clique(2);
        let place = Place::new(DEV, 0);
        let (b0, c0) = &ranks[0];
        let (b1, c1) = &ranks[1];
        let s0 = b0.default_stream(&place).unwrap();
        let s1 = b1.default_stream(&place).unwrap();

        let payload = DenseTensor::from_vec(place.clone(), vec![1i64, 2, 3], &[3]).unwrap();
        let small = DenseTensor::zeros(place.clone(), DataType::Int64, &[2]);
        b0.send(&payload, 3, DataType::Int64, 1, c0, &s0).unwrap();
        b1.recv(&small, 2, DataType::Int64, 0, c1, &s1).unwrap();
        b1.synchronize_stream(&s1).unwrap();

        assert_eq!(small.to_vec::<i64>().unwrap(), vec![0, 0]);
        assert!(matches!(b1.comm_async_error(c1), Err(XcclError::Communication(_))));
        assert!(b0.comm_async_error(c0).is_err());
    }

    #[test]
    fn test_healthy_comm_reports_no_error() {
        let ranks = clique(2);
        sync_all(&ranks);
        for (backend, comm) in &ranks {
            assert!(backend.comm_async_error(comm).is_ok());
        }
    }

    #[test]
    fn test_argument_errors_are_synchronous() {
        let ranks = clique(2);
        let (backend, comm) = &ranks[0];
        let stream = backend.default_stream(&Place::new(DEV, 0)).unwrap();
        let t = tensor_f32(vec![1.0; 2]);

        let err = backend.all_reduce(&t, &t, 4, DataType::Float32, ReduceOp::Sum, comm, &stream);
        assert!(matches!(err, Err(XcclError::InvalidArgument(_))));
        let err = backend.send(&t, 2, DataType::Float32, 0, comm, &stream);
        assert!(matches!(err, Err(XcclError::InvalidArgument(_))));
        let err = backend.broadcast(&t, 2, DataType::Float32, 5, comm, &stream);
        assert!(matches!(err, Err(XcclError::InvalidArgument(_))));

        let half = DenseTensor::zeros(Place::new(DEV, 0), DataType::Float16, &[2]);
        let err = backend.all_reduce(&half, &half, 2, DataType::Float16, ReduceOp::Sum, comm, &stream);
        assert!(matches!(err, Err(XcclError::Unimplemented(_))));
    }

    #[test]
    fn test_clique_size_mismatch() {
        let fabric = SimulatedFabric::new();
        let backend = fabric.backend(DEV, 1);
        let root = backend.get_unique_id().unwrap();
        let place = Place::new(DEV, 0);
        backend.create_communicator(&place, 2, 0, &root).unwrap();
        assert!(backend.create_communicator(&place, 3, 1, &root).is_err());
        assert!(backend.create_communicator(&place, 2, 2, &root).is_err());
        assert_eq!(fabric.communicators_created(), 1);
        assert_eq!(fabric.unique_ids_generated(), 1);
    }

    #[test]
    fn test_reduce_ops() {
        let a = bytemuck::cast_slice::<i32, u8>(&[1, 5, -2]).to_vec();
        let b = bytemuck::cast_slice::<i32, u8>(&[4, 2, 3]).to_vec();
        let parts = [a.as_slice(), b.as_slice()];

        let decode = |bytes: Vec<u8>| -> Vec<i32> {
            bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect()
        };
        assert_eq!(decode(reduce_bytes(&parts, DataType::Int32, ReduceOp::Sum).unwrap()), vec![5, 7, 1]);
        assert_eq!(decode(reduce_bytes(&parts, DataType::Int32, ReduceOp::Max).unwrap()), vec![4, 5, 3]);
        assert_eq!(decode(reduce_bytes(&parts, DataType::Int32, ReduceOp::Min).unwrap()), vec![1, 2, -2]);
        assert_eq!(decode(reduce_bytes(&parts, DataType::Int32, ReduceOp::Prod).unwrap()), vec![4, 10, -6]);

        let x = bytemuck::cast_slice::<f64, u8>(&[1.0, 4.0]).to_vec();
        let y = bytemuck::cast_slice::<f64, u8>(&[3.0, 0.0]).to_vec();
        let avg = reduce_bytes(&[x.as_slice(), y.as_slice()], DataType::Float64, ReduceOp::Avg).unwrap();
        let avg: Vec<f64> = avg.chunks_exact(8).map(bytemuck::pod_read_unaligned).collect();
        assert_eq!(avg, vec![2.0, 2.0]);

        assert!(check_reduction(DataType::Int64, ReduceOp::Avg).is_err());
        assert!(check_reduction(DataType::Float32, ReduceOp::Avg).is_ok());
        assert!(check_reduction(DataType::Bfloat16, ReduceOp::Max).is_err());
    }

    #[test]
    fn test_integer_sum_wraps() {
        let a = [250u8];
        let b = [10u8];
        let out = reduce_bytes(&[&a[..], &b[..]], DataType::Uint8, ReduceOp::Sum).unwrap();
        assert_eq!(out, vec![4u8]);
    }
}
