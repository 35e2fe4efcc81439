//! Completion handles for dispatched collectives.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, trace, warn};

use super::backend::{CclBackend, DeviceContext};
use super::place::{DeviceSet, Place};
use super::tensor::DenseTensor;
use super::CommType;
use crate::utils::config::XcclConfig;
use crate::utils::error::{Result, XcclError};
use crate::utils::metrics;

/// Pass to [`CollectiveTask::wait`] to wait without a deadline.
pub const WAIT_FOREVER: Duration = Duration::MAX;

/// How a task polls its events.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    /// Fail with [`XcclError::Timeout`] once a deadline passes.
    pub strict: bool,
}

impl WaitPolicy {
    pub fn from_config(config: &XcclConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            default_timeout: config.default_wait_timeout(),
            strict: config.strict_wait_timeout,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::from_config(&XcclConfig::default())
    }
}

/// One control event per place; the task is complete once all of them fired.
///
/// Completion is latched: after `is_completed` has returned `Ok(true)` once it
/// keeps returning `Ok(true)`. A communicator failure seen before that is
/// returned as an error instead.
pub struct CollectiveTask<B: CclBackend> {
    backend: Arc<B>,
    device_set: DeviceSet,
    rank: usize,
    comm_type: CommType,
    control_events: Vec<B::Event>,
    comms: Vec<B::Comm>,
    outputs: Vec<DenseTensor>,
    barrier_tensor: Option<DenseTensor>,
    completed: AtomicBool,
    policy: WaitPolicy,
}

impl<B: CclBackend> CollectiveTask<B> {
    pub fn new(
        backend: Arc<B>,
        device_set: DeviceSet,
        rank: usize,
        comm_type: CommType,
        comms: Vec<B::Comm>,
        policy: WaitPolicy,
    ) -> Result<Self> {
        let control_events = device_set
            .places()
            .iter()
            .map(|place| backend.create_event(place))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            backend,
            device_set,
            rank,
            comm_type,
            control_events,
            comms,
            outputs: Vec::new(),
            barrier_tensor: None,
            completed: AtomicBool::new(false),
            policy,
        })
    }

    pub(crate) fn set_outputs(&mut self, outputs: Vec<DenseTensor>) {
        self.outputs = outputs;
    }

    pub(crate) fn attach_barrier_tensor(&mut self, tensor: DenseTensor) {
        self.barrier_tensor = Some(tensor);
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn comm_type(&self) -> CommType {
        self.comm_type
    }

    pub fn places(&self) -> &[Place] {
        self.device_set.places()
    }

    pub fn outputs(&self) -> &[DenseTensor] {
        &self.outputs
    }

    pub fn barrier_tensor(&self) -> Option<&DenseTensor> {
        self.barrier_tensor.as_ref()
    }

    /// Non-blocking completion check.
    ///
    /// Fails with the communicator's error if the collective, or earlier work
    /// on the same communicators, failed on the device.
    pub fn is_completed(&self) -> Result<bool> {
        if self.completed.load(Ordering::Acquire) {
            return Ok(true);
        }
        let done = self
            .control_events
            .iter()
            .all(|event| self.backend.query_event(event));
        if done {
            self.check_comms()?;
            self.completed.store(true, Ordering::Release);
        }
        Ok(done)
    }

    fn check_comms(&self) -> Result<()> {
        for comm in &self.comms {
            if let Err(e) = self.backend.comm_async_error(comm) {
                error!(rank = self.rank, comm_type = %self.comm_type, error = %e, "Collective task failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Orders the compute stream of every place after this task.
    fn order_compute_streams(&self) -> Result<()> {
        for (place, event) in self.device_set.places().iter().zip(&self.control_events) {
            let stream = self.backend.default_stream(place)?;
            self.backend.stream_wait_event(&stream, event)?;
        }
        Ok(())
    }

    fn deadline(&self, started: Instant, timeout: Duration) -> Option<Instant> {
        if !self.policy.strict {
            return None;
        }
        started.checked_add(timeout)
    }

    fn timed_out(&self, started: Instant, timeout: Duration) -> XcclError {
        let elapsed = started.elapsed();
        warn!(
            rank = self.rank,
            comm_type = %self.comm_type,
            elapsed_ms = elapsed.as_millis() as u64,
            "Collective task did not complete before its deadline"
        );
        metrics::record_task_wait(elapsed.as_secs_f64(), true);
        XcclError::Timeout(timeout)
    }

    /// Makes the compute streams wait on this task, then blocks the host
    /// until every control event has fired.
    ///
    /// Returns `Ok(true)` on completion and [`XcclError::Timeout`] when the
    /// policy is strict and `timeout` elapses first.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        self.order_compute_streams()?;
        let deadline = self.deadline(started, timeout);

        while !self.is_completed()? {
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Err(self.timed_out(started, timeout));
            }
            trace!(rank = self.rank, comm_type = %self.comm_type, "Polling collective task");
            thread::sleep(self.policy.poll_interval);
        }
        metrics::record_task_wait(started.elapsed().as_secs_f64(), false);
        Ok(true)
    }

    /// [`wait`](Self::wait) for async callers; polls with `tokio::time::sleep`
    /// instead of blocking the worker thread.
    pub async fn wait_async(&self, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        self.order_compute_streams()?;
        let deadline = self.deadline(started, timeout);

        while !self.is_completed()? {
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Err(self.timed_out(started, timeout));
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
        metrics::record_task_wait(started.elapsed().as_secs_f64(), false);
        Ok(true)
    }

    /// Waits with the configured default timeout.
    pub fn synchronize(&self) -> Result<()> {
        self.wait(self.policy.default_timeout).map(|_| ())
    }

    /// Records this task's control event for `ctx`'s place on `ctx`'s stream,
    /// so the task also covers work enqueued there so far.
    pub fn update_wait_chain(&self, ctx: &DeviceContext<B::Stream>) -> Result<()> {
        let index = self.device_set.position(ctx.place()).ok_or_else(|| {
            XcclError::PreconditionNotMet("Cannot find the device context in this task.".to_string())
        })?;
        self.backend
            .record_event(&self.control_events[index], ctx.stream())
    }
}

impl<B: CclBackend> fmt::Debug for CollectiveTask<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectiveTask")
            .field("rank", &self.rank)
            .field("comm_type", &self.comm_type)
            .field("places", &self.device_set.places())
            .field("completed", &self.completed.load(Ordering::Acquire))
            .finish()
    }
}
