//! Stream-ordered dispatch shared by every collective operation.

use std::sync::Arc;

use tracing::debug;

use super::backend::CclBackend;
use super::cache::CommunicatorEntry;
use super::place::DeviceSet;
use super::process_group::ProcessGroupCustom;
use super::task::CollectiveTask;
use super::tensor::DenseTensor;
use super::CommType;
use crate::utils::error::{Result, XcclError};
use crate::utils::metrics;

impl<B: CclBackend> ProcessGroupCustom<B> {
    /// Issues `issue` once per (input, output) pair on the matching device.
    ///
    /// Without `use_calc_stream` the work goes to the cached comm streams,
    /// ordered after everything already on the compute streams, and the
    /// returned task's control events are recorded after it. With
    /// `use_calc_stream` the work goes straight onto the compute streams and
    /// the task has nothing to wait for.
    pub(crate) fn collective<F>(
        &self,
        inputs: &[DenseTensor],
        outputs: &[DenseTensor],
        comm_type: CommType,
        use_calc_stream: bool,
        mut issue: F,
    ) -> Result<CollectiveTask<B>>
    where
        F: FnMut(&DenseTensor, &DenseTensor, &B::Comm, &B::Stream) -> Result<()>,
    {
        if inputs.len() != outputs.len() {
            return Err(XcclError::InvalidArgument(format!(
                "{} inputs but {} outputs",
                inputs.len(),
                outputs.len()
            )));
        }
        let device_set = DeviceSet::new(inputs.iter().map(|t| t.place().clone()).collect())?;
        let entry = self.cache.get_or_create(&device_set, &self.bootstrap())?;

        if !use_calc_stream {
            self.sync_default_stream(&entry)?;
        }

        let mut task = CollectiveTask::new(
            Arc::clone(&self.backend),
            device_set,
            self.rank,
            comm_type,
            entry.comms().to_vec(),
            self.wait_policy(),
        )?;
        task.set_outputs(outputs.to_vec());

        debug!(
            gid = self.gid,
            rank = self.rank,
            comm_type = %comm_type,
            key = %entry.device_set().key(),
            use_calc_stream,
            "Dispatching collective"
        );

        for ((input, output), (comm, ctx)) in inputs
            .iter()
            .zip(outputs)
            .zip(entry.comms().iter().zip(entry.contexts()))
        {
            if use_calc_stream {
                let stream = self.backend.default_stream(ctx.place())?;
                issue(input, output, comm, &stream)?;
            } else {
                issue(input, output, comm, ctx.stream())?;
            }
        }

        if !use_calc_stream {
            for ctx in entry.contexts() {
                task.update_wait_chain(ctx)?;
            }
        }

        metrics::record_collective(comm_type.as_str());
        Ok(task)
    }

    /// Orders each comm stream after the current tail of its compute stream.
    fn sync_default_stream(&self, entry: &CommunicatorEntry<B>) -> Result<()> {
        for (ctx, event) in entry.contexts().iter().zip(entry.events()) {
            let compute = self.backend.default_stream(ctx.place())?;
            self.backend.record_event(event, &compute)?;
            self.backend.stream_wait_event(ctx.stream(), event)?;
        }
        Ok(())
    }
}
