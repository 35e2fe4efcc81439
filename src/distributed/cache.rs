//! Per-device-set communicator cache.
//!
//! An entry bundles, for every place of a device set, the communicator, a
//! dedicated communication stream wrapped in a [`DeviceContext`] and the
//! event used to order that stream after the compute stream. Entries are
//! created lazily on first use and live as long as the process group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::backend::{CclBackend, DeviceContext};
use super::place::{DeviceSet, Place};
use super::rendezvous::exchange_root_ids;
use super::store::Store;
use crate::utils::error::{Result, XcclError};
use crate::utils::metrics;

/// Resources for one device set, index-aligned with its places.
pub struct CommunicatorEntry<B: CclBackend> {
    device_set: DeviceSet,
    comms: Vec<B::Comm>,
    contexts: Vec<DeviceContext<B::Stream>>,
    events: Vec<B::Event>,
}

impl<B: CclBackend> CommunicatorEntry<B> {
    pub fn device_set(&self) -> &DeviceSet {
        &self.device_set
    }

    pub fn comms(&self) -> &[B::Comm] {
        &self.comms
    }

    pub fn contexts(&self) -> &[DeviceContext<B::Stream>] {
        &self.contexts
    }

    pub fn events(&self) -> &[B::Event] {
        &self.events
    }

    pub fn comm_for(&self, place: &Place) -> Option<&B::Comm> {
        self.device_set.position(place).map(|i| &self.comms[i])
    }

    pub fn context_for(&self, place: &Place) -> Option<&DeviceContext<B::Stream>> {
        self.device_set.position(place).map(|i| &self.contexts[i])
    }
}

impl<B: CclBackend> std::fmt::Debug for CommunicatorEntry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicatorEntry")
            .field("device_set", &self.device_set)
            .finish_non_exhaustive()
    }
}

/// What a rank needs to bootstrap communicators for a new device set.
pub struct Bootstrap<'a, B> {
    pub backend: &'a B,
    pub store: &'a dyn Store,
    pub namespace: &'a str,
    pub gid: i32,
    pub rank: usize,
    pub size: usize,
}

struct CacheState<B: CclBackend> {
    entries: HashMap<String, Arc<CommunicatorEntry<B>>>,
    /// Store index handed to the next root-id exchange of this group.
    next_root_index: usize,
}

pub struct CommunicatorCache<B: CclBackend> {
    state: Mutex<CacheState<B>>,
}

impl<B: CclBackend> Default for CommunicatorCache<B> {
    fn default() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_root_index: 0,
            }),
        }
    }
}

impl<B: CclBackend> CommunicatorCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CommunicatorEntry<B>>> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Returns the entry for `device_set`, creating it on first use.
    ///
    /// The cache lock is held for the whole creation, so concurrent callers
    /// asking for the same key observe exactly one creation.
    pub fn get_or_create(
        &self,
        device_set: &DeviceSet,
        bootstrap: &Bootstrap<'_, B>,
    ) -> Result<Arc<CommunicatorEntry<B>>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(device_set.key()) {
            return Ok(Arc::clone(entry));
        }

        let backend = bootstrap.backend;
        check_places(backend, device_set)?;

        let started = Instant::now();
        let ids = exchange_root_ids(
            bootstrap.store,
            bootstrap.namespace,
            bootstrap.gid,
            bootstrap.rank,
            state.next_root_index,
            1,
            || backend.get_unique_id(),
        )?;
        // The index is spent once published, even if creation fails below.
        state.next_root_index += 1;
        let root_id = ids.into_iter().next().ok_or_else(|| {
            XcclError::Communication("Root id exchange returned no ids".to_string())
        })?;
        let rendezvous_secs = started.elapsed().as_secs_f64();

        let n = device_set.len();
        let nranks = bootstrap.size * n;
        let mut comms = Vec::with_capacity(n);
        let mut contexts = Vec::with_capacity(n);
        let mut events = Vec::with_capacity(n);
        for (i, place) in device_set.places().iter().enumerate() {
            let comm_rank = bootstrap.rank * n + i;
            comms.push(backend.create_communicator(place, nranks, comm_rank, &root_id)?);
            contexts.push(DeviceContext::new(place.clone(), backend.create_stream(place)?));
            events.push(backend.create_event(place)?);
            debug!(place = %place, comm_rank, nranks, "Created communicator");
        }

        let entry = Arc::new(CommunicatorEntry {
            device_set: device_set.clone(),
            comms,
            contexts,
            events,
        });
        state
            .entries
            .insert(device_set.key().to_string(), Arc::clone(&entry));

        metrics::record_communicator_init(rendezvous_secs);
        info!(
            gid = bootstrap.gid,
            rank = bootstrap.rank,
            key = %device_set.key(),
            root_id = %root_id.fingerprint(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Communicators ready for device set"
        );
        Ok(entry)
    }
}

/// Rejects device sets the backend cannot serve, before anything is published.
fn check_places<B: CclBackend>(backend: &B, device_set: &DeviceSet) -> Result<()> {
    for place in device_set.places() {
        if place.device_type() != backend.device_type() {
            return Err(XcclError::PreconditionNotMet(format!(
                "{} is not a {} device",
                place,
                backend.device_type()
            )));
        }
        if place.device_id() >= backend.device_count() {
            return Err(XcclError::PreconditionNotMet(format!(
                "{} is out of range, {} devices visible",
                place,
                backend.device_count()
            )));
        }
    }
    Ok(())
}
