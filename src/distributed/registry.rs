//! Process-wide map from group id to process group.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{info, warn};

use super::backend::CclBackend;
use super::process_group::ProcessGroupCustom;
use super::store::Store;
use super::ProcessGroup;
use crate::utils::config::XcclConfig;
use crate::utils::error::Result;

static PROCESS_GROUPS: OnceLock<RwLock<HashMap<i32, Arc<dyn ProcessGroup>>>> = OnceLock::new();

fn groups() -> &'static RwLock<HashMap<i32, Arc<dyn ProcessGroup>>> {
    PROCESS_GROUPS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers `group` under its gid, replacing any earlier group with that id.
pub fn register(group: Arc<dyn ProcessGroup>) {
    let gid = group.gid();
    if groups().write().insert(gid, group).is_some() {
        warn!(gid, "Replaced an already registered process group");
    }
}

pub fn get(gid: i32) -> Option<Arc<dyn ProcessGroup>> {
    groups().read().get(&gid).cloned()
}

pub fn remove(gid: i32) -> Option<Arc<dyn ProcessGroup>> {
    let removed = groups().write().remove(&gid);
    if removed.is_some() {
        info!(gid, "Process group unregistered");
    }
    removed
}

/// Builds a process group and registers it under `gid`.
pub fn create_process_group_custom<B: CclBackend>(
    store: Arc<dyn Store>,
    backend: Arc<B>,
    rank: usize,
    size: usize,
    gid: i32,
    config: XcclConfig,
) -> Result<Arc<ProcessGroupCustom<B>>> {
    let group = Arc::new(ProcessGroupCustom::new(store, backend, rank, size, gid, config)?);
    register(Arc::clone(&group) as Arc<dyn ProcessGroup>);
    Ok(group)
}
