//! Multi-device collective communication coordinator.
//!
//! A [`distributed::ProcessGroupCustom`] owns per-device-set communicators,
//! dedicated communication streams and synchronization events, schedules
//! collectives onto those streams and hands back pollable
//! [`distributed::CollectiveTask`]s.

pub mod distributed;
pub mod utils;
