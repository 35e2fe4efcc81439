//! Root-id exchange through the rendezvous store.
//!
//! Rank 0 generates the ids and publishes them under
//! `<namespace>/ccl_ids/<gid>/<index>`; every other rank blocks on the store
//! for each index in ascending order.

use std::fmt;

use sha2::{Digest, Sha256};
use tracing::debug;

use super::store::Store;
use crate::utils::error::{Result, XcclError};

pub const ROOT_ID_BYTES: usize = 128;

/// Opaque identifier bootstrapping one communicator clique.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId([u8; ROOT_ID_BYTES]);

impl RootId {
    pub fn from_array(bytes: [u8; ROOT_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ROOT_ID_BYTES] = bytes.try_into().map_err(|_| {
            XcclError::Store(format!(
                "Invalid root id length: expected {}, got {}",
                ROOT_ID_BYTES,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Short SHA-256 prefix, enough to correlate ids across rank logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootId({})", self.fingerprint())
    }
}

pub fn root_id_key(namespace: &str, gid: i32, index: usize) -> String {
    format!("{}/ccl_ids/{}/{}", namespace, gid, index)
}

/// Exchanges `count` root ids occupying indices `first_index..first_index + count`.
///
/// `generate` is only invoked on rank 0. Other ranks block until rank 0 has
/// published every index; there is no timeout here.
pub fn exchange_root_ids<F>(
    store: &dyn Store,
    namespace: &str,
    gid: i32,
    rank: usize,
    first_index: usize,
    count: usize,
    mut generate: F,
) -> Result<Vec<RootId>>
where
    F: FnMut() -> Result<RootId>,
{
    let mut ids = Vec::with_capacity(count);
    for index in first_index..first_index + count {
        let key = root_id_key(namespace, gid, index);
        let id = if rank == 0 {
            let id = generate()?;
            store.set(&key, id.as_bytes())?;
            id
        } else {
            RootId::from_bytes(&store.get(&key)?)?
        };
        debug!(rank, key = %key, root_id = %id.fingerprint(), "Exchanged root id");
        ids.push(id);
    }
    Ok(ids)
}
