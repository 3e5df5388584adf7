//! Receiver index table.
//!
//! Every in-progress handshake and every live keypair owns a random 32-bit
//! index. The remote side puts that index in the `receiver` field of the
//! messages it sends us, which is how an incoming datagram is matched to its
//! peer and key without trial decryption. Entries refer to peers weakly; the
//! transport's peer table is the only owner.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::keypair::Keypair;
use crate::sync;

pub(crate) struct IndexEntry<P> {
    pub peer: Weak<P>,
    pub keypair: Option<Arc<Keypair>>,
}

impl<P> Clone for IndexEntry<P> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            keypair: self.keypair.clone(),
        }
    }
}

pub(crate) struct IndexTable<P> {
    table: RwLock<HashMap<u32, IndexEntry<P>>>,
}

impl<P> Default for IndexTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> IndexTable<P> {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a fresh index bound to a handshake attempt of `peer`.
    pub fn new_index_for_handshake(&self, peer: Weak<P>) -> u32 {
        loop {
            let index = rand::random::<u32>();
            // Zero marks "no index" in handshake state.
            if index == 0 {
                continue;
            }
            let mut table = sync::write(&self.table);
            if let Entry::Vacant(slot) = table.entry(index) {
                slot.insert(IndexEntry {
                    peer,
                    keypair: None,
                });
                return index;
            }
        }
    }

    /// Rebind a handshake's index to the keypair it produced.
    pub fn swap_index_for_keypair(&self, index: u32, keypair: Arc<Keypair>) {
        if let Some(entry) = sync::write(&self.table).get_mut(&index) {
            entry.keypair = Some(keypair);
        }
    }

    pub fn delete(&self, index: u32) {
        if index == 0 {
            return;
        }
        sync::write(&self.table).remove(&index);
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry<P>> {
        sync::read(&self.table).get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        sync::read(&self.table).len()
    }
}
