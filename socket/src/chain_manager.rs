//! Per-peer ownership of handler chains.
//!
//! The manager holds the dynamic set of receive chains an inbound event is
//! broadcast to, the single shared send chain, and the factories that stamp
//! out a private read chain and write chain for every new session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::handler::{HandlerChain, HandlerChainList};

/// Factory producing a fresh chain for each new session.
pub type ChainFactory = Arc<dyn Fn() -> HandlerChain + Send + Sync>;

#[derive(Default)]
struct RecvChains {
    by_id: HashMap<i64, Arc<HandlerChain>>,
    // Registration ids are per-manager and never reused.
    next_id: i64,
    dirty: bool,
    flat: HandlerChainList,
}

#[derive(Default)]
struct ChainFactories {
    read: Option<ChainFactory>,
    write: Option<ChainFactory>,
}

/// Owns the chains attached to one peer.
#[derive(Default)]
pub struct HandlerChainManager {
    recv: Mutex<RecvChains>,
    send: RwLock<Option<Arc<HandlerChain>>>,
    factories: RwLock<ChainFactories>,
}

impl HandlerChainManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receive chain, returning its registration id.
    ///
    /// The id is a per-manager sequence number, distinct from the chain's
    /// own debug label.
    pub fn add_chain_recv(&self, chain: HandlerChain) -> i64 {
        let mut recv = self.recv.lock().unwrap_or_else(PoisonError::into_inner);
        recv.next_id += 1;
        let id = recv.next_id;
        recv.by_id.insert(id, Arc::new(chain));
        recv.dirty = true;
        id
    }

    /// Remove a receive chain by its registration id. Removing an unknown
    /// or stale id is a no-op.
    pub fn remove_chain_recv(&self, id: i64) {
        let mut recv = self.recv.lock().unwrap_or_else(PoisonError::into_inner);
        recv.by_id.remove(&id);
        recv.dirty = true;
    }

    /// Whether a receive chain is registered under the given id.
    pub fn chain_recv_exists(&self, id: i64) -> bool {
        let recv = self.recv.lock().unwrap_or_else(PoisonError::into_inner);
        recv.by_id.contains_key(&id)
    }

    /// Snapshot of the registered receive chains (order not significant).
    ///
    /// The flattened list is rebuilt lazily on the first read after a
    /// mutation; the rebuild happens under the same lock as mutation, so a
    /// reader never observes a partially built list.
    pub fn chain_list_recv(&self) -> HandlerChainList {
        let mut recv = self.recv.lock().unwrap_or_else(PoisonError::into_inner);
        if recv.dirty {
            recv.flat = HandlerChainList::new(recv.by_id.values().cloned().collect());
            recv.dirty = false;
        }
        recv.flat.clone()
    }

    /// Replace the shared send chain.
    pub fn set_chain_send(&self, chain: HandlerChain) {
        let mut send = self.send.write().unwrap_or_else(PoisonError::into_inner);
        *send = Some(Arc::new(chain));
    }

    /// The shared send chain, read on every send.
    pub fn chain_send(&self) -> Option<Arc<HandlerChain>> {
        let send = self.send.read().unwrap_or_else(PoisonError::into_inner);
        send.clone()
    }

    /// Install the per-session read/write chain factories. Passing `None`
    /// leaves the corresponding factory unchanged.
    pub fn set_read_write_chain(&self, read: Option<ChainFactory>, write: Option<ChainFactory>) {
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(read) = read {
            factories.read = Some(read);
        }
        if let Some(write) = write {
            factories.write = Some(write);
        }
    }

    /// Produce a fresh read chain for a new session.
    pub fn create_chain_read(&self) -> HandlerChain {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match &factories.read {
            Some(factory) => factory(),
            None => HandlerChain::new("read"),
        }
    }

    /// Produce a fresh write chain for a new session.
    pub fn create_chain_write(&self) -> HandlerChain {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match &factories.write {
            Some(factory) => factory(),
            None => HandlerChain::new("write"),
        }
    }
}
