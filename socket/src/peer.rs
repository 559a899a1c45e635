//! The shared substrate under an acceptor or a connector.
//!
//! A [`Peer`] composes the profile (name/address), socket options, the
//! handler-chain manager, and the session registry. Acceptors and
//! connectors embed one `Arc<Peer>`; every session created against them
//! holds the same handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use crate::chain_manager::HandlerChainManager;
use crate::session::Session;

/// Name and address of a peer.
#[derive(Default)]
pub struct Profile {
    name: RwLock<String>,
    address: RwLock<String>,
}

impl Profile {
    /// Display name.
    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the display name.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    /// Listen or dial address.
    pub fn address(&self) -> String {
        self.address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the listen or dial address.
    pub fn set_address(&self, address: impl Into<String>) {
        *self
            .address
            .write()
            .unwrap_or_else(PoisonError::into_inner) = address.into();
    }
}

/// Socket tuning applied to sessions of a peer.
///
/// Deadlines are re-read before every blocking I/O call, so changing them
/// takes effect without restarting session loops. `None` disables the
/// corresponding deadline.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// Per-read deadline
    pub read_timeout: Option<Duration>,
    /// Per-write deadline
    pub write_timeout: Option<Duration>,
    /// Set TCP_NODELAY on new connections
    pub no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            no_delay: true,
        }
    }
}

/// Concurrent id-to-session map owned by a peer.
///
/// Session ids are allocated from a per-registry counter and never reused.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<i64, Arc<Session>>>,
    id_gen: AtomicI64,
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next session id.
    pub fn allocate_id(&self) -> i64 {
        self.id_gen.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a session under its id.
    pub fn add(&self, session: Arc<Session>) {
        self.lock().insert(session.id(), session);
    }

    /// Remove a session by id.
    pub fn remove(&self, id: i64) -> Option<Arc<Session>> {
        self.lock().remove(&id)
    }

    /// Look up a session by id.
    pub fn get(&self, id: i64) -> Option<Arc<Session>> {
        self.lock().get(&id).cloned()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot of the live sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.lock().values().cloned().collect()
    }

    /// Request close on every live session.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            session.close();
        }
    }
}

/// Shared composition of profile, options, chain manager, and registry.
pub struct Peer {
    profile: Profile,
    options: RwLock<SocketOptions>,
    chains: HandlerChainManager,
    sessions: SessionRegistry,
}

impl Peer {
    /// Create a peer substrate with default options and no chains.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            profile: Profile::default(),
            options: RwLock::new(SocketOptions::default()),
            chains: HandlerChainManager::new(),
            sessions: SessionRegistry::default(),
        })
    }

    /// The peer's name/address profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Display name (profile shorthand).
    pub fn name(&self) -> String {
        self.profile.name()
    }

    /// Listen or dial address (profile shorthand).
    pub fn address(&self) -> String {
        self.profile.address()
    }

    /// The peer's handler-chain manager.
    pub fn chains(&self) -> &HandlerChainManager {
        &self.chains
    }

    /// The peer's session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Current socket options.
    pub fn options(&self) -> SocketOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the socket options.
    pub fn set_options(&self, options: SocketOptions) {
        *self
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner) = options;
    }

    /// Current (read, write) deadlines, sourced fresh for every I/O call.
    pub fn socket_deadline(&self) -> (Option<Duration>, Option<Duration>) {
        let options = self.options.read().unwrap_or_else(PoisonError::into_inner);
        (options.read_timeout, options.write_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_roundtrip() {
        let peer = Peer::new();
        assert!(peer.name().is_empty());

        peer.profile().set_name("gateway");
        peer.profile().set_address("127.0.0.1:7000");
        assert_eq!(peer.name(), "gateway");
        assert_eq!(peer.address(), "127.0.0.1:7000");
    }

    #[test]
    fn test_registry_ids_are_monotonic() {
        let registry = SessionRegistry::default();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);
    }

    #[test]
    fn test_options_reload() {
        let peer = Peer::new();
        assert_eq!(peer.socket_deadline(), (None, None));

        peer.set_options(SocketOptions {
            read_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(2)),
            no_delay: true,
        });
        assert_eq!(
            peer.socket_deadline(),
            (Some(Duration::from_secs(5)), Some(Duration::from_secs(2)))
        );
    }
}
