//! Listening side of a peer.
//!
//! The acceptor runs one blocking accept loop; every accepted connection is
//! handed to its own setup task so a slow handshake or chain construction
//! never delays the next accept.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::PeerError;
use crate::event::{Event, EventKind};
use crate::peer::Peer;
use crate::session::Session;

/// Accepts inbound connections and turns each into a managed session.
pub struct Acceptor {
    peer: Arc<Peer>,
    shutdown: Notify,
    running: AtomicBool,
    local_addr: StdMutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Create an acceptor over a fresh peer substrate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: Peer::new(),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            local_addr: StdMutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// The peer substrate shared by all sessions of this acceptor.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the listener actually bound to (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the listening socket and launch the accept loop. Calling start
    /// on an already-running acceptor is a no-op.
    pub async fn start(self: &Arc<Self>, address: &str) -> Result<(), PeerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(source) => {
                self.running.store(false, Ordering::Release);
                return Err(PeerError::Bind {
                    addr: address.to_string(),
                    source,
                });
            }
        };

        self.peer.profile().set_address(address);
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = listener.local_addr().ok();

        let this = self.clone();
        let handle = tokio::spawn(this.accept_loop(listener));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!(
            "accepting connections on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| self.peer.address())
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("listener shut down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("accepted connection from {}", remote);
                        let peer = self.peer.clone();
                        // Independent setup task, so one connection's chain
                        // construction never stalls the accept loop.
                        tokio::spawn(async move {
                            on_accepted(peer, stream).await;
                        });
                    }
                    Err(e) => {
                        error!("accept failed: {}", PeerError::Accept(e));
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
    }

    /// Close the listener and wait for the accept loop to exit. Live
    /// sessions are not torn down; that policy belongs to the caller.
    /// A no-op when no accept loop is running, so a stray stop cannot
    /// leave a stored shutdown permit behind for the next start.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.shutdown.notify_one();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn on_accepted(peer: Arc<Peer>, stream: TcpStream) {
    let ses = Session::bind(&peer, stream);
    peer.sessions().add(ses.clone());

    let registry_peer = peer.clone();
    let id = ses.id();
    ses.set_close_callback(Box::new(move || {
        registry_peer.sessions().remove(id);
    }));

    // Announce the new session to the registered receive chains before any
    // data flows.
    let ev = Event::new(EventKind::Accepted, Some(ses.clone()));
    peer.chains().chain_list_recv().call(&ev).await;

    ses.run();
}
