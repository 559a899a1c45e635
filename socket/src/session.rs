//! One managed live connection.
//!
//! A session runs two independently spawned loops over its TCP connection:
//! the receive loop drives inbound units through the session's private read
//! chain, the send loop drains the outbound queue through the send/write
//! chains. The loops share nothing but the connection and the queue; a
//! supervising task joins both and fires the close callback exactly once.
//!
//! The read chain is expected to contain a stage that performs the blocking
//! socket read (through [`Session::raw_reader`]); the write chain performs
//! the actual byte transmission. Framing is entirely the chains' business.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::event::{Event, EventKind, EventResult, TagValue};
use crate::handler::HandlerChain;
use crate::peer::Peer;
use crate::queue::EventQueue;

type CloseCallback = Box<dyn FnOnce() + Send>;

/// A live connection bound to a peer, with its own receive and send loops.
pub struct Session {
    id: i64,
    peer: Arc<Peer>,
    peer_addr: Option<SocketAddr>,

    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,

    read_chain: HandlerChain,
    write_chain: HandlerChain,

    queue: EventQueue,
    tag: StdMutex<Option<TagValue>>,

    // Signaled by the send loop once it has shut the connection down, so a
    // receive loop parked in a blocked read unwinds deterministically.
    shutdown: Notify,
    write_stopped: AtomicBool,
    on_close: StdMutex<Option<CloseCallback>>,
}

impl Session {
    /// Wrap an established connection into a session against the peer,
    /// pulling a fresh private read chain and write chain from the peer's
    /// chain manager.
    pub(crate) fn bind(peer: &Arc<Peer>, stream: TcpStream) -> Arc<Self> {
        let options = peer.options();
        if options.no_delay {
            let _ = stream.set_nodelay(true);
        }

        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        Arc::new(Self {
            id: peer.sessions().allocate_id(),
            read_chain: peer.chains().create_chain_read(),
            write_chain: peer.chains().create_chain_write(),
            peer: peer.clone(),
            peer_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            queue: EventQueue::new(),
            tag: StdMutex::new(None),
            shutdown: Notify::new(),
            write_stopped: AtomicBool::new(false),
            on_close: StdMutex::new(None),
        })
    }

    /// Install the close-notification callback. Set once at creation by the
    /// owning acceptor/connector; it is the sole deregistration path.
    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        let mut slot = self.on_close.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(callback);
    }

    /// Session identity, unique within the owning peer's registry.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The peer this session was created against.
    pub fn from_peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Remote address of the connection, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Read half of the raw connection, for read-chain codec stages.
    pub fn raw_reader(&self) -> &Mutex<OwnedReadHalf> {
        &self.reader
    }

    /// Write half of the raw connection, for write-chain codec stages.
    pub fn raw_writer(&self) -> &Mutex<OwnedWriteHalf> {
        &self.writer
    }

    /// Attach an opaque user value to the session.
    pub fn set_tag(&self, tag: Option<TagValue>) {
        *self.tag.lock().unwrap_or_else(PoisonError::into_inner) = tag;
    }

    /// The attached user value, if any.
    pub fn tag(&self) -> Option<TagValue> {
        self.tag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue a message for transmission. Events are transmitted in enqueue
    /// order; the manager's shared send chain encodes, the session's write
    /// chain transmits.
    pub fn send<M: Any + Send + Sync>(self: &Arc<Self>, msg: M) {
        let mut ev = Event::new(EventKind::Send, Some(self.clone()));
        ev.msg = Some(Arc::new(msg));
        self.queue.post(ev);
    }

    /// Queue a prepared outbound event (carrying tags, an override send
    /// chain, or pre-encoded data).
    pub fn post_event(&self, ev: Event) {
        self.queue.post(ev);
    }

    /// Request close: enqueues the close sentinel. Idempotent and
    /// non-blocking; repeated calls are harmless.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Start the receive loop, the send loop, and the supervising task that
    /// joins both and fires the close callback exactly once.
    pub(crate) fn run(self: &Arc<Self>) {
        let recv = tokio::spawn(Self::recv_loop(self.clone()));
        let send = tokio::spawn(Self::send_loop(self.clone()));

        let ses = self.clone();
        tokio::spawn(async move {
            let _ = recv.await;
            let _ = send.await;

            debug!("session {} fully stopped", ses.id);
            let callback = {
                let mut slot = ses.on_close.lock().unwrap_or_else(PoisonError::into_inner);
                slot.take()
            };
            if let Some(callback) = callback {
                callback();
            }
        });
    }

    async fn recv_loop(ses: Arc<Session>) {
        if ses.read_chain.is_empty() {
            // Nothing can produce inbound events; park until the send side
            // shuts down instead of spinning over an empty chain.
            warn!("session {} has no read chain installed", ses.id);
            ses.shutdown.notified().await;
        } else {
            loop {
                let mut ev = Event::new(EventKind::Recv, Some(ses.clone()));
                let (read_deadline, _) = ses.peer.socket_deadline();

                let outcome = tokio::select! {
                    biased;

                    _ = ses.shutdown.notified() => None,
                    timed_out = with_deadline(read_deadline, ses.read_chain.call(&mut ev)) => {
                        Some(timed_out)
                    }
                };

                match outcome {
                    None => ev.set_result(EventResult::RequestClose),
                    Some(true) => ev.set_result(EventResult::SocketTimeout),
                    Some(false) => {}
                }

                let result = ev.result();
                if result != EventResult::Ok {
                    debug!("session {} receive loop ending: {:?}", ses.id, result);
                    break;
                }
            }
        }

        // Wind the send loop down too, unless it already initiated shutdown.
        if !ses.write_stopped.load(Ordering::Acquire) {
            ses.close();
        }
        trace!("session {} receive loop done", ses.id);
    }

    async fn send_loop(ses: Arc<Session>) {
        'outer: loop {
            let (batch, will_exit) = ses.queue.pick().await;
            let mut failed = false;

            for mut ev in batch {
                let (_, write_deadline) = ses.peer.socket_deadline();

                // The per-event override wins; otherwise the manager's
                // shared send chain, read fresh on every send.
                let send_chain = ev
                    .chain_send
                    .clone()
                    .or_else(|| ses.peer.chains().chain_send());

                let timed_out = with_deadline(write_deadline, async {
                    if let Some(chain) = send_chain {
                        chain.call(&mut ev).await;
                    }
                    if ev.result() == EventResult::Ok {
                        ses.write_chain.call(&mut ev).await;
                    }
                })
                .await;

                if timed_out {
                    ev.set_result(EventResult::SocketTimeout);
                }
                if ev.result() != EventResult::Ok {
                    debug!(
                        "session {} send failed ({:?}), winding down",
                        ses.id,
                        ev.result()
                    );
                    failed = true;
                }
            }

            if failed || will_exit {
                break 'outer;
            }
        }

        // Whatever exit path was taken, stop accepting posts and drop any
        // backlog: queued events hold an `Arc<Session>` back into this
        // session, and the consumer is gone.
        ses.queue.discard();
        ses.write_stopped.store(true, Ordering::Release);

        // Physically shut the connection down; combined with the shutdown
        // signal this forces a blocked read in the receive loop to unwind.
        {
            let mut writer = ses.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        ses.shutdown.notify_one();
        trace!("session {} send loop done", ses.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Run a future under an optional deadline, reporting whether it elapsed.
async fn with_deadline<F>(deadline: Option<Duration>, fut: F) -> bool
where
    F: Future<Output = ()>,
{
    match deadline {
        Some(d) => timeout(d, fut).await.is_err(),
        None => {
            fut.await;
            false
        }
    }
}
