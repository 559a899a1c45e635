//! Dialing side of a peer.
//!
//! One connector owns one outbound connection at a time and a connect/retry
//! state machine: Idle → Connecting → Connected → Disconnected, looping
//! through a retry wait while auto-reconnect is enabled, or stopping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{Event, EventKind};
use crate::peer::Peer;
use crate::session::Session;

/// Connect failures are reported at warn level only this many times per
/// outage, to keep persistent outages from flooding the log.
const REPORT_CONNECT_FAILED_LIMIT: u32 = 3;

/// Maintains a single outbound session, reconnecting on loss when
/// configured to.
pub struct Connector {
    peer: Arc<Peer>,
    reconnect_secs: AtomicU64,
    running: AtomicBool,
    stopping: AtomicBool,
    stop_signal: StdMutex<Arc<Notify>>,
    default_session: StdMutex<Option<Arc<Session>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Create a connector over a fresh peer substrate. Auto-reconnect is
    /// disabled by default.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: Peer::new(),
            reconnect_secs: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop_signal: StdMutex::new(Arc::new(Notify::new())),
            default_session: StdMutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// The peer substrate shared by this connector's sessions.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Seconds to wait between reconnect attempts; 0 disables reconnect.
    pub fn set_auto_reconnect_secs(&self, secs: u64) {
        self.reconnect_secs.store(secs, Ordering::Relaxed);
    }

    /// Current auto-reconnect interval in seconds.
    pub fn auto_reconnect_secs(&self) -> u64 {
        self.reconnect_secs.load(Ordering::Relaxed)
    }

    /// The currently active outbound session, if connected.
    pub fn default_session(&self) -> Option<Arc<Session>> {
        self.default_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the connect/retry loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Launch the connect/retry loop against the address. A no-op while the
    /// loop is already running or while a stop is still winding the previous
    /// loop down — two loops never overlap; retry once the stop has returned.
    pub async fn start(self: &Arc<Self>, address: &str) {
        let mut slot = self.task.lock().await;
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        if let Some(previous) = slot.take() {
            if !previous.is_finished() {
                *slot = Some(previous);
                return;
            }
            let _ = previous.await;
        }

        let stop = Arc::new(Notify::new());
        *self
            .stop_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = stop.clone();
        self.stopping.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        self.peer.profile().set_address(address);

        let this = self.clone();
        let address = address.to_string();
        *slot = Some(tokio::spawn(this.connect_loop(address, stop)));
    }

    async fn connect_loop(self: Arc<Self>, address: String, stop: Arc<Notify>) {
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        let mut attempts: u32 = 0;

        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            attempts += 1;

            let connected = tokio::select! {
                _ = stop.notified() => break,
                connected = TcpStream::connect(&address) => connected,
            };

            match connected {
                Err(e) => {
                    if attempts <= REPORT_CONNECT_FAILED_LIMIT {
                        warn!("connect to {} failed (attempt {}): {}", address, attempts, e);
                        if attempts == REPORT_CONNECT_FAILED_LIMIT {
                            warn!(
                                "connect to {} keeps failing; further failures logged at debug",
                                address
                            );
                        }
                    } else {
                        debug!("connect to {} failed (attempt {}): {}", address, attempts, e);
                    }

                    let secs = self.reconnect_secs.load(Ordering::Relaxed);
                    if secs == 0 {
                        break;
                    }
                    if self.sleep_or_stop(&stop, secs).await {
                        break;
                    }
                }

                Ok(stream) => {
                    attempts = 0;

                    let ses = Session::bind(&self.peer, stream);
                    *self
                        .default_session
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(ses.clone());
                    self.peer.sessions().add(ses.clone());

                    // Deregistration and the loop's close handoff share the
                    // one callback invocation.
                    let registry_peer = self.peer.clone();
                    let id = ses.id();
                    let tx = close_tx.clone();
                    ses.set_close_callback(Box::new(move || {
                        registry_peer.sessions().remove(id);
                        let _ = tx.try_send(());
                    }));

                    let ev = Event::new(EventKind::Connected, Some(ses.clone()));
                    self.peer.chains().chain_list_recv().call(&ev).await;

                    ses.run();
                    info!("connected to {} (session {})", address, id);

                    // A stop may have raced session creation; make sure the
                    // shutdown cascade still happens.
                    if self.stopping.load(Ordering::Acquire) {
                        ses.close();
                    }

                    // Park until this session's close is observed.
                    let _ = close_rx.recv().await;
                    *self
                        .default_session
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = None;

                    let secs = self.reconnect_secs.load(Ordering::Relaxed);
                    if self.stopping.load(Ordering::Acquire) || secs == 0 {
                        break;
                    }
                    info!("session to {} closed; reconnecting in {}s", address, secs);
                    if self.sleep_or_stop(&stop, secs).await {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
        debug!("connect loop for {} exited", address);
    }

    /// Retry-wait that a stop request can cut short. Returns true when the
    /// loop should terminate.
    async fn sleep_or_stop(&self, stop: &Notify, secs: u64) -> bool {
        tokio::select! {
            _ = stop.notified() => true,
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                self.stopping.load(Ordering::Acquire)
            }
        }
    }

    /// Request shutdown: closes the active session if any and blocks until
    /// the connect/retry loop has fully exited. A no-op when the connector
    /// is not running or a stop is already in progress.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        // Signal and claim the loop handle under the task lock, so a
        // concurrent start cannot swap in a fresh loop (with a fresh stop
        // signal) between the signal and the join.
        let handle = {
            let mut slot = self.task.lock().await;
            if self.stopping.swap(true, Ordering::AcqRel) {
                return;
            }
            let stop = self
                .stop_signal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            stop.notify_one();

            if let Some(ses) = self.default_session() {
                ses.close();
            }
            slot.take()
        };

        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // The joined loop may have exited (and reset the flag) before this
        // stop raised it; clear it so a later start is not refused.
        self.stopping.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::Acceptor;
    use crate::testkit::{frame_read_chain, frame_write_chain, wait_for};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};

    /// An address nothing listens on: bind, note the port, drop the
    /// listener.
    async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    fn wire_codec(peer: &Arc<Peer>) {
        peer.chains()
            .set_read_write_chain(Some(Arc::new(frame_read_chain)), Some(Arc::new(frame_write_chain)));
    }

    #[tokio::test]
    async fn test_single_attempt_without_reconnect() {
        let address = dead_address().await;
        let connector = Connector::new();
        wire_codec(connector.peer());

        connector.start(&address).await;
        wait_for(|| !connector.is_running()).await;
        assert!(connector.default_session().is_none());
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry_wait() {
        let address = dead_address().await;
        let connector = Connector::new();
        wire_codec(connector.peer());
        connector.set_auto_reconnect_secs(60);

        connector.start(&address).await;
        assert!(connector.is_running());

        // The loop is asleep between attempts; stop must still return.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(5), connector.stop())
            .await
            .expect("stop should not hang");
        assert!(!connector.is_running());
    }

    #[tokio::test]
    async fn test_connect_and_stop_cascades_session_close() {
        let acceptor = Acceptor::new();
        wire_codec(acceptor.peer());
        acceptor.start("127.0.0.1:0").await.unwrap();
        let address = acceptor.local_addr().unwrap().to_string();

        let connector = Connector::new();
        wire_codec(connector.peer());
        connector.start(&address).await;

        wait_for(|| connector.default_session().is_some()).await;
        assert_eq!(connector.peer().sessions().count(), 1);

        connector.stop().await;
        assert!(!connector.is_running());
        assert!(connector.default_session().is_none());
        assert_eq!(connector.peer().sessions().count(), 0);

        acceptor.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_after_session_loss() {
        let acceptor = Acceptor::new();
        wire_codec(acceptor.peer());
        acceptor.start("127.0.0.1:0").await.unwrap();
        let address = acceptor.local_addr().unwrap().to_string();

        let connector = Connector::new();
        wire_codec(connector.peer());
        connector.set_auto_reconnect_secs(1);
        connector.start(&address).await;

        wait_for(|| connector.default_session().is_some()).await;
        let first_id = connector.default_session().unwrap().id();

        // Drop the live session; the loop should dial again after the
        // interval.
        connector.default_session().unwrap().close();
        wait_for(|| {
            connector
                .default_session()
                .map(|s| s.id() != first_id)
                .unwrap_or(false)
        })
        .await;

        connector.stop().await;
        acceptor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_racing_restart_does_not_hang() {
        let acceptor = Acceptor::new();
        wire_codec(acceptor.peer());
        acceptor.start("127.0.0.1:0").await.unwrap();
        let address = acceptor.local_addr().unwrap().to_string();

        let connector = Connector::new();
        wire_codec(connector.peer());
        connector.set_auto_reconnect_secs(1);

        // Whatever the interleaving, stop must join the loop whose stop
        // signal it fired, never a loop a concurrent start swapped in.
        for _ in 0..5 {
            connector.start(&address).await;
            wait_for(|| connector.default_session().is_some()).await;

            let restarter = {
                let connector = connector.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    connector.start(&address).await;
                })
            };
            tokio::time::timeout(Duration::from_secs(5), connector.stop())
                .await
                .expect("stop must not outlive the loop it signaled");
            restarter.await.unwrap();
        }

        connector.stop().await;
        acceptor.stop().await;
    }

    fn connector_target() -> &'static str {
        module_path!().trim_end_matches("::tests")
    }

    struct LevelCounter {
        warns: Arc<AtomicUsize>,
        debugs: Arc<AtomicUsize>,
    }

    impl<S: tracing::Subscriber> Layer<S> for LevelCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
            if event.metadata().target() != connector_target() {
                return;
            }
            let level = *event.metadata().level();
            if level == tracing::Level::WARN {
                self.warns.fetch_add(1, Ordering::SeqCst);
            } else if level == tracing::Level::DEBUG {
                self.debugs.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_warnings_are_bounded() {
        let warns = Arc::new(AtomicUsize::new(0));
        let debugs = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(LevelCounter {
            warns: warns.clone(),
            debugs: debugs.clone(),
        });
        let _guard = tracing::subscriber::set_default(subscriber);

        let address = dead_address().await;
        let connector = Connector::new();
        wire_codec(connector.peer());
        connector.set_auto_reconnect_secs(1);
        connector.start(&address).await;

        // Attempts past the report limit are demoted to debug; wait until
        // one of those has happened, then the warn tally is final.
        wait_for(|| debugs.load(Ordering::SeqCst) >= 1).await;
        connector.stop().await;

        // Three per-attempt warnings plus the one suppression notice.
        assert_eq!(warns.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let acceptor = Acceptor::new();
        wire_codec(acceptor.peer());
        acceptor.start("127.0.0.1:0").await.unwrap();
        let address = acceptor.local_addr().unwrap().to_string();

        let connector = Connector::new();
        wire_codec(connector.peer());

        connector.start(&address).await;
        wait_for(|| connector.default_session().is_some()).await;
        connector.stop().await;
        assert!(!connector.is_running());

        connector.start(&address).await;
        wait_for(|| connector.default_session().is_some()).await;
        connector.stop().await;

        acceptor.stop().await;
    }
}
