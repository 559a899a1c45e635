//! Shared test support: a minimal length-prefixed codec and small async
//! helpers used by the session, acceptor, and connector tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::error_to_result;
use crate::event::{Event, EventResult};
use crate::handler::{EventHandler, HandlerChain};

/// Blocking read stage: one u32-BE length prefix, then the payload.
pub(crate) struct FrameRead;

#[async_trait]
impl EventHandler for FrameRead {
    fn label(&self) -> &str {
        "FrameRead"
    }

    async fn call(&self, ev: &mut Event) {
        let Some(ses) = ev.session().cloned() else {
            ev.set_result(EventResult::SocketError);
            return;
        };

        let mut reader = ses.raw_reader().lock().await;
        let mut len = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len).await {
            ev.set_result(error_to_result(&e));
            return;
        }

        let n = u32::from_be_bytes(len) as usize;
        if n > 64 * 1024 {
            ev.set_result(EventResult::PackageCrack);
            return;
        }

        let mut payload = BytesMut::zeroed(n);
        if let Err(e) = reader.read_exact(&mut payload).await {
            ev.set_result(error_to_result(&e));
            return;
        }
        ev.data = Some(payload.to_vec());
    }
}

/// Transmit stage: writes the length prefix and payload to the socket.
pub(crate) struct FrameWrite;

#[async_trait]
impl EventHandler for FrameWrite {
    fn label(&self) -> &str {
        "FrameWrite"
    }

    async fn call(&self, ev: &mut Event) {
        let Some(ses) = ev.session().cloned() else {
            ev.set_result(EventResult::SocketError);
            return;
        };
        let Some(data) = ev.data.as_ref() else {
            ev.set_result(EventResult::CodecError);
            return;
        };

        let mut frame = BytesMut::with_capacity(4 + data.len());
        frame.put_u32(data.len() as u32);
        frame.extend_from_slice(data);

        let mut writer = ses.raw_writer().lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            ev.set_result(error_to_result(&e));
        }
    }
}

/// Encode stage for the shared send chain: turns a `Vec<u8>` message object
/// into the raw payload.
pub(crate) struct EncodeVec;

#[async_trait]
impl EventHandler for EncodeVec {
    fn label(&self) -> &str {
        "EncodeVec"
    }

    async fn call(&self, ev: &mut Event) {
        if ev.data.is_some() {
            return;
        }
        match ev.msg.as_ref().and_then(|m| m.downcast_ref::<Vec<u8>>()) {
            Some(payload) => ev.data = Some(payload.clone()),
            None => ev.set_result(EventResult::CodecError),
        }
    }
}

/// Write stage that always reports a transport failure.
pub(crate) struct FailWrite;

#[async_trait]
impl EventHandler for FailWrite {
    fn label(&self) -> &str {
        "FailWrite"
    }

    async fn call(&self, ev: &mut Event) {
        ev.set_result(EventResult::SocketError);
    }
}

/// Business stage recording every payload it sees.
pub(crate) struct Capture {
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl EventHandler for Capture {
    fn label(&self) -> &str {
        "Capture"
    }

    async fn call(&self, ev: &mut Event) {
        if let Some(data) = ev.data.as_ref() {
            self.seen.lock().unwrap().push(data.clone());
        }
    }
}

pub(crate) fn frame_read_chain() -> HandlerChain {
    HandlerChain::with_stages("read", vec![Arc::new(FrameRead)])
}

pub(crate) fn frame_write_chain() -> HandlerChain {
    HandlerChain::with_stages("write", vec![Arc::new(FrameWrite)])
}

pub(crate) fn encode_chain() -> HandlerChain {
    HandlerChain::with_stages("send", vec![Arc::new(EncodeVec)])
}

pub(crate) fn capture_chain() -> (HandlerChain, Arc<Mutex<Vec<Vec<u8>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let chain = HandlerChain::with_stages("capture", vec![Arc::new(Capture { seen: seen.clone() })]);
    (chain, seen)
}

/// A connected local TCP pair.
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    (accepted.unwrap().0, connected.unwrap())
}

/// Poll a condition until it holds, failing the test after five seconds.
pub(crate) async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
