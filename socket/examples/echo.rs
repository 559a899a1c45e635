//! Echo demo: an acceptor and a connector talking in one process.
//!
//! Frames on the wire are a u32-BE length prefix plus payload. The codec
//! lives entirely in handler stages, which is how the core keeps framing
//! pluggable: `FrameRead` pulls one frame off the socket, `EncodeBytes`
//! turns a message object into raw bytes, `FrameWrite` transmits them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::info;

use peerline_socket::{
    error_to_result, Acceptor, Connector, Event, EventHandler, EventKind, EventResult,
    HandlerChain, Peer, RecvBroadcast,
};

/// Read one length-prefixed frame from the session's socket.
struct FrameRead;

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

/// Transmit the event's payload as one length-prefixed frame.
struct FrameWrite;

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

/// Shared send chain stage: a `Vec<u8>` message object becomes the payload.
struct EncodeBytes;

#[async_trait]
impl EventHandler for EncodeBytes {
    fn label(&self) -> &str {
        "EncodeBytes"
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

/// Server-side business stage: send every inbound payload straight back.
struct EchoLogic;

#[async_trait]
impl EventHandler for EchoLogic {
    fn label(&self) -> &str {
        "EchoLogic"
    }

    async fn call(&self, ev: &mut Event) {
        if ev.kind != EventKind::Recv {
            return;
        }
        if let (Some(ses), Some(data)) = (ev.session(), ev.data.as_ref()) {
            info!("server echoing {} bytes to session {}", data.len(), ses.id());
            ses.send(data.clone());
        }
    }
}

/// Client-side business stage: hand replies to the main task.
struct ReplySink {
    replies: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl EventHandler for ReplySink {
    fn label(&self) -> &str {
        "ReplySink"
    }

    async fn call(&self, ev: &mut Event) {
        if ev.kind != EventKind::Recv {
            return;
        }
        if let Some(data) = ev.data.as_ref() {
            let _ = self.replies.send(data.clone()).await;
        }
    }
}

fn install_codec(peer: &Arc<Peer>) {
    peer.chains().set_read_write_chain(
        Some(Arc::new(|| {
            HandlerChain::with_stages("read", vec![Arc::new(FrameRead), Arc::new(RecvBroadcast)])
        })),
        Some(Arc::new(|| {
            HandlerChain::with_stages("write", vec![Arc::new(FrameWrite)])
        })),
    );
    peer.chains()
        .set_chain_send(HandlerChain::with_stages("send", vec![Arc::new(EncodeBytes)]));
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Server side
    let acceptor = Acceptor::new();
    acceptor.peer().profile().set_name("echo-server");
    install_codec(acceptor.peer());
    acceptor
        .peer()
        .chains()
        .add_chain_recv(HandlerChain::with_stages("logic", vec![Arc::new(EchoLogic)]));
    acceptor.start("127.0.0.1:0").await?;
    let address = acceptor
        .local_addr()
        .expect("listener bound")
        .to_string();
    info!("echo server listening on {}", address);

    // Client side
    let (reply_tx, mut reply_rx) = mpsc::channel(8);
    let connector = Connector::new();
    connector.peer().profile().set_name("echo-client");
    install_codec(connector.peer());
    connector.peer().chains().add_chain_recv(HandlerChain::with_stages(
        "logic",
        vec![Arc::new(ReplySink { replies: reply_tx })],
    ));
    connector.start(&address).await;

    // Wait for the session, then round-trip one message.
    let session = loop {
        if let Some(session) = connector.default_session() {
            break session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    session.send(b"hello, peerline".to_vec());

    let reply = tokio::time::timeout(Duration::from_secs(5), reply_rx.recv())
        .await?
        .expect("reply channel open");
    info!("client got echo: {:?}", String::from_utf8_lossy(&reply));

    connector.stop().await;
    acceptor.stop().await;
    Ok(())
}
