//! The unit of data flowing through handler chains.
//!
//! An [`Event`] carries one inbound or outbound unit: message identity, the
//! decoded message object, the raw bytes, opaque tags, a reference to the
//! owning session, and a result code that controls how far down a chain the
//! event travels.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::handler::HandlerChain;
use crate::session::Session;

/// Opaque user value carried on an event or a session.
pub type TagValue = Arc<dyn Any + Send + Sync>;

/// Decoded message object attached to an event.
///
/// Cloning an event shares the object; only the raw payload is deep-copied.
pub type MsgValue = Arc<dyn Any + Send + Sync>;

/// What kind of occurrence an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// No particular kind
    None,
    /// Outbound connection established
    Connected,
    /// Outbound connection attempt failed
    ConnectFailed,
    /// Inbound connection accepted
    Accepted,
    /// Accept failed
    AcceptFailed,
    /// Session closed
    Closed,
    /// Inbound data unit
    Recv,
    /// Outbound data unit
    Send,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::None => "none",
            EventKind::Connected => "connected",
            EventKind::ConnectFailed => "connectfailed",
            EventKind::Accepted => "accepted",
            EventKind::AcceptFailed => "acceptfailed",
            EventKind::Closed => "closed",
            EventKind::Recv => "recv",
            EventKind::Send => "send",
        };
        f.write_str(s)
    }
}

/// Outcome of a handler stage, inspected after every stage invocation.
///
/// Any value other than `Ok` stops the remaining stages of the current
/// chain. `NextChain` is a sentinel, not a failure: it stops the current
/// chain and is then reset to `Ok` so a broadcasting caller carries on with
/// the next chain unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    /// Keep going
    Ok,
    /// Transport-level failure
    SocketError,
    /// Transport deadline expired
    SocketTimeout,
    /// Malformed or truncated frame
    PackageCrack,
    /// Encode/decode failure
    CodecError,
    /// Application asked for the session to close
    RequestClose,
    /// Stop this chain, event is fine
    NextChain,
    /// Request/response correlation timed out (reserved for layers above)
    RpcTimeout,
}

/// One data unit traversing a handler chain.
///
/// Most fields are public scratch space for handler stages; the result code
/// is accessed through [`Event::result`] / [`Event::set_result`] because the
/// chain machinery inspects it after every stage.
pub struct Event {
    /// Event kind
    pub kind: EventKind,
    /// Numeric message identity, codec-defined (0 when unused)
    pub msg_id: u32,
    /// Decoded message object
    pub msg: Option<MsgValue>,
    /// Raw serialized payload
    pub data: Option<Vec<u8>>,
    /// Per-pass scratch tag, cleared when a chain pass finishes
    pub tag: Option<TagValue>,
    /// Tag carried through the whole receive-to-send round trip
    pub transmit_tag: Option<TagValue>,
    /// Per-event override send chain, run instead of the manager's shared
    /// send chain when present
    pub chain_send: Option<Arc<HandlerChain>>,

    session: Option<Arc<Session>>,
    result: EventResult,
}

impl Event {
    /// Create an event of the given kind bound to a session.
    pub fn new(kind: EventKind, session: Option<Arc<Session>>) -> Self {
        Self {
            kind,
            msg_id: 0,
            msg: None,
            data: None,
            tag: None,
            transmit_tag: None,
            chain_send: None,
            session,
            result: EventResult::Ok,
        }
    }

    /// The session this event belongs to, if any.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Current result code.
    pub fn result(&self) -> EventResult {
        self.result
    }

    /// Set the result code. Handler stages communicate failure only through
    /// this channel.
    pub fn set_result(&mut self, result: EventResult) {
        self.result = result;
    }

    /// Identity of the owning session, or 0 when unbound.
    pub fn session_id(&self) -> i64 {
        self.session.as_ref().map(|s| s.id()).unwrap_or(0)
    }

    /// Name of the owning peer, falling back to its address.
    pub fn peer_name(&self) -> String {
        match &self.session {
            Some(ses) => {
                let peer = ses.from_peer();
                let name = peer.name();
                if name.is_empty() {
                    peer.address()
                } else {
                    name
                }
            }
            None => String::new(),
        }
    }

    /// Size of the raw payload in bytes.
    pub fn msg_size(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }
}

/// Clones deep-copy the byte payload and share the decoded object and tags,
/// so chains receiving clones of the same event cannot observe each other's
/// payload mutations. The clone's result always starts at `Ok`, independent
/// of whatever the source chain left behind.
impl Clone for Event {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            msg_id: self.msg_id,
            msg: self.msg.clone(),
            data: self.data.clone(),
            tag: self.tag.clone(),
            transmit_tag: self.transmit_tag.clone(),
            chain_send: self.chain_send.clone(),
            session: self.session.clone(),
            result: EventResult::Ok,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("msg_id", &self.msg_id)
            .field("size", &self.msg_size())
            .field("session", &self.session_id())
            .field("result", &self.result)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_deep_copies_payload() {
        let mut ev = Event::new(EventKind::Recv, None);
        ev.data = Some(vec![1, 2, 3]);

        let clone = ev.clone();
        ev.data.as_mut().unwrap()[0] = 99;

        assert_eq!(clone.data.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_clone_shares_msg_object() {
        let mut ev = Event::new(EventKind::Recv, None);
        let msg: MsgValue = Arc::new(String::from("hello"));
        ev.msg = Some(msg.clone());

        let clone = ev.clone();
        assert!(Arc::ptr_eq(clone.msg.as_ref().unwrap(), &msg));
    }

    #[test]
    fn test_clone_result_starts_ok() {
        let mut ev = Event::new(EventKind::Recv, None);
        ev.set_result(EventResult::SocketError);

        let clone = ev.clone();
        assert_eq!(clone.result(), EventResult::Ok);
        assert_eq!(ev.result(), EventResult::SocketError);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::Recv.to_string(), "recv");
        assert_eq!(EventKind::ConnectFailed.to_string(), "connectfailed");
    }
}
