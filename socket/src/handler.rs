//! Handler stages and ordered chains.
//!
//! A [`HandlerChain`] is an ordered pipeline of stages invoked over an
//! [`Event`]. Chains are assembled up front and never reordered afterwards;
//! to change the stages of an installed chain, build a new chain and replace
//! the old one. A [`HandlerChainList`] broadcasts an event to several chains
//! by handing each one its own clone.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::event::{Event, EventResult};

/// One processing stage in a handler chain.
///
/// Stages communicate failure only by setting the event's result code;
/// anything other than `Ok` stops the remaining stages of the chain.
/// Every stage exposes a stable label used for chain display and logging.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable display name of this stage.
    fn label(&self) -> &str;

    /// Process one event. Codec stages may perform socket I/O through the
    /// event's session here.
    async fn call(&self, ev: &mut Event);
}

/// An ordered, immutable-after-construction pipeline of stages.
pub struct HandlerChain {
    label: String,
    stages: Vec<Arc<dyn EventHandler>>,
}

impl HandlerChain {
    /// Create an empty chain with a debug label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stages: Vec::new(),
        }
    }

    /// Create a chain from a label and a prepared stage list.
    pub fn with_stages(label: impl Into<String>, stages: Vec<Arc<dyn EventHandler>>) -> Self {
        Self {
            label: label.into(),
            stages,
        }
    }

    /// Append one stage. Only meaningful while the chain is being built;
    /// installed chains live behind `Arc` and cannot be mutated.
    pub fn add(&mut self, stage: Arc<dyn EventHandler>) {
        self.stages.push(stage);
    }

    /// Append several stages in order.
    pub fn add_batch(&mut self, stages: impl IntoIterator<Item = Arc<dyn EventHandler>>) {
        self.stages.extend(stages);
    }

    /// The chain's debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the stages in order over the event.
    ///
    /// After every stage the event's result is inspected: `NextChain` stops
    /// this chain and is reset to `Ok` so a broadcasting caller continues
    /// with the next chain; any other non-`Ok` value stops this chain and is
    /// left in place for the caller to judge. The per-pass scratch tag is
    /// cleared once the pass finishes.
    pub async fn call(&self, ev: &mut Event) {
        for stage in &self.stages {
            trace!(chain = %self.label, stage = stage.label(), event = ?ev, "invoking stage");
            stage.call(ev).await;

            match ev.result() {
                EventResult::Ok => {}
                EventResult::NextChain => {
                    ev.set_result(EventResult::Ok);
                    break;
                }
                _ => break,
            }
        }

        ev.tag = None;
    }
}

impl fmt::Display for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.label)?;
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 {
                f.write_str(" -> ")?;
            }
            f.write_str(stage.label())?;
        }
        Ok(())
    }
}

/// A set of chains an event is broadcast to.
#[derive(Clone, Default)]
pub struct HandlerChainList(Vec<Arc<HandlerChain>>);

impl HandlerChainList {
    /// Create a list from prepared chains.
    pub fn new(chains: Vec<Arc<HandlerChain>>) -> Self {
        Self(chains)
    }

    /// Broadcast the event to every chain in the list.
    ///
    /// Each chain gets its own clone, so one chain's mutations and final
    /// result never leak into another's.
    pub async fn call(&self, ev: &Event) {
        for chain in &self.0 {
            let mut cloned = ev.clone();
            chain.call(&mut cloned).await;
        }
    }

    /// Iterate the chains.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<HandlerChain>> {
        self.0.iter()
    }

    /// Number of chains.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HandlerChainList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chain in &self.0 {
            writeln!(f, "{}", chain)?;
        }
        Ok(())
    }
}

/// Terminal stage for a session read chain: fans the decoded event out to
/// every receive chain registered on the owning peer.
pub struct RecvBroadcast;

#[async_trait]
impl EventHandler for RecvBroadcast {
    fn label(&self) -> &str {
        "RecvBroadcast"
    }

    async fn call(&self, ev: &mut Event) {
        if let Some(ses) = ev.session() {
            let chains = ses.from_peer().chains().chain_list_recv();
            chains.call(ev).await;
        }
    }
}
