//! The message channel.
//!
//! Sending is fire-and-forget: [`ResearcherChannel`] and [`NodeChannel`] only hand a message to the
//! transport. Delivery happens through an [`Inbox`], which yields the messages in whatever order
//! the transport delivers them.
//!
//! [`LocalBus`] is an in-process transport. Messages are carried as JSON, like on a real wire, so
//! the peers never share memory.

use std::{
    collections::HashMap,
    marker::PhantomData,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use displaydoc::Display;
use futures::Stream;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    common::{NodeId, ResearcherId},
    message::{NodeMessage, ResearcherMessage},
};

/// Errors which can occur while sending a message.
#[derive(Debug, Display, Error)]
pub enum ChannelError {
    /// No route to {0}.
    UnknownDestination(String),
    /// The inbox of {0} has been closed.
    Closed(String),
    /// Failed to encode the message: {0}.
    Encoding(#[from] serde_json::Error),
    /// The routing table is poisoned.
    Poisoned,
}

/// The sending half of the researcher.
pub trait ResearcherChannel: Send + Sync {
    /// Sends a message to one node.
    ///
    /// # Errors
    /// Fails if the node can't be reached.
    fn send_to_node(&self, node: &NodeId, msg: ResearcherMessage) -> Result<(), ChannelError>;

    /// Sends a message to every connected node.
    fn broadcast(&self, msg: ResearcherMessage) -> Result<(), ChannelError>;
}

/// The sending half of a node.
pub trait NodeChannel: Send + Sync {
    /// Sends a message to a researcher.
    ///
    /// # Errors
    /// Fails if the researcher can't be reached.
    fn send_to_researcher(
        &self,
        researcher: &ResearcherId,
        msg: NodeMessage,
    ) -> Result<(), ChannelError>;
}

/// The receiving half of a peer.
///
/// Payloads which don't decode into `M` are logged and skipped.
pub struct Inbox<M> {
    rx: mpsc::UnboundedReceiver<String>,
    _message: PhantomData<fn() -> M>,
}

impl<M> From<mpsc::UnboundedReceiver<String>> for Inbox<M> {
    fn from(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            rx,
            _message: PhantomData,
        }
    }
}

impl<M> Inbox<M>
where
    M: DeserializeOwned,
{
    /// Receives the next message. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            let payload = self.rx.recv().await?;
            if let Some(msg) = decode(&payload) {
                return Some(msg);
            }
        }
    }

    /// Receives a message if one is ready.
    pub fn try_recv(&mut self) -> Option<M> {
        while let Ok(payload) = self.rx.try_recv() {
            if let Some(msg) = decode(&payload) {
                return Some(msg);
            }
        }
        None
    }
}

fn decode<M: DeserializeOwned>(payload: &str) -> Option<M> {
    match serde_json::from_str(payload) {
        Ok(msg) => Some(msg),
        Err(err) => {
            warn!("dropping malformed message: {}", err);
            None
        }
    }
}

impl<M> Stream for Inbox<M>
where
    M: DeserializeOwned,
{
    type Item = M;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.rx).poll_recv(cx) {
                Poll::Ready(Some(payload)) => {
                    if let Some(msg) = decode(&payload) {
                        return Poll::Ready(Some(msg));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(Default)]
struct Routes {
    researchers: HashMap<ResearcherId, mpsc::UnboundedSender<String>>,
    nodes: HashMap<NodeId, mpsc::UnboundedSender<String>>,
}

/// An in-process transport connecting researchers and nodes.
#[derive(Clone, Default)]
pub struct LocalBus {
    routes: Arc<Mutex<Routes>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a researcher and returns its inbox.
    pub fn connect_researcher(&self, id: ResearcherId) -> Result<Inbox<NodeMessage>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("researcher {} connected", id);
        self.routes
            .lock()
            .map_err(|_| ChannelError::Poisoned)?
            .researchers
            .insert(id, tx);
        Ok(rx.into())
    }

    /// Connects a node and returns its inbox.
    pub fn connect_node(&self, id: NodeId) -> Result<Inbox<ResearcherMessage>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("node {} connected", id);
        self.routes
            .lock()
            .map_err(|_| ChannelError::Poisoned)?
            .nodes
            .insert(id, tx);
        Ok(rx.into())
    }

    /// Disconnects a node. Its inbox terminates once drained.
    pub fn disconnect_node(&self, id: &NodeId) -> Result<(), ChannelError> {
        debug!("node {} disconnected", id);
        self.routes
            .lock()
            .map_err(|_| ChannelError::Poisoned)?
            .nodes
            .remove(id);
        Ok(())
    }

    /// Sends a raw payload to a researcher.
    pub fn send_raw_to_researcher(
        &self,
        researcher: &ResearcherId,
        payload: String,
    ) -> Result<(), ChannelError> {
        let routes = self.routes.lock().map_err(|_| ChannelError::Poisoned)?;
        let tx = routes
            .researchers
            .get(researcher)
            .ok_or_else(|| ChannelError::UnknownDestination(researcher.to_string()))?;
        tx.send(payload)
            .map_err(|_| ChannelError::Closed(researcher.to_string()))
    }
}

fn encode<M: Serialize>(msg: &M) -> Result<String, ChannelError> {
    Ok(serde_json::to_string(msg)?)
}

impl ResearcherChannel for LocalBus {
    fn send_to_node(&self, node: &NodeId, msg: ResearcherMessage) -> Result<(), ChannelError> {
        let payload = encode(&msg)?;
        let routes = self.routes.lock().map_err(|_| ChannelError::Poisoned)?;
        let tx = routes
            .nodes
            .get(node)
            .ok_or_else(|| ChannelError::UnknownDestination(node.to_string()))?;
        tx.send(payload)
            .map_err(|_| ChannelError::Closed(node.to_string()))
    }

    fn broadcast(&self, msg: ResearcherMessage) -> Result<(), ChannelError> {
        let payload = encode(&msg)?;
        let routes = self.routes.lock().map_err(|_| ChannelError::Poisoned)?;
        for (node, tx) in routes.nodes.iter() {
            if tx.send(payload.clone()).is_err() {
                debug!("skipping closed inbox of node {}", node);
            }
        }
        Ok(())
    }
}

impl NodeChannel for LocalBus {
    fn send_to_researcher(
        &self,
        researcher: &ResearcherId,
        msg: NodeMessage,
    ) -> Result<(), ChannelError> {
        self.send_raw_to_researcher(researcher, encode(&msg)?)
    }
}
