//! The request coordinator.
//!
//! Requests are sent without waiting for anything. Replies are then collected in windows of a
//! fixed length: the collection goes on as long as every window brings at least one new matching
//! reply, and stops early once every participant has replied. Messages which don't match the
//! request (another researcher, job, round or command, or a node which doesn't take part) are
//! discarded.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use displaydoc::Display;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error_span, info, warn};
use tracing_futures::Instrument;

use fedlab_core::{
    channel::{ChannelError, Inbox, ResearcherChannel},
    message::{
        Command,
        ModelStatusReply,
        ModelStatusRequest,
        NodeMessage,
        PingRequest,
        ResearcherMessage,
        SearchRequest,
        TrainReply,
        TrainRequest,
    },
    JobId,
    NodeId,
    ResearcherId,
};

use crate::datasets::FederatedDataset;

/// Errors of the request coordinator.
#[derive(Debug, Display, Error)]
pub enum RequestError {
    /// Failed to broadcast the {0} request: {1}.
    Broadcast(Command, ChannelError),
}

/// The replies collected for a round.
#[derive(Debug, Default)]
pub struct RoundReplies {
    /// The replies of the participants, successful or not.
    pub replies: BTreeMap<NodeId, TrainReply>,
    /// The participants which reported an error or couldn't be reached, with the cause.
    pub faulty: BTreeMap<NodeId, String>,
}

/// How a collected message is handled.
enum Verdict<T> {
    /// A reply of a node.
    Accept(NodeId, T),
    /// An error reported by a node.
    Fault(NodeId, String),
    /// A message unrelated to the request.
    Discard(String),
}

enum Participants {
    Known(BTreeSet<NodeId>),
    Any,
}

impl Participants {
    fn contains(&self, node_id: &NodeId) -> bool {
        match self {
            Participants::Known(nodes) => nodes.contains(node_id),
            Participants::Any => true,
        }
    }

    fn remove(&mut self, node_id: &NodeId) {
        if let Participants::Known(nodes) = self {
            nodes.remove(node_id);
        }
    }

    fn have_replied<T>(&self, replies: &BTreeMap<NodeId, T>) -> bool {
        match self {
            Participants::Known(nodes) => nodes.iter().all(|node| replies.contains_key(node)),
            Participants::Any => false,
        }
    }
}

struct Collected<T> {
    replies: BTreeMap<NodeId, T>,
    faulty: BTreeMap<NodeId, String>,
}

/// Sends requests to the nodes and collects their replies.
pub struct RequestCoordinator {
    researcher_id: ResearcherId,
    channel: Arc<dyn ResearcherChannel>,
    inbox: Inbox<NodeMessage>,
    timeout: Duration,
    sequence: u64,
}

impl RequestCoordinator {
    /// Creates a coordinator collecting replies in windows of `timeout`.
    pub fn new(
        researcher_id: ResearcherId,
        channel: Arc<dyn ResearcherChannel>,
        inbox: Inbox<NodeMessage>,
        timeout: Duration,
    ) -> Self {
        Self {
            researcher_id,
            channel,
            inbox,
            timeout,
            sequence: 0,
        }
    }

    pub fn researcher_id(&self) -> &ResearcherId {
        &self.researcher_id
    }

    /// Sends the training requests of a round and collects the replies.
    ///
    /// A node which can't be reached or which reports an error is faulty: a reply it sent before
    /// is dropped.
    pub async fn dispatch_round(
        &mut self,
        job_id: &JobId,
        round: u32,
        requests: BTreeMap<NodeId, TrainRequest>,
    ) -> RoundReplies {
        let span = error_span!("run_round", round);
        self.dispatch(job_id, round, requests).instrument(span).await
    }

    async fn dispatch(
        &mut self,
        job_id: &JobId,
        round: u32,
        requests: BTreeMap<NodeId, TrainRequest>,
    ) -> RoundReplies {
        let mut participants = BTreeSet::new();
        let mut unreachable = BTreeMap::new();
        for (node_id, request) in requests {
            match self.channel.send_to_node(&node_id, request.into()) {
                Ok(()) => {
                    participants.insert(node_id);
                }
                Err(err) => {
                    warn!("failed to send the train request to node {}: {}", node_id, err);
                    unreachable.insert(node_id, err.to_string());
                }
            }
        }
        info!("train request sent to {} nodes", participants.len());

        let researcher_id = self.researcher_id.clone();
        let expected = participants.clone();
        let Collected {
            replies,
            mut faulty,
        } = self
            .collect(Participants::Known(participants), |msg| match msg {
                NodeMessage::Train(reply) => {
                    if reply.researcher_id != researcher_id
                        || &reply.job_id != job_id
                        || reply.round != round
                    {
                        Verdict::Discard(format!(
                            "reply of node {} to job {} round {}",
                            reply.node_id, reply.job_id, reply.round
                        ))
                    } else {
                        Verdict::Accept(reply.node_id.clone(), reply)
                    }
                }
                NodeMessage::Error(error) => {
                    let foreign_job = error.job_id.as_ref().map_or(false, |id| id != job_id);
                    let foreign_researcher = error
                        .researcher_id
                        .as_ref()
                        .map_or(false, |id| id != &researcher_id);
                    if foreign_job || foreign_researcher {
                        Verdict::Discard(format!("error of node {} for another job", error.node_id))
                    } else {
                        Verdict::Fault(
                            error.node_id.clone(),
                            format!("{}: {}", error.errnum, error.extra_msg),
                        )
                    }
                }
                msg => Verdict::Discard(format!(
                    "{} message of node {}",
                    msg.command(),
                    msg.node_id()
                )),
            })
            .await;
        faulty.extend(unreachable);

        for node_id in &expected {
            match (replies.get(node_id), faulty.get(node_id)) {
                (Some(reply), _) if reply.success => info!("node {} completed the round", node_id),
                (Some(reply), _) => warn!("node {} failed the round: {}", node_id, reply.msg),
                (None, Some(cause)) => warn!("node {} is faulty: {}", node_id, cause),
                (None, None) => warn!("node {} did not reply in time", node_id),
            }
        }
        RoundReplies { replies, faulty }
    }

    /// Searches the nodes for datasets carrying all of `tags`.
    ///
    /// Nodes without a matching dataset, or not part of `nodes` when given, are left out.
    ///
    /// # Errors
    /// Fails if the request can't be broadcast.
    pub async fn search(
        &mut self,
        tags: &[String],
        nodes: Option<&[NodeId]>,
    ) -> Result<FederatedDataset, RequestError> {
        let request = SearchRequest {
            researcher_id: self.researcher_id.clone(),
            tags: tags.to_vec(),
        };
        self.broadcast(request.into())?;

        let researcher_id = self.researcher_id.clone();
        let collected = self
            .collect(Participants::Any, |msg| match msg {
                NodeMessage::Search(reply) if reply.researcher_id == researcher_id => {
                    Verdict::Accept(reply.node_id, reply.databases)
                }
                msg => Verdict::Discard(format!(
                    "{} message of node {}",
                    msg.command(),
                    msg.node_id()
                )),
            })
            .await;

        let datasets = collected
            .replies
            .into_iter()
            .filter(|(node_id, _)| nodes.map_or(true, |nodes| nodes.contains(node_id)))
            .filter(|(node_id, databases)| {
                info!("node {} has {} matching datasets", node_id, databases.len());
                !databases.is_empty()
            })
            .collect::<BTreeMap<_, _>>();
        Ok(datasets.into())
    }

    /// Finds the nodes which are online.
    ///
    /// # Errors
    /// Fails if the request can't be broadcast.
    pub async fn ping(&mut self) -> Result<Vec<NodeId>, RequestError> {
        self.sequence += 1;
        let sequence = self.sequence;
        let request = PingRequest {
            researcher_id: self.researcher_id.clone(),
            sequence,
        };
        self.broadcast(request.into())?;

        let researcher_id = self.researcher_id.clone();
        let collected = self
            .collect(Participants::Any, |msg| match msg {
                NodeMessage::Ping(reply)
                    if reply.researcher_id == researcher_id && reply.sequence == sequence =>
                {
                    Verdict::Accept(reply.node_id, ())
                }
                msg => Verdict::Discard(format!(
                    "{} message of node {}",
                    msg.command(),
                    msg.node_id()
                )),
            })
            .await;
        let online = collected.replies.into_iter().map(|(node_id, ())| node_id).collect::<Vec<_>>();
        info!("{} nodes are online", online.len());
        Ok(online)
    }

    /// Asks `nodes` whether they approved the training plan of a job.
    ///
    /// The status of every node is logged. Nodes which don't reply are warned about.
    pub async fn model_status(
        &mut self,
        job_id: &JobId,
        plan_url: &str,
        nodes: &[NodeId],
    ) -> BTreeMap<NodeId, ModelStatusReply> {
        let mut participants = BTreeSet::new();
        for node_id in nodes {
            let request = ModelStatusRequest {
                researcher_id: self.researcher_id.clone(),
                job_id: job_id.clone(),
                plan_url: plan_url.to_string(),
            };
            match self.channel.send_to_node(node_id, request.into()) {
                Ok(()) => {
                    participants.insert(node_id.clone());
                }
                Err(err) => warn!(
                    "failed to send the model status request to node {}: {}",
                    node_id, err
                ),
            }
        }

        let researcher_id = self.researcher_id.clone();
        let collected = self
            .collect(Participants::Known(participants), |msg| match msg {
                NodeMessage::ModelStatus(reply)
                    if reply.researcher_id == researcher_id && &reply.job_id == job_id =>
                {
                    Verdict::Accept(reply.node_id.clone(), reply)
                }
                msg => Verdict::Discard(format!(
                    "{} message of node {}",
                    msg.command(),
                    msg.node_id()
                )),
            })
            .await;

        for node_id in nodes {
            match collected.replies.get(node_id) {
                Some(reply) if reply.success => info!(
                    "node {}: {} (approval obligation: {})",
                    node_id, reply.msg, reply.approval_obligation
                ),
                Some(reply) => {
                    warn!("node {} can't check the training plan: {}", node_id, reply.msg)
                }
                None => warn!("node {} did not reply to the model status request", node_id),
            }
        }
        collected.replies
    }

    fn broadcast(&self, msg: ResearcherMessage) -> Result<(), RequestError> {
        let command = msg.command();
        self.channel
            .broadcast(msg)
            .map_err(|err| RequestError::Broadcast(command, err))
    }

    /// Collects messages until a whole window brings nothing new or all participants replied.
    async fn collect<T, F>(
        &mut self,
        mut participants: Participants,
        mut classify: F,
    ) -> Collected<T>
    where
        F: FnMut(NodeMessage) -> Verdict<T>,
    {
        let mut collected = Collected {
            replies: BTreeMap::new(),
            faulty: BTreeMap::new(),
        };
        while !participants.have_replied(&collected.replies) {
            let mut progressed = false;
            let deadline = sleep(self.timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;

                    _ = &mut deadline => break,
                    msg = self.inbox.recv() => {
                        let msg = match msg {
                            Some(msg) => msg,
                            None => {
                                warn!("the inbox has been closed");
                                return collected;
                            }
                        };
                        match classify(msg) {
                            Verdict::Accept(node_id, reply) => {
                                if !participants.contains(&node_id) {
                                    debug!(
                                        "discarding a reply of node {} which doesn't take part",
                                        node_id
                                    );
                                } else if collected.replies.contains_key(&node_id) {
                                    debug!("discarding a duplicate reply of node {}", node_id);
                                } else {
                                    collected.replies.insert(node_id, reply);
                                    progressed = true;
                                    if participants.have_replied(&collected.replies) {
                                        break;
                                    }
                                }
                            }
                            Verdict::Fault(node_id, cause) => {
                                if participants.contains(&node_id) {
                                    warn!("node {} reported an error: {}", node_id, cause);
                                    participants.remove(&node_id);
                                    collected.replies.remove(&node_id);
                                    collected.faulty.insert(node_id, cause);
                                    progressed = true;
                                } else {
                                    debug!(
                                        "discarding an error of node {} which doesn't take part",
                                        node_id
                                    );
                                }
                            }
                            Verdict::Discard(what) => debug!("discarding {}", what),
                        }
                    }
                }
            }

            if !progressed {
                break;
            }
        }
        collected
    }
}
