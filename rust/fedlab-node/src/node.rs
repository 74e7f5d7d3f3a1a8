//! The node service.
//!
//! A receiving task reads the inbox and queues the commands for a worker which handles them one
//! at a time. Pings are answered by the receiving task right away, so a node stays responsive
//! while it trains.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::{fs, sync::mpsc};
use tracing::{debug, error_span, info, warn};
use tracing_futures::Instrument;
use uuid::Uuid;

use fedlab_core::{
    channel::{ChannelError, Inbox, NodeChannel},
    exchange::{ArtifactExchange, ExchangeError},
    message::{
        ApprovalStatus,
        ErrorCode,
        ErrorMessage,
        ModelStatusReply,
        ModelStatusRequest,
        NodeMessage,
        PingReply,
        PingRequest,
        ResearcherMessage,
        SearchReply,
        SearchRequest,
        TrainRequest,
    },
    NodeId,
    ResearcherId,
};

use crate::{
    approval::{ApprovalError, ApprovalGate, JsonRegistry, MemoryRegistry},
    datasets::DatasetRegistry,
    loader::PlanLoader,
    round::RoundExecutor,
    settings::NodeSettings,
};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to open the plan registry: {0}")]
    Registry(#[from] ApprovalError),
    #[error("failed to connect the node: {0}")]
    Channel(#[from] ChannelError),
}

/// A node taking part in federated experiments.
pub struct Node {
    id: NodeId,
    datasets: DatasetRegistry,
    gate: Arc<ApprovalGate>,
    executor: RoundExecutor,
    exchange: Arc<dyn ArtifactExchange>,
    channel: Arc<dyn NodeChannel>,
}

impl Node {
    pub fn new(
        id: NodeId,
        datasets: DatasetRegistry,
        gate: Arc<ApprovalGate>,
        executor: RoundExecutor,
        exchange: Arc<dyn ArtifactExchange>,
        channel: Arc<dyn NodeChannel>,
    ) -> Self {
        Self {
            id,
            datasets,
            gate,
            executor,
            exchange,
            channel,
        }
    }

    /// Creates a node from its settings.
    ///
    /// # Errors
    /// Fails if the plan registry can't be opened.
    pub fn from_settings(
        settings: &NodeSettings,
        loader: Arc<dyn PlanLoader>,
        exchange: Arc<dyn ArtifactExchange>,
        channel: Arc<dyn NodeChannel>,
    ) -> Result<Self, NodeError> {
        let enabled = settings.security.plan_approval;
        let gate = match &settings.security.registry {
            Some(path) => ApprovalGate::new(enabled, JsonRegistry::open(path)?),
            None => ApprovalGate::new(enabled, MemoryRegistry::default()),
        };
        let gate = Arc::new(gate);
        let id = NodeId::new(settings.node.id.clone());
        let executor = RoundExecutor::new(
            id.clone(),
            gate.clone(),
            loader,
            exchange.clone(),
            settings.node.tmp_dir.clone(),
        );
        Ok(Self::new(
            id,
            DatasetRegistry::new(settings.datasets.clone()),
            gate,
            executor,
            exchange,
            channel,
        ))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Serves the researchers until the inbox is closed.
    pub async fn run(self, inbox: Inbox<ResearcherMessage>) {
        let span = error_span!("node", node_id = %self.id);
        self.serve(inbox).instrument(span).await
    }

    async fn serve(self, mut inbox: Inbox<ResearcherMessage>) {
        let node = Arc::new(self);
        let (tx, mut rx) = mpsc::unbounded_channel();
        info!("node started with {} datasets", node.datasets.len());

        let receiver = {
            let node = node.clone();
            tokio::spawn(
                async move {
                    while let Some(msg) = inbox.next().await {
                        match msg {
                            ResearcherMessage::Ping(ping) => node.handle_ping(ping),
                            msg => {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!("inbox closed");
                }
                .in_current_span(),
            )
        };

        while let Some(msg) = rx.recv().await {
            node.handle(msg).await;
        }
        if let Err(err) = receiver.await {
            warn!("receiving task failed: {}", err);
        }
        info!("node stopped");
    }

    /// Handles a single command.
    pub async fn handle(&self, msg: ResearcherMessage) {
        debug!(
            "handling {} from researcher {}",
            msg.command(),
            msg.researcher_id()
        );
        match msg {
            ResearcherMessage::Train(req) => self.handle_train(req).await,
            ResearcherMessage::ModelStatus(req) => self.handle_model_status(req).await,
            ResearcherMessage::Search(req) => self.handle_search(req),
            ResearcherMessage::Ping(req) => self.handle_ping(req),
        }
    }

    fn send(&self, researcher: &ResearcherId, msg: NodeMessage) {
        if let Err(err) = self.channel.send_to_researcher(researcher, msg) {
            warn!("failed to reply to researcher {}: {}", researcher, err);
        }
    }

    fn send_error(&self, req: &TrainRequest, errnum: ErrorCode, extra_msg: String) {
        warn!("{}: {}", errnum, extra_msg);
        let msg = ErrorMessage {
            node_id: self.id.clone(),
            researcher_id: Some(req.researcher_id.clone()),
            job_id: Some(req.job_id.clone()),
            errnum,
            extra_msg,
        };
        self.send(&req.researcher_id, msg.into());
    }

    async fn handle_train(&self, req: TrainRequest) {
        let dataset_ids = req
            .training_data
            .get(&self.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let dataset_id = match dataset_ids {
            [] => {
                let extra_msg = format!("no dataset was selected for node {}", self.id);
                return self.send_error(&req, ErrorCode::BadRequest, extra_msg);
            }
            [dataset_id] => dataset_id,
            [dataset_id, ..] => {
                warn!(
                    "{} datasets were selected, training on {} only",
                    dataset_ids.len(),
                    dataset_id
                );
                dataset_id
            }
        };
        let dataset = match self.datasets.get(dataset_id) {
            Some(dataset) => dataset.clone(),
            None => {
                let extra_msg = format!(
                    "Did not find proper data in local datasets on node {}: {}",
                    self.id, dataset_id
                );
                return self.send_error(&req, ErrorCode::DatasetNotFound, extra_msg);
            }
        };
        let outcome = self.executor.execute(&req, &dataset).await;
        self.send(&req.researcher_id, outcome.reply.into());
    }

    async fn handle_model_status(&self, req: ModelStatusRequest) {
        let mut reply = ModelStatusReply {
            node_id: self.id.clone(),
            researcher_id: req.researcher_id.clone(),
            job_id: req.job_id.clone(),
            success: false,
            approval_obligation: self.gate.requires_approval(),
            status: None,
            plan_name: None,
            plan_url: req.plan_url.clone(),
            msg: String::new(),
        };
        match self.plan_status(&req.plan_url).await {
            Ok(record) => {
                reply.success = true;
                reply.msg = status_message(
                    self.gate.requires_approval(),
                    record.as_ref().map(|record| record.status),
                );
                reply.status = record.as_ref().map(|record| record.status);
                reply.plan_name = record.map(|record| record.name);
            }
            Err(msg) => {
                warn!("{}", msg);
                reply.msg = msg;
            }
        }
        self.send(&req.researcher_id, reply.into());
    }

    async fn plan_status(
        &self,
        plan_url: &str,
    ) -> Result<Option<crate::approval::ApprovalRecord>, String> {
        let name = format!("model_status_{}.plan", Uuid::new_v4().to_simple());
        let response = self
            .exchange
            .download(plan_url, &name)
            .await
            .map_err(|err: ExchangeError| {
                format!("Cannot download training plan file {}: {}", plan_url, err)
            })?;
        if !response.is_ok() {
            return Err(format!(
                "Cannot download training plan file {}: status {}",
                plan_url, response.status
            ));
        }
        let source = fs::read(&response.path).await;
        if let Err(err) = fs::remove_file(&response.path).await {
            debug!("failed to remove {:?}: {}", response.path, err);
        }
        let source =
            source.map_err(|err| format!("Cannot read training plan file {}: {}", plan_url, err))?;
        self.gate
            .status(&source)
            .map_err(|err| format!("Cannot check the training plan status: {}", err))
    }

    fn handle_search(&self, req: SearchRequest) {
        let databases = self.datasets.search(&req.tags);
        info!(
            "{} datasets match the tags {:?}",
            databases.len(),
            req.tags
        );
        let reply = SearchReply {
            node_id: self.id.clone(),
            researcher_id: req.researcher_id.clone(),
            databases,
        };
        self.send(&req.researcher_id, reply.into());
    }

    fn handle_ping(&self, req: PingRequest) {
        let reply = PingReply {
            node_id: self.id.clone(),
            researcher_id: req.researcher_id.clone(),
            sequence: req.sequence,
        };
        self.send(&req.researcher_id, reply.into());
    }
}

fn status_message(approval_obligation: bool, status: Option<ApprovalStatus>) -> String {
    let status = match status {
        Some(ApprovalStatus::Approved) => "Training plan has been approved by the node",
        Some(ApprovalStatus::Pending) => "Training plan is pending: waiting for a review",
        Some(ApprovalStatus::Rejected) => "Training plan has been rejected by the node",
        None => "Unknown training plan: not registered on the node",
    };
    if approval_obligation {
        status.to_string()
    } else {
        format!("{}, but this node does not require plan approval", status)
    }
}
