//! Test helpers: a sandbox directory with an artifact store and scripted nodes.

use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use fedlab_core::{
    channel::{LocalBus, NodeChannel},
    exchange::{ArtifactExchange, DownloadResponse, ExchangeError, FsExchange, UploadResponse},
    message::{
        ApprovalStatus,
        ErrorCode,
        ErrorMessage,
        ModelStatusReply,
        NodeMessage,
        PingReply,
        ResearcherMessage,
        SearchReply,
        TrainReply,
        TrainRequest,
        TrainingResult,
    },
    ArgBag,
    DatasetDescriptor,
    NodeId,
    Timing,
};

use crate::{
    aggregator::tests::params,
    datasets::tests::descriptor,
    job::JobConfig,
    requests::RequestCoordinator,
};

pub const RESEARCHER: &str = "researcher";
pub const TIMEOUT: Duration = Duration::from_millis(200);

mockall::mock! {
    pub Exchange {}

    #[async_trait]
    impl ArtifactExchange for Exchange {
        async fn upload(&self, path: &Path) -> Result<UploadResponse, ExchangeError>;
        async fn download(
            &self,
            handle: &str,
            dest_name: &str,
        ) -> Result<DownloadResponse, ExchangeError>;
    }
}

/// A temporary directory holding the artifact store, a training plan and a parameter file.
pub struct Sandbox {
    pub dir: TempDir,
    pub bus: LocalBus,
    pub exchange: FsExchange,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plan.json"), b"{}").unwrap();
        params(0.0).save(dir.path().join("params.bin")).unwrap();
        let exchange = FsExchange::new(dir.path().join("store"), dir.path().join("downloads"));
        Self {
            dir,
            bus: LocalBus::new(),
            exchange,
        }
    }

    /// Connects the researcher, replacing an earlier connection.
    pub fn coordinator(&self) -> RequestCoordinator {
        let inbox = self.bus.connect_researcher(RESEARCHER.into()).unwrap();
        RequestCoordinator::new(RESEARCHER.into(), Arc::new(self.bus.clone()), inbox, TIMEOUT)
    }
}

pub fn job_config(sandbox: &Sandbox) -> JobConfig {
    JobConfig {
        researcher_id: RESEARCHER.into(),
        plan_path: sandbox.dir.path().join("plan.json"),
        plan_class: "Plan".into(),
        model_args: ArgBag::new(),
        training_args: ArgBag::new(),
        experiment_dir: sandbox.dir.path().join("experiment"),
        upload_args: false,
    }
}

/// How a scripted node answers training requests.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Replies with the parameters `params(weight)` and a learning rate of 0.1.
    Train { weight: f64, sample_size: usize },
    /// Reports a failed training.
    Fail,
    /// Reports an error.
    Error,
    /// Replies successfully with a result which can't be downloaded.
    BadResult,
    /// Never replies to training requests.
    Silent,
}

/// Spawns a node which answers the researcher according to `behavior`.
///
/// The node holds one dataset `<node>-data` tagged with `heart`.
pub fn spawn_node(sandbox: &Sandbox, node: &str, behavior: Behavior) -> JoinHandle<()> {
    let dataset = descriptor(&format!("{}-data", node));
    spawn_node_with_dataset(sandbox, node, behavior, dataset)
}

/// Spawns a node like [`spawn_node`] which holds `dataset` instead.
pub fn spawn_node_with_dataset(
    sandbox: &Sandbox,
    node: &str,
    behavior: Behavior,
    dataset: DatasetDescriptor,
) -> JoinHandle<()> {
    let node_id = NodeId::from(node);
    let mut inbox = sandbox.bus.connect_node(node_id.clone()).unwrap();
    let bus = sandbox.bus.clone();
    let dir = sandbox.dir.path().to_path_buf();
    let exchange = FsExchange::new(dir.join("store"), dir.join(format!("{}_downloads", node)));
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            let reply: Option<NodeMessage> = match msg {
                ResearcherMessage::Train(request) => {
                    train(&exchange, &dir, &node_id, behavior, request).await
                }
                ResearcherMessage::Search(request) => {
                    let databases = if dataset.has_tags(&request.tags) {
                        vec![dataset.clone()]
                    } else {
                        Vec::new()
                    };
                    Some(
                        SearchReply {
                            node_id: node_id.clone(),
                            researcher_id: request.researcher_id,
                            databases,
                        }
                        .into(),
                    )
                }
                ResearcherMessage::Ping(request) => Some(
                    PingReply {
                        node_id: node_id.clone(),
                        researcher_id: request.researcher_id,
                        sequence: request.sequence,
                    }
                    .into(),
                ),
                ResearcherMessage::ModelStatus(request) => Some(
                    ModelStatusReply {
                        node_id: node_id.clone(),
                        researcher_id: request.researcher_id,
                        job_id: request.job_id,
                        success: true,
                        approval_obligation: true,
                        status: Some(ApprovalStatus::Approved),
                        plan_name: Some("plan".into()),
                        plan_url: request.plan_url,
                        msg: String::new(),
                    }
                    .into(),
                ),
            };
            if let Some(reply) = reply {
                bus.send_to_researcher(&RESEARCHER.into(), reply).unwrap();
            }
        }
    })
}

async fn train(
    exchange: &FsExchange,
    dir: &Path,
    node_id: &NodeId,
    behavior: Behavior,
    request: TrainRequest,
) -> Option<NodeMessage> {
    let mut reply = TrainReply {
        node_id: node_id.clone(),
        researcher_id: request.researcher_id.clone(),
        job_id: request.job_id.clone(),
        round: request.round,
        success: true,
        msg: String::new(),
        dataset_id: Some(format!("{}-data", node_id)),
        params_url: None,
        sample_size: None,
        timing: Timing::default(),
    };
    match behavior {
        Behavior::Train {
            weight,
            sample_size,
        } => {
            reply.sample_size = Some(sample_size);
            if request.training {
                let mut optimizer_args = BTreeMap::new();
                optimizer_args.insert("lr".to_string(), 0.1);
                let result = TrainingResult {
                    researcher_id: request.researcher_id,
                    job_id: request.job_id,
                    node_id: node_id.clone(),
                    model_params: params(weight),
                    optimizer_args,
                };
                let path = dir.join(format!("{}_result_{}.bin", node_id, request.round));
                std::fs::write(&path, result.to_bytes().unwrap()).unwrap();
                reply.params_url = Some(exchange.upload(&path).await.unwrap().handle);
            }
        }
        Behavior::Fail => {
            reply.success = false;
            reply.msg = "training failed".into();
        }
        Behavior::Error => {
            return Some(
                ErrorMessage {
                    node_id: node_id.clone(),
                    researcher_id: Some(request.researcher_id),
                    job_id: Some(request.job_id),
                    errnum: ErrorCode::Training,
                    extra_msg: "out of memory".into(),
                }
                .into(),
            );
        }
        Behavior::BadResult => {
            reply.sample_size = Some(10);
            reply.params_url = Some("fs://missing".into());
        }
        Behavior::Silent => return None,
    }
    Some(reply.into())
}
