//! The messages exchanged between the researcher and the nodes.
//!
//! Messages are internally tagged by their `command`. The researcher sends
//! [`ResearcherMessage`]s, the nodes answer with [`NodeMessage`]s.

use std::collections::BTreeMap;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::{
    common::{DatasetDescriptor, JobId, NodeId, ResearcherId, Timing},
    model::Params,
    ArgBag,
};

/// The datasets selected on each node, by dataset identifier.
pub type TrainingData = BTreeMap<NodeId, Vec<String>>;

/// The auxiliary aggregator arguments of one node, by argument name.
pub type AggregatorArgs = BTreeMap<String, AggregatorArg>;

/// The name of the aggregator argument holding the aggregator name.
pub const AGGREGATOR_NAME_ARG: &str = "aggregator_name";
/// The name of the aggregator argument holding the drift correction of a node.
pub const AGGREGATOR_CORRECTION_ARG: &str = "aggregator_correction";

/// An auxiliary aggregator argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AggregatorArg {
    /// A plain value sent inline.
    Value(serde_json::Value),
    /// A parameter set sent inline.
    Params(Params),
    /// A parameter set uploaded to the artifact exchange.
    Remote { url: String },
}

/// A message sent by the researcher.
#[derive(Clone, Debug, PartialEq, From, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ResearcherMessage {
    Train(TrainRequest),
    ModelStatus(ModelStatusRequest),
    Search(SearchRequest),
    Ping(PingRequest),
}

impl ResearcherMessage {
    pub fn researcher_id(&self) -> &ResearcherId {
        match self {
            Self::Train(msg) => &msg.researcher_id,
            Self::ModelStatus(msg) => &msg.researcher_id,
            Self::Search(msg) => &msg.researcher_id,
            Self::Ping(msg) => &msg.researcher_id,
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Self::Train(_) => Command::Train,
            Self::ModelStatus(_) => Command::ModelStatus,
            Self::Search(_) => Command::Search,
            Self::Ping(_) => Command::Ping,
        }
    }
}

/// A message sent by a node.
#[derive(Clone, Debug, PartialEq, From, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum NodeMessage {
    Train(TrainReply),
    Error(ErrorMessage),
    ModelStatus(ModelStatusReply),
    Search(SearchReply),
    Ping(PingReply),
}

impl NodeMessage {
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Train(msg) => &msg.node_id,
            Self::Error(msg) => &msg.node_id,
            Self::ModelStatus(msg) => &msg.node_id,
            Self::Search(msg) => &msg.node_id,
            Self::Ping(msg) => &msg.node_id,
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Self::Train(_) => Command::Train,
            Self::Error(_) => Command::Error,
            Self::ModelStatus(_) => Command::ModelStatus,
            Self::Search(_) => Command::Search,
            Self::Ping(_) => Command::Ping,
        }
    }
}

/// The command of a message.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Command {
    #[display(fmt = "train")]
    Train,
    #[display(fmt = "error")]
    Error,
    #[display(fmt = "model-status")]
    ModelStatus,
    #[display(fmt = "search")]
    Search,
    #[display(fmt = "ping")]
    Ping,
}

/// A request to run one round of a job on a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub researcher_id: ResearcherId,
    pub job_id: JobId,
    pub round: u32,
    pub training_args: ArgBag,
    pub model_args: ArgBag,
    /// The datasets the node must train on. Only the entry of the addressed node matters.
    pub training_data: TrainingData,
    /// The handle of the training plan source.
    pub plan_url: String,
    /// The class of the training plan, resolved by the node's plan loader.
    pub plan_class: String,
    /// The handle of the global parameters.
    pub params_url: String,
    /// Whether to train or only to validate the global parameters.
    pub training: bool,
    #[serde(default)]
    pub aggregator_args: AggregatorArgs,
}

/// The outcome of one round on a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainReply {
    pub node_id: NodeId,
    pub researcher_id: ResearcherId,
    pub job_id: JobId,
    pub round: u32,
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub dataset_id: Option<String>,
    /// The handle of the uploaded [`TrainingResult`].
    #[serde(default)]
    pub params_url: Option<String>,
    #[serde(default)]
    pub sample_size: Option<usize>,
    #[serde(default)]
    pub timing: Timing,
}

/// The error codes a node may report.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[display(fmt = "requested dataset not found")]
    DatasetNotFound,
    #[display(fmt = "bad request")]
    BadRequest,
    #[display(fmt = "training failure")]
    Training,
    #[display(fmt = "internal node error")]
    Internal,
}

/// A fault declared by a node. The node is dropped from the job for good.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub node_id: NodeId,
    #[serde(default)]
    pub researcher_id: Option<ResearcherId>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub errnum: ErrorCode,
    pub extra_msg: String,
}

/// The approval status of a training plan.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[display(fmt = "approved")]
    Approved,
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "rejected")]
    Rejected,
}

/// A request for the approval status of a training plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusRequest {
    pub researcher_id: ResearcherId,
    pub job_id: JobId,
    pub plan_url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusReply {
    pub node_id: NodeId,
    pub researcher_id: ResearcherId,
    pub job_id: JobId,
    pub success: bool,
    /// Whether the node requires plans to be approved.
    pub approval_obligation: bool,
    /// The status of the plan, `None` if the node never saw it.
    #[serde(default)]
    pub status: Option<ApprovalStatus>,
    #[serde(default)]
    pub plan_name: Option<String>,
    pub plan_url: String,
    pub msg: String,
}

/// A search for datasets by tags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub researcher_id: ResearcherId,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchReply {
    pub node_id: NodeId,
    pub researcher_id: ResearcherId,
    pub databases: Vec<DatasetDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub researcher_id: ResearcherId,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PingReply {
    pub node_id: NodeId,
    pub researcher_id: ResearcherId,
    pub sequence: u64,
}

/// The blob a node uploads after a successful training round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub researcher_id: ResearcherId,
    pub job_id: JobId,
    pub node_id: NodeId,
    pub model_params: Params,
    pub optimizer_args: BTreeMap<String, f64>,
}

impl TrainingResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::Tensor;

    #[test]
    fn test_messages_are_tagged_by_command() {
        let msg = NodeMessage::from(ErrorMessage {
            node_id: "node-1".into(),
            researcher_id: None,
            job_id: Some("job".into()),
            errnum: ErrorCode::DatasetNotFound,
            extra_msg: "no such dataset".into(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["command"], "error");
        assert_eq!(value["errnum"], "dataset_not_found");
        assert_eq!(msg.command(), Command::Error);

        let msg: ResearcherMessage = serde_json::from_value(json!({
            "command": "model-status",
            "researcher_id": "researcher",
            "job_id": "job",
            "plan_url": "plan",
        }))
        .unwrap();
        assert_eq!(msg.command(), Command::ModelStatus);
        assert_eq!(msg.researcher_id().as_str(), "researcher");
    }

    #[test]
    fn test_train_request_carries_aggregator_args() {
        let mut correction = Params::new();
        correction.insert("weight", Tensor::from_vec(vec![0.0, 0.0]));
        let mut aggregator_args = AggregatorArgs::new();
        aggregator_args.insert(
            AGGREGATOR_NAME_ARG.into(),
            AggregatorArg::Value(json!("scaffold")),
        );
        aggregator_args.insert(
            AGGREGATOR_CORRECTION_ARG.into(),
            AggregatorArg::Params(correction),
        );
        let msg = ResearcherMessage::from(TrainRequest {
            researcher_id: "researcher".into(),
            job_id: "job".into(),
            round: 3,
            training_args: ArgBag::new(),
            model_args: ArgBag::new(),
            training_data: vec![("node-1".into(), vec!["d1".to_string()])]
                .into_iter()
                .collect(),
            plan_url: "plan".into(),
            plan_class: "LinearRegression".into(),
            params_url: "params".into(),
            training: true,
            aggregator_args,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<ResearcherMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn test_reply_defaults_optional_fields() {
        let reply: NodeMessage = serde_json::from_value(json!({
            "command": "train",
            "node_id": "node-1",
            "researcher_id": "researcher",
            "job_id": "job",
            "round": 0,
            "success": false,
            "msg": "Cannot download param file: params",
        }))
        .unwrap();
        match reply {
            NodeMessage::Train(reply) => {
                assert!(reply.params_url.is_none());
                assert!(reply.sample_size.is_none());
                assert_eq!(reply.timing, Timing::default());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
