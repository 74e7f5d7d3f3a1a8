//! An in-process federation: nodes training the linear regression plan, all connected to one
//! [`LocalBus`] and sharing one artifact store.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use fedlab_core::{
    channel::{ChannelError, LocalBus},
    exchange::FsExchange,
    DataType,
    DatasetDescriptor,
    ModelError,
    NodeId,
    ResearcherId,
};
use fedlab_node::{
    approval::{ApprovalError, MemoryRegistry},
    datasets::DatasetRegistry,
    ApprovalGate,
    Node,
    RoundExecutor,
};
use fedlab_researcher::RequestCoordinator;

use crate::linear;

/// The model every node learns.
pub const TRUE_WEIGHT: [f64; 2] = [2.0, -1.0];
pub const TRUE_BIAS: f64 = 0.5;

/// The tag of the datasets of the simulated nodes.
pub const TAG: &str = "linear";

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("failed to prepare the node files: {0}")]
    Io(#[from] io::Error),
    #[error("failed to connect: {0}")]
    Channel(#[from] ChannelError),
    #[error("failed to approve the plan: {0}")]
    Approval(#[from] ApprovalError),
    #[error("failed to write the parameters: {0}")]
    Params(#[from] ModelError),
}

/// A node to simulate.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub id: NodeId,
    /// The number of samples of the dataset of the node.
    pub samples: usize,
    /// Whether the node requires the plan to be approved.
    pub plan_approval: bool,
}

impl NodeSpec {
    pub fn new(id: &str, samples: usize) -> Self {
        Self {
            id: id.into(),
            samples,
            plan_approval: false,
        }
    }

    pub fn with_plan_approval(mut self) -> Self {
        self.plan_approval = true;
        self
    }
}

pub struct Federation {
    root: PathBuf,
    store: PathBuf,
    bus: LocalBus,
    nodes: Vec<(NodeId, Arc<ApprovalGate>, JoinHandle<()>)>,
}

impl Federation {
    /// Creates an empty federation working in `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store: root.join("store"),
            root,
            bus: LocalBus::new(),
            nodes: Vec::new(),
        }
    }

    /// Uses `store` as the shared artifact store.
    pub fn with_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.store = store.into();
        self
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    /// The directory shared by the researcher and the nodes.
    pub fn store(&self) -> &Path {
        &self.store
    }

    /// An artifact exchange for the researcher.
    pub fn exchange(&self) -> FsExchange {
        FsExchange::new(self.store(), self.root.join("researcher"))
    }

    /// Writes the source of the linear regression plan.
    ///
    /// # Errors
    /// Fails if the file can't be written.
    pub fn write_plan(&self) -> Result<PathBuf, FederationError> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join("linear_plan.json");
        fs::write(&path, linear::source(TRUE_WEIGHT.len()))?;
        Ok(path)
    }

    /// Writes the parameters of an untrained model.
    ///
    /// # Errors
    /// Fails if the file can't be written.
    pub fn write_initial_params(&self) -> Result<PathBuf, FederationError> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join("params_init.bin");
        linear::initial_params(TRUE_WEIGHT.len()).save(&path)?;
        Ok(path)
    }

    /// Starts a node serving the researchers on the bus.
    ///
    /// # Errors
    /// Fails if the dataset of the node can't be written.
    pub fn spawn_node(&mut self, spec: NodeSpec) -> Result<Arc<ApprovalGate>, FederationError> {
        let dir = self.root.join("nodes").join(spec.id.as_str());
        fs::create_dir_all(&dir)?;
        let path = dir.join("data.csv");
        let offset = self.nodes.len() * 97;
        linear::write_dataset(&path, &TRUE_WEIGHT, TRUE_BIAS, spec.samples, offset)?;
        let dataset = DatasetDescriptor {
            dataset_id: format!("{}-linear", spec.id),
            name: "linear".into(),
            tags: vec![TAG.into()],
            path,
            data_type: DataType::Csv,
            shape: vec![spec.samples, TRUE_WEIGHT.len() + 1],
            dtypes: vec!["float64".into(); TRUE_WEIGHT.len() + 1],
            description: "synthetic linear regression samples".into(),
        };

        let gate = Arc::new(ApprovalGate::new(spec.plan_approval, MemoryRegistry::default()));
        let exchange = Arc::new(FsExchange::new(self.store(), dir.join("tmp")));
        let executor = RoundExecutor::new(
            spec.id.clone(),
            gate.clone(),
            Arc::new(linear::loader()),
            exchange.clone(),
            dir.join("tmp"),
        );
        let node = Node::new(
            spec.id.clone(),
            DatasetRegistry::new(vec![dataset]),
            gate.clone(),
            executor,
            exchange,
            Arc::new(self.bus.clone()),
        );
        let inbox = self.bus.connect_node(spec.id.clone())?;
        let handle = tokio::spawn(node.run(inbox));
        debug!("node {} started with {} samples", spec.id, spec.samples);
        self.nodes.push((spec.id, gate.clone(), handle));
        Ok(gate)
    }

    /// Approves the linear regression plan on a node.
    ///
    /// # Errors
    /// Fails if the node is unknown or the registry can't be accessed.
    pub fn approve(&self, node_id: &NodeId) -> Result<(), FederationError> {
        let source = linear::source(TRUE_WEIGHT.len());
        if let Some((_, gate, _)) = self.nodes.iter().find(|(id, _, _)| id == node_id) {
            gate.register_approved(source.as_bytes(), linear::LINEAR_CLASS)?;
        }
        Ok(())
    }

    /// Connects a researcher to the federation.
    ///
    /// # Errors
    /// Fails if the researcher can't be connected.
    pub fn researcher(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<RequestCoordinator, FederationError> {
        let researcher_id = ResearcherId::from(id);
        let inbox = self.bus.connect_researcher(researcher_id.clone())?;
        Ok(RequestCoordinator::new(
            researcher_id,
            Arc::new(self.bus.clone()),
            inbox,
            timeout,
        ))
    }

    /// Disconnects one node. It stops once it has handled the pending messages.
    ///
    /// # Errors
    /// Fails if the bus is poisoned.
    pub fn disconnect(&self, node_id: &NodeId) -> Result<(), FederationError> {
        Ok(self.bus.disconnect_node(node_id)?)
    }

    /// Disconnects every node and waits for them to stop.
    pub async fn shutdown(self) {
        for (node_id, _, handle) in self.nodes {
            if let Err(err) = self.bus.disconnect_node(&node_id) {
                debug!("failed to disconnect node {}: {}", node_id, err);
            }
            if let Err(err) = handle.await {
                debug!("node {} failed: {}", node_id, err);
            }
        }
        info!("federation shut down");
    }
}
