//! # fedlab node
//!
//! A node holds private datasets and takes part in the federated experiments of researchers. It
//! never shares its data: it receives a training plan and global parameters, trains locally and
//! ships back the updated parameters.
//!
//! - [`plan`]: the contract of a training plan and the data loaders it trains on.
//! - [`loader`]: instantiation of training plans from their source.
//! - [`approval`]: the gate deciding which training plans may run.
//! - [`round`]: the execution of a single training round.
//! - [`datasets`]: the datasets shared by the node.
//! - [`node`]: the service answering the commands of researchers.
//! - [`settings`]: the node settings.

pub mod approval;
pub mod datasets;
pub mod loader;
pub mod node;
pub mod plan;
pub mod round;
pub mod settings;

#[cfg(test)]
pub(crate) mod testutils;

pub use self::{
    approval::{ApprovalGate, ApprovalStatus},
    loader::{PlanLoader, RegistryLoader},
    node::{Node, NodeError},
    plan::{DataLoader, DataManager, Metrics, PlanError, TrainingPlan},
    round::{RoundExecutor, RoundOutcome, RoundStage},
};
