//! # fedlab researcher
//!
//! The researcher coordinates a federated experiment: it ships a training plan and the global
//! model to the nodes, collects their updates and aggregates them into the next global model.
//!
//! - [`requests`]: dispatch of requests to the nodes and collection of their replies.
//! - [`job`]: the rounds of one experiment on a federated dataset.
//! - [`aggregator`]: the aggregation strategies, FedAvg and Scaffold.
//! - [`strategy`]: the selection of the nodes of a round.
//! - [`breakpoint`]: saving and loading the state of an experiment.
//! - [`experiment`]: the experiment loop tying everything together.
//! - [`settings`]: the researcher settings.

pub mod aggregator;
pub mod breakpoint;
pub mod datasets;
pub mod experiment;
pub mod job;
pub mod requests;
pub mod settings;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testutils;

pub use self::{
    aggregator::{Aggregator, AggregatorError, FedAvg, Scaffold},
    datasets::FederatedDataset,
    experiment::{Experiment, ExperimentError},
    job::{Job, JobError, TrainingReply},
    requests::{RequestCoordinator, RequestError},
    strategy::{DefaultStrategy, NodeSelectionStrategy},
};
