//! Aggregation of the updates of the nodes into the next global model.
//!
//! - [`FedAvg`]: the weighted average of the updates.
//! - [`Scaffold`]: federated averaging with drift correction. Each node receives a correction
//!   which the aggregator updates every round.

mod fedavg;
mod scaffold;

use std::{collections::BTreeMap, io, path::Path};

use displaydoc::Display;
use thiserror::Error;

use fedlab_core::{message::AggregatorArgs, ModelError, NodeId, Params, PlanKind};

pub use self::{fedavg::FedAvg, scaffold::Scaffold};
use crate::{
    breakpoint::ComponentState,
    datasets::FederatedDataset,
    settings::{AggregatorKind, AggregatorSettings},
};

/// Errors of the aggregators.
#[derive(Debug, Display, Error)]
pub enum AggregatorError {
    /// The server learning rate must not be 0.
    ZeroServerLr,
    /// The aggregator requires a federated dataset.
    MissingFederatedDataset,
    /// The aggregator does not support {0} training plans.
    UnsupportedPlanKind(PlanKind),
    /// The learning rate of node {0} must not be 0.
    ZeroLearningRate(NodeId),
    /// The number of updates per round must not be 0.
    InvalidUpdateCount,
    /// There are no updates to aggregate.
    NoUpdates,
    /// Invalid aggregation weights: {0}.
    InvalidWeights(String),
    /// Node {0} is not part of the federated dataset.
    UnknownNode(NodeId),
    /// Unknown aggregator {0}.
    UnknownAggregator(String),
    /// Invalid parameters: {0}.
    Model(#[from] ModelError),
    /// Invalid aggregator state: {0}.
    State(String),
    /// Failed to access the aggregator state: {0}.
    Io(#[from] io::Error),
    /// Failed to (de)serialize the aggregator state: {0}.
    Codec(#[from] bincode::Error),
}

/// The update of one node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeUpdate {
    pub node_id: NodeId,
    pub params: Params,
    /// The state of the optimizer of the node, e.g. its learning rate.
    pub optimizer_args: BTreeMap<String, f64>,
}

impl NodeUpdate {
    /// The learning rate the node used for `layer`.
    ///
    /// A rate set for the layer (`lr/<layer>`) takes precedence over the rate set for the whole
    /// model (`lr`).
    pub fn learning_rate(&self, layer: &str) -> Option<f64> {
        self.optimizer_args
            .get(&format!("lr/{}", layer))
            .or_else(|| self.optimizer_args.get("lr"))
            .copied()
    }
}

/// What an aggregator knows about the round it aggregates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AggregationContext {
    pub round: u32,
    /// The number of optimizer steps each node performs during a round.
    pub n_updates: u32,
}

/// An aggregation strategy.
pub trait Aggregator: Send {
    fn name(&self) -> &'static str;

    /// Checks that the aggregator works with the given kind of training plan.
    fn bind_plan_kind(&mut self, _kind: PlanKind) -> Result<(), AggregatorError> {
        Ok(())
    }

    /// Aggregates the updates of a round into the next global model.
    ///
    /// The weights are normalized first. No weights means equal weights.
    fn aggregate(
        &mut self,
        updates: &[NodeUpdate],
        weights: &[f64],
        global: &Params,
        ctx: &AggregationContext,
    ) -> Result<Params, AggregatorError>;

    /// The auxiliary arguments to send to each node along with the global model.
    fn aggregator_args(
        &mut self,
        _global: &Params,
        nodes: &[NodeId],
    ) -> Result<BTreeMap<NodeId, AggregatorArgs>, AggregatorError> {
        Ok(nodes
            .iter()
            .map(|node_id| (node_id.clone(), AggregatorArgs::new()))
            .collect())
    }

    /// Forgets the nodes which left the federation.
    fn drop_nodes(&mut self, _nodes: &[NodeId]) {}

    /// Saves the state of the aggregator. Bulky state is written into `dir`.
    fn save_state(&self, dir: &Path) -> Result<ComponentState, AggregatorError>;

    /// Restores a state saved by [`save_state`](Aggregator::save_state).
    fn load_state(&mut self, state: &ComponentState, dir: &Path) -> Result<(), AggregatorError>;
}

/// Creates the aggregator described by the settings.
///
/// # Errors
/// Fails if the settings are invalid for the aggregator.
pub fn from_settings(
    settings: &AggregatorSettings,
    fds: &FederatedDataset,
) -> Result<Box<dyn Aggregator>, AggregatorError> {
    match settings.kind {
        AggregatorKind::FedAvg => Ok(Box::new(FedAvg::new())),
        AggregatorKind::Scaffold => Ok(Box::new(Scaffold::new(settings.server_lr, fds)?)),
    }
}

/// Restores an aggregator from a breakpoint.
///
/// # Errors
/// Fails if the aggregator is unknown or its state is invalid.
pub fn restore(state: &ComponentState, dir: &Path) -> Result<Box<dyn Aggregator>, AggregatorError> {
    match state.name.as_str() {
        fedavg::NAME => {
            let mut fedavg = FedAvg::new();
            fedavg.load_state(state, dir)?;
            Ok(Box::new(fedavg))
        }
        scaffold::NAME => Ok(Box::new(Scaffold::from_state(state, dir)?)),
        name => Err(AggregatorError::UnknownAggregator(name.to_string())),
    }
}

/// Normalizes weights to sum up to 1. No weights means equal weights.
///
/// # Errors
/// Fails if the weights don't match the updates, or if they are negative, not finite or sum up
/// to 0.
pub fn normalize_weights(weights: &[f64], n: usize) -> Result<Vec<f64>, AggregatorError> {
    if n == 0 {
        return Err(AggregatorError::NoUpdates);
    }
    if weights.is_empty() {
        return Ok(vec![1.0 / n as f64; n]);
    }
    if weights.len() != n {
        return Err(AggregatorError::InvalidWeights(format!(
            "{} weights for {} updates",
            weights.len(),
            n
        )));
    }
    if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
        return Err(AggregatorError::InvalidWeights(format!("{:?}", weights)));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(AggregatorError::InvalidWeights("the weights sum up to 0".into()));
    }
    Ok(weights.iter().map(|weight| weight / total).collect())
}

/// Averages parameter sets with normalized weights.
fn weighted_average<'a>(
    params: impl IntoIterator<Item = &'a Params>,
    weights: &[f64],
) -> Result<Params, AggregatorError> {
    let mut params = params.into_iter().zip(weights);
    let (first, weight) = params.next().ok_or(AggregatorError::NoUpdates)?;
    let mut average = first.scale(*weight);
    for (params, weight) in params {
        average.add_assign(&params.scale(*weight))?;
    }
    Ok(average)
}

#[cfg(test)]
pub(crate) mod tests {
    use fedlab_core::Tensor;

    use super::*;

    pub fn params(weight: f64) -> Params {
        let mut params = Params::new();
        params.insert("layer", Tensor::from_vec(vec![weight, 2.0 * weight]));
        params
    }

    pub fn update(node: &str, weight: f64, lr: f64) -> NodeUpdate {
        let mut optimizer_args = BTreeMap::new();
        optimizer_args.insert("lr".to_string(), lr);
        NodeUpdate {
            node_id: node.into(),
            params: params(weight),
            optimizer_args,
        }
    }

    #[test]
    fn test_normalize_weights() {
        assert_eq!(normalize_weights(&[2.0, 2.0], 2).unwrap(), vec![0.5, 0.5]);
        assert_eq!(normalize_weights(&[], 4).unwrap(), vec![0.25; 4]);
        assert_eq!(normalize_weights(&[1.0, 3.0], 2).unwrap(), vec![0.25, 0.75]);
        assert!(matches!(
            normalize_weights(&[0.0, 0.0], 2),
            Err(AggregatorError::InvalidWeights(_))
        ));
        assert!(matches!(
            normalize_weights(&[1.0, -1.0], 2),
            Err(AggregatorError::InvalidWeights(_))
        ));
        assert!(matches!(
            normalize_weights(&[1.0], 2),
            Err(AggregatorError::InvalidWeights(_))
        ));
        assert!(matches!(normalize_weights(&[], 0), Err(AggregatorError::NoUpdates)));
    }

    #[test]
    fn test_learning_rate_per_layer() {
        let mut update = update("a", 1.0, 0.1);
        assert_eq!(update.learning_rate("layer"), Some(0.1));
        update.optimizer_args.insert("lr/layer".into(), 0.5);
        assert_eq!(update.learning_rate("layer"), Some(0.5));
        assert_eq!(update.learning_rate("other"), Some(0.1));
    }

    #[test]
    fn test_from_settings() {
        let fds = crate::datasets::tests::federation(&["a"]);
        let mut settings = AggregatorSettings {
            kind: AggregatorKind::FedAvg,
            server_lr: 1.0,
            upload_args: false,
        };
        assert_eq!(from_settings(&settings, &fds).unwrap().name(), "fedavg");
        settings.kind = AggregatorKind::Scaffold;
        assert_eq!(from_settings(&settings, &fds).unwrap().name(), "scaffold");
        settings.server_lr = 0.0;
        assert!(matches!(
            from_settings(&settings, &fds),
            Err(AggregatorError::ZeroServerLr)
        ));
    }
}
