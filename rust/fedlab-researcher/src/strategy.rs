//! Node selection strategies.

use displaydoc::Display;
use thiserror::Error;
use tracing::{debug, warn};

use fedlab_core::NodeId;

use crate::{
    aggregator::NodeUpdate,
    breakpoint::ComponentState,
    datasets::FederatedDataset,
    job::TrainingReply,
};

const DEFAULT_STRATEGY: &str = "default";

/// Errors of the node selection strategies.
#[derive(Debug, Display, Error)]
pub enum StrategyError {
    /// Round {0} brought no usable reply.
    NoUsableReplies(u32),
    /// Unknown node selection strategy {0}.
    UnknownStrategy(String),
}

/// Chooses the nodes of a round and turns their replies into weighted updates.
pub trait NodeSelectionStrategy: Send {
    /// The nodes taking part in `round`.
    fn sample_nodes(&mut self, round: u32) -> Vec<NodeId>;

    /// Turns the replies of `round` into updates and their aggregation weights.
    fn refine(
        &mut self,
        replies: &[TrainingReply],
        round: u32,
    ) -> Result<(Vec<NodeUpdate>, Vec<f64>), StrategyError>;

    /// Forgets the nodes which left the federation.
    fn remove_nodes(&mut self, nodes: &[NodeId]);

    fn save_state(&self) -> ComponentState;
}

/// Selects every node of the federated dataset and weights the updates by sample size.
#[derive(Clone, Debug)]
pub struct DefaultStrategy {
    fds: FederatedDataset,
}

impl DefaultStrategy {
    pub fn new(fds: FederatedDataset) -> Self {
        Self { fds }
    }
}

impl NodeSelectionStrategy for DefaultStrategy {
    fn sample_nodes(&mut self, round: u32) -> Vec<NodeId> {
        let nodes = self.fds.node_ids();
        debug!("{} nodes selected for round {}", nodes.len(), round);
        nodes
    }

    fn refine(
        &mut self,
        replies: &[TrainingReply],
        round: u32,
    ) -> Result<(Vec<NodeUpdate>, Vec<f64>), StrategyError> {
        let mut updates = Vec::with_capacity(replies.len());
        let mut weights = Vec::with_capacity(replies.len());
        for reply in replies {
            if !reply.success {
                warn!(
                    "skipping the failed reply of node {}: {}",
                    reply.node_id, reply.msg
                );
                continue;
            }
            let params = match &reply.params {
                Some(params) => params.clone(),
                None => {
                    warn!("skipping the reply of node {} without parameters", reply.node_id);
                    continue;
                }
            };
            updates.push(NodeUpdate {
                node_id: reply.node_id.clone(),
                params,
                optimizer_args: reply.optimizer_args.clone(),
            });
            weights.push(reply.sample_size.unwrap_or_default() as f64);
        }
        if updates.is_empty() {
            return Err(StrategyError::NoUsableReplies(round));
        }
        Ok((updates, weights))
    }

    fn remove_nodes(&mut self, nodes: &[NodeId]) {
        for node_id in nodes {
            self.fds.remove(node_id);
        }
    }

    fn save_state(&self) -> ComponentState {
        ComponentState::new(DEFAULT_STRATEGY)
    }
}

/// Restores a node selection strategy from a breakpoint.
///
/// # Errors
/// Fails if the strategy is unknown.
pub fn restore(
    state: &ComponentState,
    fds: &FederatedDataset,
) -> Result<Box<dyn NodeSelectionStrategy>, StrategyError> {
    match state.name.as_str() {
        DEFAULT_STRATEGY => Ok(Box::new(DefaultStrategy::new(fds.clone()))),
        name => Err(StrategyError::UnknownStrategy(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fedlab_core::{Params, Timing};

    use super::*;
    use crate::{aggregator::tests::params, datasets::tests::federation};

    fn reply(node: &str, success: bool, sample_size: usize) -> TrainingReply {
        TrainingReply {
            node_id: node.into(),
            success,
            msg: String::new(),
            dataset_id: Some("d0".into()),
            sample_size: Some(sample_size),
            timing: Timing::default(),
            params_path: None,
            params: if success { Some(params(1.0)) } else { None },
            optimizer_args: BTreeMap::new(),
        }
    }

    #[test]
    fn test_every_node_is_selected() {
        let mut strategy = DefaultStrategy::new(federation(&["a", "b", "c"]));
        assert_eq!(strategy.sample_nodes(0).len(), 3);
        strategy.remove_nodes(&["b".into()]);
        assert_eq!(
            strategy.sample_nodes(1),
            vec![NodeId::from("a"), NodeId::from("c")]
        );
    }

    #[test]
    fn test_weights_are_sample_sizes() {
        let mut strategy = DefaultStrategy::new(federation(&["a", "b", "c"]));
        let replies = vec![reply("a", true, 10), reply("b", false, 0), reply("c", true, 30)];
        let (updates, weights) = strategy.refine(&replies, 0).unwrap();
        assert_eq!(
            updates.iter().map(|u| u.node_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(weights, vec![10.0, 30.0]);
    }

    #[test]
    fn test_no_usable_replies() {
        let mut strategy = DefaultStrategy::new(federation(&["a"]));
        let mut missing_params = reply("a", true, 10);
        missing_params.params = None::<Params>;
        assert!(matches!(
            strategy.refine(&[reply("a", false, 0), missing_params], 3),
            Err(StrategyError::NoUsableReplies(3))
        ));
    }

    #[test]
    fn test_restore() {
        let fds = federation(&["a"]);
        let state = DefaultStrategy::new(fds.clone()).save_state();
        let mut strategy = restore(&state, &fds).unwrap();
        assert_eq!(strategy.sample_nodes(1), vec![NodeId::from("a")]);
        assert!(restore(&ComponentState::new("random"), &fds).is_err());
    }
}
