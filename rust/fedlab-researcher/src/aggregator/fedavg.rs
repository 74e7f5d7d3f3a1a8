use std::path::Path;

use fedlab_core::Params;

use super::{
    normalize_weights,
    weighted_average,
    AggregationContext,
    Aggregator,
    AggregatorError,
    NodeUpdate,
};
use crate::breakpoint::ComponentState;

pub(super) const NAME: &str = "fedavg";

/// Federated averaging: the next global model is the weighted average of the updates.
#[derive(Clone, Debug, Default)]
pub struct FedAvg;

impl FedAvg {
    pub fn new() -> Self {
        Self
    }
}

impl Aggregator for FedAvg {
    fn name(&self) -> &'static str {
        NAME
    }

    fn aggregate(
        &mut self,
        updates: &[NodeUpdate],
        weights: &[f64],
        _global: &Params,
        _ctx: &AggregationContext,
    ) -> Result<Params, AggregatorError> {
        let weights = normalize_weights(weights, updates.len())?;
        weighted_average(updates.iter().map(|update| &update.params), &weights)
    }

    fn save_state(&self, _dir: &Path) -> Result<ComponentState, AggregatorError> {
        Ok(ComponentState::new(NAME))
    }

    fn load_state(&mut self, state: &ComponentState, _dir: &Path) -> Result<(), AggregatorError> {
        if state.name != NAME {
            return Err(AggregatorError::State(format!(
                "{} can't restore the state of {}",
                NAME, state.name
            )));
        }
        Ok(())
    }
}
