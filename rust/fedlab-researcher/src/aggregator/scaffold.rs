use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use fedlab_core::{
    message::{AggregatorArg, AggregatorArgs, AGGREGATOR_CORRECTION_ARG, AGGREGATOR_NAME_ARG},
    NodeId,
    Params,
    PlanKind,
};

use super::{
    normalize_weights,
    weighted_average,
    AggregationContext,
    Aggregator,
    AggregatorError,
    NodeUpdate,
};
use crate::{breakpoint::ComponentState, datasets::FederatedDataset};

pub(super) const NAME: &str = "scaffold";

const CORRECTIONS_FILE: &str = "aggregator_corrections.bin";

#[derive(Debug, Serialize, Deserialize)]
struct ScaffoldState {
    server_lr: f64,
    federated_dataset: FederatedDataset,
    corrections_path: Option<PathBuf>,
}

/// Federated averaging with drift correction.
///
/// Every node of the federated dataset owns a correction. The correction is sent to the node
/// along with the global model and steers its local training. After each round the averaged
/// change of the corrections of the participants is added to the correction of every node:
///
/// - `scaled = local * server_lr + global * (1 - server_lr)`
/// - the next global model is the weighted average of the scaled updates
/// - `delta = (global - scaled) / (server_lr * local_lr * n_updates) - correction`, averaged with
///   weight `1 / N` where `N` is the number of nodes of the federated dataset
pub struct Scaffold {
    server_lr: f64,
    fds: FederatedDataset,
    corrections: BTreeMap<NodeId, Params>,
}

impl Scaffold {
    /// Creates the aggregator for the nodes of `fds`.
    ///
    /// # Errors
    /// Fails if `server_lr` is 0 or `fds` is empty.
    pub fn new(server_lr: f64, fds: &FederatedDataset) -> Result<Self, AggregatorError> {
        if server_lr == 0.0 || !server_lr.is_finite() {
            return Err(AggregatorError::ZeroServerLr);
        }
        if fds.is_empty() {
            return Err(AggregatorError::MissingFederatedDataset);
        }
        Ok(Self {
            server_lr,
            fds: fds.clone(),
            corrections: BTreeMap::new(),
        })
    }

    /// Restores the aggregator from a state saved into `dir`.
    pub(super) fn from_state(state: &ComponentState, dir: &Path) -> Result<Self, AggregatorError> {
        if state.name != NAME {
            return Err(AggregatorError::State(format!(
                "{} can't restore the state of {}",
                NAME, state.name
            )));
        }
        let state: ScaffoldState = serde_json::from_value(state.parameters.clone())
            .map_err(|err| AggregatorError::State(err.to_string()))?;
        let mut scaffold = Scaffold::new(state.server_lr, &state.federated_dataset)?;
        if let Some(path) = state.corrections_path {
            scaffold.corrections = bincode::deserialize(&fs::read(dir.join(path))?)?;
        }
        Ok(scaffold)
    }

    pub fn corrections(&self) -> &BTreeMap<NodeId, Params> {
        &self.corrections
    }

    /// Gives every node without a correction a zero correction shaped like `global`.
    fn ensure_corrections(&mut self, global: &Params) {
        for node_id in self.fds.node_ids() {
            self.corrections
                .entry(node_id)
                .or_insert_with(|| global.zeros_like());
        }
    }

    fn correction_delta(
        &self,
        update: &NodeUpdate,
        scaled: &Params,
        global: &Params,
        n_updates: u32,
    ) -> Result<Params, AggregatorError> {
        let correction = self
            .corrections
            .get(&update.node_id)
            .ok_or_else(|| AggregatorError::UnknownNode(update.node_id.clone()))?;
        let drift = global.sub(scaled)?;
        let drift = drift
            .iter()
            .map(|(layer, tensor)| {
                let local_lr = update
                    .learning_rate(layer)
                    .filter(|lr| *lr != 0.0)
                    .ok_or_else(|| AggregatorError::ZeroLearningRate(update.node_id.clone()))?;
                let factor = 1.0 / (self.server_lr * local_lr * f64::from(n_updates));
                Ok((layer.clone(), tensor.scale(factor)))
            })
            .collect::<Result<Params, AggregatorError>>()?;
        Ok(drift.sub(correction)?)
    }
}

impl Aggregator for Scaffold {
    fn name(&self) -> &'static str {
        NAME
    }

    fn bind_plan_kind(&mut self, kind: PlanKind) -> Result<(), AggregatorError> {
        match kind {
            PlanKind::Gradient => Ok(()),
            PlanKind::Estimator => Err(AggregatorError::UnsupportedPlanKind(kind)),
        }
    }

    fn aggregate(
        &mut self,
        updates: &[NodeUpdate],
        weights: &[f64],
        global: &Params,
        ctx: &AggregationContext,
    ) -> Result<Params, AggregatorError> {
        if ctx.n_updates == 0 {
            return Err(AggregatorError::InvalidUpdateCount);
        }
        let weights = normalize_weights(weights, updates.len())?;
        self.ensure_corrections(global);

        let lr = self.server_lr;
        let kept = global.scale(1.0 - lr);
        let scaled = updates
            .iter()
            .map(|update| Ok(update.params.scale(lr).add(&kept)?))
            .collect::<Result<Vec<Params>, AggregatorError>>()?;
        let aggregated = weighted_average(&scaled, &weights)?;

        let share = 1.0 / self.fds.len() as f64;
        let mut delta = global.zeros_like();
        for (update, scaled) in updates.iter().zip(&scaled) {
            let node_delta = self.correction_delta(update, scaled, global, ctx.n_updates)?;
            delta.add_assign(&node_delta.scale(share))?;
        }
        for correction in self.corrections.values_mut() {
            correction.add_assign(&delta)?;
        }
        debug!(
            "round {}: corrections of {} nodes updated from {} updates",
            ctx.round,
            self.corrections.len(),
            updates.len()
        );
        Ok(aggregated)
    }

    fn aggregator_args(
        &mut self,
        global: &Params,
        nodes: &[NodeId],
    ) -> Result<BTreeMap<NodeId, AggregatorArgs>, AggregatorError> {
        self.ensure_corrections(global);
        nodes
            .iter()
            .map(|node_id| {
                let correction = self
                    .corrections
                    .get(node_id)
                    .ok_or_else(|| AggregatorError::UnknownNode(node_id.clone()))?;
                let mut args = AggregatorArgs::new();
                args.insert(AGGREGATOR_NAME_ARG.into(), AggregatorArg::Value(json!(NAME)));
                args.insert(
                    AGGREGATOR_CORRECTION_ARG.into(),
                    AggregatorArg::Params(correction.clone()),
                );
                Ok((node_id.clone(), args))
            })
            .collect()
    }

    fn drop_nodes(&mut self, nodes: &[NodeId]) {
        for node_id in nodes {
            self.corrections.remove(node_id);
            self.fds.remove(node_id);
        }
    }

    fn save_state(&self, dir: &Path) -> Result<ComponentState, AggregatorError> {
        let corrections_path = if self.corrections.is_empty() {
            None
        } else {
            fs::write(dir.join(CORRECTIONS_FILE), bincode::serialize(&self.corrections)?)?;
            Some(PathBuf::from(CORRECTIONS_FILE))
        };
        let state = ScaffoldState {
            server_lr: self.server_lr,
            federated_dataset: self.fds.clone(),
            corrections_path,
        };
        let parameters =
            serde_json::to_value(&state).map_err(|err| AggregatorError::State(err.to_string()))?;
        Ok(ComponentState {
            name: NAME.to_string(),
            parameters,
        })
    }

    fn load_state(&mut self, state: &ComponentState, dir: &Path) -> Result<(), AggregatorError> {
        *self = Self::from_state(state, dir)?;
        Ok(())
    }
}
