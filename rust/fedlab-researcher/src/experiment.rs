//! The experiment loop.
//!
//! An experiment searches the federation for matching datasets, then runs a fixed number of rounds:
//! the node selection strategy picks the nodes, the job ships the global model to them, and the
//! aggregator turns their updates into the next global model. After each round a breakpoint can be
//! written, from which the experiment resumes later on.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use displaydoc::Display;
use thiserror::Error;
use tracing::{info, warn};

use fedlab_core::{
    args::{TrainingArgs, TrainingArgsError},
    exchange::ArtifactExchange,
    message::ModelStatusReply,
    ModelError,
    NodeId,
    Params,
};

use crate::{
    aggregator::{self, AggregationContext, Aggregator, AggregatorError},
    breakpoint::{self, BreakpointError, BreakpointStore},
    datasets::DataQualityError,
    job::{Job, JobConfig, JobError},
    requests::{RequestCoordinator, RequestError},
    settings::{AggregatorSettings, ExperimentSettings},
    strategy::{self, DefaultStrategy, NodeSelectionStrategy, StrategyError},
};

/// Errors of an experiment.
#[derive(Debug, Display, Error)]
pub enum ExperimentError {
    /// No node holds a dataset tagged with {0:?}.
    NoDatasets(Vec<String>),
    /// No node is left to take part in the experiment.
    NoActiveNodes,
    /// No breakpoint found in {0:?}.
    NoBreakpoint(PathBuf),
    /// {0}
    Arguments(#[from] TrainingArgsError),
    /// The federated datasets can't be trained on together: {0}
    DataQuality(#[from] DataQualityError),
    /// {0}
    Request(#[from] RequestError),
    /// {0}
    Job(#[from] JobError),
    /// Aggregation failed: {0}.
    Aggregator(#[from] AggregatorError),
    /// {0}
    Strategy(#[from] StrategyError),
    /// {0}
    Breakpoint(#[from] BreakpointError),
    /// Failed to load the initial parameters: {0}.
    Params(#[from] ModelError),
}

pub struct Experiment {
    coordinator: RequestCoordinator,
    job: Job,
    aggregator: Box<dyn Aggregator>,
    strategy: Box<dyn NodeSelectionStrategy>,
    tags: Vec<String>,
    rounds: u32,
    round_current: u32,
    n_updates: u32,
    test_on_global_updates: bool,
    breakpoints: Option<BreakpointStore>,
}

impl Experiment {
    /// Creates an experiment on the nodes holding datasets tagged with the experiment tags.
    ///
    /// # Errors
    /// Fails if no node holds a matching dataset, if the datasets of the nodes don't match, if the
    /// training arguments are invalid or if the job can't be created.
    pub async fn new(
        settings: &ExperimentSettings,
        aggregator_settings: &AggregatorSettings,
        mut coordinator: RequestCoordinator,
        exchange: Arc<dyn ArtifactExchange>,
    ) -> Result<Self, ExperimentError> {
        let args = TrainingArgs::from_bag(&settings.training_args)?;
        let fds = coordinator.search(&settings.tags, None).await?;
        if fds.is_empty() {
            return Err(ExperimentError::NoDatasets(settings.tags.clone()));
        }
        info!("{} nodes hold matching datasets", fds.len());
        fds.check_quality()?;

        let params = Params::load(&settings.params_path)?;
        let mut aggregator = aggregator::from_settings(aggregator_settings, &fds)?;
        aggregator.bind_plan_kind(settings.plan_kind)?;
        let strategy = Box::new(DefaultStrategy::new(fds.clone()));
        let config = JobConfig {
            researcher_id: coordinator.researcher_id().clone(),
            plan_path: settings.plan_path.clone(),
            plan_class: settings.plan_class.clone(),
            model_args: settings.model_args.clone(),
            training_args: settings.training_args.clone(),
            experiment_dir: settings.experiment_dir.clone(),
            upload_args: aggregator_settings.upload_args,
        };
        let job = Job::new(config, fds, params, exchange).await?;

        Ok(Self {
            coordinator,
            job,
            aggregator,
            strategy,
            tags: settings.tags.clone(),
            rounds: settings.rounds,
            round_current: 0,
            n_updates: args.training_arguments().expected_updates(),
            test_on_global_updates: args.test_on_global_updates,
            breakpoints: breakpoint_store(settings),
        })
    }

    /// Resumes an experiment from a breakpoint directory, or from the latest breakpoint of the
    /// experiment if none is given.
    ///
    /// # Errors
    /// Fails if there is no breakpoint or if it can't be restored.
    pub async fn load_breakpoint(
        dir: Option<&Path>,
        settings: &ExperimentSettings,
        aggregator_settings: &AggregatorSettings,
        coordinator: RequestCoordinator,
        exchange: Arc<dyn ArtifactExchange>,
    ) -> Result<Self, ExperimentError> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => {
                let store = BreakpointStore::new(settings.breakpoint_dir());
                store
                    .latest()?
                    .ok_or_else(|| ExperimentError::NoBreakpoint(store.root().to_path_buf()))?
            }
        };
        let breakpoint = breakpoint::read(&dir)?;
        let args = TrainingArgs::from_bag(&breakpoint.training_args)?;
        let mut aggregator = aggregator::restore(&breakpoint.aggregator, &dir)?;
        aggregator.bind_plan_kind(settings.plan_kind)?;
        let strategy =
            strategy::restore(&breakpoint.node_selection_strategy, &breakpoint.training_data)?;
        let job = Job::restore(
            &breakpoint,
            &dir,
            settings.experiment_dir.clone(),
            aggregator_settings.upload_args,
            exchange,
        )
        .await?;

        Ok(Self {
            coordinator,
            job,
            aggregator,
            strategy,
            tags: breakpoint.tags,
            rounds: breakpoint.round_number_due,
            round_current: breakpoint.round_number,
            n_updates: args.training_arguments().expected_updates(),
            test_on_global_updates: args.test_on_global_updates,
            breakpoints: breakpoint_store(settings),
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn aggregator(&self) -> &dyn Aggregator {
        self.aggregator.as_ref()
    }

    pub fn coordinator(&mut self) -> &mut RequestCoordinator {
        &mut self.coordinator
    }

    /// The number of rounds done.
    pub fn round_current(&self) -> u32 {
        self.round_current
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Runs the remaining rounds and returns the final global model.
    ///
    /// If validation on the global updates is requested, the final model is validated by the
    /// nodes afterwards.
    ///
    /// # Errors
    /// Fails as soon as a round fails.
    pub async fn run(&mut self) -> Result<Params, ExperimentError> {
        while self.round_current < self.rounds {
            self.run_once().await?;
        }
        if self.test_on_global_updates {
            self.validate().await?;
        }
        info!("experiment done after {} rounds", self.round_current);
        Ok(self.job.params().clone())
    }

    /// Runs one round.
    ///
    /// # Errors
    /// Fails if no node is left, if no node sent a usable update or if the aggregation fails.
    pub async fn run_once(&mut self) -> Result<(), ExperimentError> {
        let round = self.round_current;
        let nodes = self.strategy.sample_nodes(round);
        if nodes.is_empty() {
            return Err(ExperimentError::NoActiveNodes);
        }
        info!("round {} of {} on {} nodes", round + 1, self.rounds, nodes.len());

        let args = self.aggregator.aggregator_args(self.job.params(), &nodes)?;
        let report = self
            .job
            .start_round(&mut self.coordinator, round, &nodes, args, true)
            .await?;
        self.forget(&report.faulty);
        if self.job.fds().is_empty() {
            return Err(ExperimentError::NoActiveNodes);
        }

        let (updates, weights) = self.strategy.refine(self.job.training_replies(round), round)?;
        let ctx = AggregationContext {
            round,
            n_updates: self.n_updates,
        };
        let params = self
            .aggregator
            .aggregate(&updates, &weights, self.job.params(), &ctx)?;
        self.job.update_parameters(round, params).await?;
        self.round_current += 1;

        if let Some(store) = &self.breakpoints {
            self.save_breakpoint(store)?;
        }
        Ok(())
    }

    /// Has the nodes validate the global model without training.
    async fn validate(&mut self) -> Result<(), ExperimentError> {
        let round = self.round_current;
        let nodes = self.strategy.sample_nodes(round);
        if nodes.is_empty() {
            return Err(ExperimentError::NoActiveNodes);
        }
        info!("validating the global model on {} nodes", nodes.len());
        let args = self.aggregator.aggregator_args(self.job.params(), &nodes)?;
        let report = self
            .job
            .start_round(&mut self.coordinator, round, &nodes, args, false)
            .await?;
        self.forget(&report.faulty);
        Ok(())
    }

    fn forget(&mut self, nodes: &[NodeId]) {
        if nodes.is_empty() {
            return;
        }
        warn!("{} nodes were faulty and leave the experiment", nodes.len());
        self.strategy.remove_nodes(nodes);
        self.aggregator.drop_nodes(nodes);
    }

    /// Writes a breakpoint of the current state into `store`.
    ///
    /// # Errors
    /// Fails if the breakpoint can't be written.
    pub fn save_breakpoint(&self, store: &BreakpointStore) -> Result<PathBuf, ExperimentError> {
        let dir = store.create(self.round_current)?;
        let aggregator = self.aggregator.save_state(dir.path())?;
        let strategy = self.strategy.save_state();
        let breakpoint = self.job.breakpoint(
            &dir,
            self.round_current,
            self.rounds,
            aggregator,
            strategy,
            self.tags.clone(),
        )?;
        Ok(dir.write(&breakpoint)?)
    }

    /// Asks the nodes of the experiment whether they approved the training plan.
    pub async fn model_status(&mut self) -> BTreeMap<NodeId, ModelStatusReply> {
        self.job.check_plan_approved(&mut self.coordinator).await
    }
}

fn breakpoint_store(settings: &ExperimentSettings) -> Option<BreakpointStore> {
    if settings.save_breakpoints {
        Some(BreakpointStore::new(settings.breakpoint_dir()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use fedlab_core::{message::ApprovalStatus, ArgBag, PlanKind};
    use serde_json::json;

    use super::*;
    use crate::{
        aggregator::tests::params,
        settings::AggregatorKind,
        datasets::tests::descriptor,
        testutils::{spawn_node, spawn_node_with_dataset, Behavior, Sandbox},
    };

    fn settings(sandbox: &Sandbox, rounds: u32) -> ExperimentSettings {
        let mut training_args = ArgBag::new();
        training_args.insert("lr".into(), json!(0.1));
        training_args.insert("epochs".into(), json!(1));
        training_args.insert("batch_maxnum".into(), json!(2));
        ExperimentSettings {
            rounds,
            tags: vec!["heart".into()],
            plan_path: sandbox.dir.path().join("plan.json"),
            plan_class: "Plan".into(),
            plan_kind: PlanKind::Gradient,
            params_path: sandbox.dir.path().join("params.bin"),
            model_args: ArgBag::new(),
            training_args,
            experiment_dir: sandbox.dir.path().join("experiment"),
            save_breakpoints: true,
        }
    }

    fn fedavg() -> AggregatorSettings {
        AggregatorSettings {
            kind: AggregatorKind::FedAvg,
            server_lr: 1.0,
            upload_args: false,
        }
    }

    fn train(weight: f64, sample_size: usize) -> Behavior {
        Behavior::Train {
            weight,
            sample_size,
        }
    }

    async fn experiment(sandbox: &Sandbox, rounds: u32) -> Experiment {
        Experiment::new(
            &settings(sandbox, rounds),
            &fedavg(),
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_no_matching_datasets() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        let mut settings = settings(&sandbox, 1);
        settings.tags = vec!["mnist".into()];
        let result = Experiment::new(
            &settings,
            &fedavg(),
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await;
        assert!(matches!(result, Err(ExperimentError::NoDatasets(_))));
    }

    #[tokio::test]
    async fn test_mismatching_datasets() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        let mut wide = descriptor("b-data");
        wide.shape = vec![20, 4];
        spawn_node_with_dataset(&sandbox, "b", train(1.0, 10), wide);
        let result = Experiment::new(
            &settings(&sandbox, 1),
            &fedavg(),
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await;
        assert!(matches!(
            result,
            Err(ExperimentError::DataQuality(DataQualityError::ColumnCounts(_)))
        ));
    }

    #[tokio::test]
    async fn test_weighted_rounds() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        spawn_node(&sandbox, "b", train(3.0, 30));
        let mut experiment = experiment(&sandbox, 2).await;

        let global = experiment.run().await.unwrap();
        // (1 * 10 + 3 * 30) / 40
        assert_eq!(global, params(2.5));
        assert_eq!(experiment.round_current(), 2);
        assert_eq!(experiment.job().aggregated_params().len(), 2);
        assert_eq!(experiment.job().training_replies(1).len(), 2);
    }

    #[tokio::test]
    async fn test_faulty_node_leaves() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        spawn_node(&sandbox, "b", Behavior::Error);
        let mut experiment = experiment(&sandbox, 2).await;

        experiment.run_once().await.unwrap();
        assert_eq!(experiment.job().fds().node_ids(), vec![NodeId::from("a")]);
        assert_eq!(experiment.job().params(), &params(1.0));

        experiment.run_once().await.unwrap();
        assert_eq!(experiment.job().training_replies(1).len(), 1);
    }

    #[tokio::test]
    async fn test_all_nodes_faulty() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", Behavior::Error);
        let mut experiment = experiment(&sandbox, 1).await;
        assert!(matches!(
            experiment.run_once().await,
            Err(ExperimentError::NoActiveNodes)
        ));
    }

    #[tokio::test]
    async fn test_no_usable_update() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", Behavior::Fail);
        let mut experiment = experiment(&sandbox, 1).await;
        assert!(matches!(
            experiment.run_once().await,
            Err(ExperimentError::Strategy(StrategyError::NoUsableReplies(0)))
        ));
        assert_eq!(experiment.round_current(), 0);
    }

    #[tokio::test]
    async fn test_resume_from_latest_breakpoint() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        let settings = settings(&sandbox, 3);
        let mut experiment = experiment(&sandbox, 3).await;
        experiment.run_once().await.unwrap();
        experiment.run_once().await.unwrap();
        let job_id = experiment.job().id().clone();
        drop(experiment);

        let resumed = Experiment::load_breakpoint(
            None,
            &settings,
            &fedavg(),
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await
        .unwrap();
        assert_eq!(resumed.round_current(), 2);
        assert_eq!(resumed.rounds(), 3);
        assert_eq!(resumed.job().id(), &job_id);
        assert_eq!(resumed.job().params(), &params(1.0));
        assert_eq!(resumed.job().aggregated_params().len(), 2);
        assert_eq!(resumed.aggregator().name(), "fedavg");
    }

    #[tokio::test]
    async fn test_resume_scaffold() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        spawn_node(&sandbox, "b", train(3.0, 10));
        let settings = settings(&sandbox, 2);
        let scaffold = AggregatorSettings {
            kind: AggregatorKind::Scaffold,
            server_lr: 1.0,
            upload_args: true,
        };
        let mut experiment = Experiment::new(
            &settings,
            &scaffold,
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await
        .unwrap();
        experiment.run_once().await.unwrap();
        assert_eq!(experiment.job().params(), &params(2.0));
        drop(experiment);

        let mut resumed = Experiment::load_breakpoint(
            None,
            &settings,
            &scaffold,
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await
        .unwrap();
        assert_eq!(resumed.aggregator().name(), "scaffold");
        resumed.run().await.unwrap();
        assert_eq!(resumed.round_current(), 2);
    }

    #[tokio::test]
    async fn test_missing_breakpoint() {
        let sandbox = Sandbox::new();
        let settings = settings(&sandbox, 1);
        let result = Experiment::load_breakpoint(
            None,
            &settings,
            &fedavg(),
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await;
        assert!(matches!(result, Err(ExperimentError::NoBreakpoint(_))));
    }

    #[tokio::test]
    async fn test_model_status() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        let mut experiment = experiment(&sandbox, 1).await;
        let status = experiment.model_status().await;
        assert_eq!(status[&NodeId::from("a")].status, Some(ApprovalStatus::Approved));
    }

    #[tokio::test]
    async fn test_validation_round() {
        let sandbox = Sandbox::new();
        spawn_node(&sandbox, "a", train(1.0, 10));
        let mut settings = settings(&sandbox, 1);
        settings
            .training_args
            .insert("test_on_global_updates".into(), json!(true));
        let mut experiment = Experiment::new(
            &settings,
            &fedavg(),
            sandbox.coordinator(),
            Arc::new(sandbox.exchange.clone()),
        )
        .await
        .unwrap();
        experiment.run().await.unwrap();
        let validation = experiment.job().training_replies(1);
        assert_eq!(validation.len(), 1);
        assert!(validation[0].success);
        assert!(validation[0].params.is_none());
    }
}
