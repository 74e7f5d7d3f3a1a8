//! The contract of a training plan.
//!
//! A training plan is the unit of code the researcher ships to the nodes. The node never looks
//! inside of it: it hands it the received parameters, the local data and the training arguments,
//! drives the training and testing routines, and reads the updated parameters back.

use std::collections::BTreeMap;

use fedlab_core::{
    args::{LoaderArgs, TestingArgs, TrainingArguments},
    message::AggregatorArgs,
    ArgBag,
    DatasetDescriptor,
    Params,
    PlanKind,
};

/// The error type of training plans.
pub type PlanError = anyhow::Error;

/// Metrics computed by a testing routine, by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// A training plan.
///
/// The methods are called in the following order during a round: [`post_init`],
/// [`set_aggregator_args`], [`load_params`], [`training_data`], [`testing_routine`] (optional),
/// [`training_routine`], [`testing_routine`] (optional), [`params`] and [`optimizer_args`].
///
/// Calls may block: the round executor runs the expensive ones on a blocking thread.
///
/// [`post_init`]: TrainingPlan::post_init
/// [`set_aggregator_args`]: TrainingPlan::set_aggregator_args
/// [`load_params`]: TrainingPlan::load_params
/// [`training_data`]: TrainingPlan::training_data
/// [`testing_routine`]: TrainingPlan::testing_routine
/// [`training_routine`]: TrainingPlan::training_routine
/// [`params`]: TrainingPlan::params
/// [`optimizer_args`]: TrainingPlan::optimizer_args
pub trait TrainingPlan: Send {
    fn kind(&self) -> PlanKind;

    /// Initializes the plan with the model arguments and the training arguments.
    fn post_init(&mut self, model_args: &ArgBag, args: &TrainingArguments) -> Result<(), PlanError>;

    /// Hands over the auxiliary arguments of the aggregator, e.g. a drift correction.
    fn set_aggregator_args(&mut self, _args: &AggregatorArgs) -> Result<(), PlanError> {
        Ok(())
    }

    /// Replaces the parameters of the model.
    fn load_params(&mut self, params: Params) -> Result<(), PlanError>;

    /// Gets the current parameters of the model.
    fn params(&self) -> Params;

    /// Opens the dataset and describes it to the node.
    fn training_data(
        &mut self,
        dataset: &DatasetDescriptor,
        loader: &LoaderArgs,
    ) -> Result<DataManager, PlanError>;

    /// Trains the model on the samples of `loader`. Returns the number of optimizer steps taken.
    fn training_routine(
        &mut self,
        loader: &DataLoader,
        args: &TrainingArguments,
    ) -> Result<u32, PlanError>;

    /// Evaluates the model on the samples of `loader`.
    fn testing_routine(
        &mut self,
        loader: &DataLoader,
        args: &TestingArgs,
        before_training: bool,
    ) -> Result<Metrics, PlanError>;

    /// The state of the optimizer to report alongside the updated parameters.
    fn optimizer_args(&self, args: &TrainingArguments) -> BTreeMap<String, f64> {
        let mut optimizer_args = BTreeMap::new();
        optimizer_args.insert("lr".to_string(), args.lr);
        optimizer_args
    }
}

/// The samples of a dataset, as seen by the node.
///
/// Samples are addressed by index, the plan maps indices back to its own storage.
#[derive(Clone, Debug, PartialEq)]
pub struct DataManager {
    len: usize,
    loader: LoaderArgs,
}

impl DataManager {
    pub fn new(len: usize, loader: LoaderArgs) -> Self {
        Self { len, loader }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits the samples into a training and a testing loader.
    ///
    /// The last `floor(len * test_ratio)` samples are held out for testing. A side without any
    /// samples yields no loader.
    pub fn split(&self, test_ratio: f64) -> (Option<DataLoader>, Option<DataLoader>) {
        let ratio = test_ratio.max(0.0).min(1.0);
        let n_test = (self.len as f64 * ratio).floor() as usize;
        let n_train = self.len - n_test;
        let batch_size = self.loader.batch_size.max(1);
        let loader = |indices: Vec<usize>| {
            if indices.is_empty() {
                None
            } else {
                Some(DataLoader {
                    indices,
                    batch_size,
                })
            }
        };
        (
            loader((0..n_train).collect()),
            loader((n_train..self.len).collect()),
        )
    }
}

/// Sample indices grouped into batches.
#[derive(Clone, Debug, PartialEq)]
pub struct DataLoader {
    indices: Vec<usize>,
    batch_size: usize,
}

impl DataLoader {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn batches(&self) -> std::slice::Chunks<'_, usize> {
        self.indices.chunks(self.batch_size)
    }

    pub fn n_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }
}
