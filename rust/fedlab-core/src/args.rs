//! Training arguments.
//!
//! The researcher sends one combined bag of training arguments. Nodes validate it into
//! [`TrainingArgs`] and split it into the subsets consumed by the different parts of a training
//! plan: [`LoaderArgs`], [`TrainingArguments`] and [`TestingArgs`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::ArgBag;

#[derive(Debug, Error)]
/// An error related to the validation of training arguments.
pub enum TrainingArgsError {
    #[error("invalid training arguments: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid training arguments: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// The validated training arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_testing"))]
pub struct TrainingArgs {
    /// The learning rate of the local optimizer.
    #[serde(default = "default_lr")]
    #[validate(range(min = 0.0))]
    pub lr: f64,
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: u32,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    /// Stop after the first batch.
    #[serde(default)]
    pub dry_run: bool,
    /// The maximal number of batches per epoch. `0` means no limit.
    #[serde(default = "default_batch_maxnum")]
    pub batch_maxnum: u32,
    /// The share of the dataset held out for validation.
    #[serde(default)]
    pub test_ratio: f64,
    /// Validate the locally updated parameters after training.
    #[serde(default)]
    pub test_on_local_updates: bool,
    /// Validate the received global parameters before training.
    #[serde(default)]
    pub test_on_global_updates: bool,
    #[serde(default)]
    pub test_metric: Option<MetricKind>,
    #[serde(default)]
    pub test_metric_args: ArgBag,
}

/// The metrics a testing routine can report.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    #[serde(alias = "accuracy")]
    Accuracy,
    #[serde(alias = "f1_score")]
    F1Score,
    #[serde(alias = "precision")]
    Precision,
    #[serde(alias = "avg_precision")]
    AvgPrecision,
    #[serde(alias = "recall")]
    Recall,
    #[serde(alias = "roc_auc")]
    RocAuc,
    #[serde(alias = "mean_square_error")]
    MeanSquareError,
    #[serde(alias = "mean_absolute_error")]
    MeanAbsoluteError,
    #[serde(alias = "explained_variance")]
    ExplainedVariance,
}

fn default_lr() -> f64 {
    0.01
}

fn default_batch_size() -> u32 {
    48
}

fn default_epochs() -> u32 {
    1
}

fn default_batch_maxnum() -> u32 {
    100
}

fn validate_testing(args: &TrainingArgs) -> Result<(), ValidationError> {
    // the range validator doesn't reject NaN
    if !(0.0..=1.0).contains(&args.test_ratio) {
        return Err(ValidationError::new("test_ratio must be within [0, 1]"));
    }
    if args.epochs.checked_mul(args.batch_maxnum).is_none() {
        return Err(ValidationError::new("epochs times batch_maxnum must fit into 32 bits"));
    }
    Ok(())
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            dry_run: false,
            batch_maxnum: default_batch_maxnum(),
            test_ratio: 0.0,
            test_on_local_updates: false,
            test_on_global_updates: false,
            test_metric: None,
            test_metric_args: ArgBag::new(),
        }
    }
}

/// The arguments of the data loaders.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoaderArgs {
    pub batch_size: usize,
}

/// The arguments of the training routine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingArguments {
    pub lr: f64,
    pub epochs: u32,
    pub dry_run: bool,
    pub batch_maxnum: u32,
}

impl TrainingArguments {
    /// The number of optimizer steps a plan performs with these arguments, provided each epoch
    /// holds at least `batch_maxnum` batches.
    pub fn expected_updates(&self) -> u32 {
        if self.dry_run {
            1
        } else if self.batch_maxnum > 0 {
            self.epochs.saturating_mul(self.batch_maxnum)
        } else {
            self.epochs
        }
    }
}

/// The arguments of the testing routine.
#[derive(Clone, Debug, PartialEq)]
pub struct TestingArgs {
    pub test_ratio: f64,
    pub test_on_local_updates: bool,
    pub test_on_global_updates: bool,
    pub test_metric: Option<MetricKind>,
    pub test_metric_args: ArgBag,
}

impl TestingArgs {
    /// Checks whether any validation was requested.
    pub fn requested(&self) -> bool {
        self.test_on_local_updates || self.test_on_global_updates
    }
}

impl TrainingArgs {
    /// Validates a bag of training arguments, filling in defaults.
    ///
    /// # Errors
    /// Fails on unknown keys, values of the wrong type and values out of range.
    pub fn from_bag(bag: &ArgBag) -> Result<Self, TrainingArgsError> {
        let args: TrainingArgs = serde_json::from_value(Value::Object(bag.clone()))?;
        args.validate()?;
        Ok(args)
    }

    /// Converts the arguments back into a bag.
    pub fn to_bag(&self) -> ArgBag {
        match serde_json::to_value(self) {
            Ok(Value::Object(bag)) => bag,
            _ => ArgBag::new(),
        }
    }

    pub fn loader_arguments(&self) -> LoaderArgs {
        LoaderArgs {
            batch_size: self.batch_size as usize,
        }
    }

    pub fn training_arguments(&self) -> TrainingArguments {
        TrainingArguments {
            lr: self.lr,
            epochs: self.epochs,
            dry_run: self.dry_run,
            batch_maxnum: self.batch_maxnum,
        }
    }

    pub fn testing_arguments(&self) -> TestingArgs {
        TestingArgs {
            test_ratio: self.test_ratio,
            test_on_local_updates: self.test_on_local_updates,
            test_on_global_updates: self.test_on_global_updates,
            test_metric: self.test_metric.clone(),
            test_metric_args: self.test_metric_args.clone(),
        }
    }
}
