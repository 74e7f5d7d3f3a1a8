//! Loading and validation of the researcher settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in `configs/researcher.toml` at the repository root.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use derive_more::Display;
use serde::Deserialize;
use validator::{Validate, ValidationError};

use fedlab_core::{
    settings::{self, LoggingSettings, SettingsError},
    ArgBag,
    PlanKind,
};

#[derive(Debug, Deserialize, Validate)]
/// The combined researcher settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct ResearcherSettings {
    #[validate]
    pub researcher: ResearcherIdentitySettings,
    #[validate]
    pub requests: RequestSettings,
    #[validate]
    pub experiment: ExperimentSettings,
    #[validate]
    pub aggregator: AggregatorSettings,
    pub exchange: ExchangeSettings,
    pub log: LoggingSettings,
}

impl ResearcherSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        settings::load(path)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResearcherIdentitySettings {
    /// The identifier of the researcher. Nodes address their replies to it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [researcher]
    /// id = "researcher-1"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLAB_RESEARCHER__ID=researcher-1
    /// ```
    #[validate(length(min = 1))]
    pub id: String,
}

#[derive(Debug, Deserialize, Validate)]
/// The request settings.
pub struct RequestSettings {
    /// The length of a collection window in milliseconds.
    ///
    /// The collection of replies ends once a whole window passes without a new reply.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [requests]
    /// timeout_ms = 5000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLAB_REQUESTS__TIMEOUT_MS=5000
    /// ```
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

impl RequestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Validate)]
/// The experiment settings.
pub struct ExperimentSettings {
    /// The number of training rounds.
    #[validate(range(min = 1))]
    pub rounds: u32,
    /// Only the datasets carrying all of these tags take part in the experiment.
    #[serde(default)]
    pub tags: Vec<String>,
    /// The source of the training plan shipped to the nodes.
    pub plan_path: PathBuf,
    /// The class of the training plan, resolved by the plan loader of each node.
    #[validate(length(min = 1))]
    pub plan_class: String,
    #[serde(default = "default_plan_kind")]
    pub plan_kind: PlanKind,
    /// The initial global parameters.
    pub params_path: PathBuf,
    #[serde(default)]
    pub model_args: ArgBag,
    /// The training arguments. They are validated when the experiment is created.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment.training_args]
    /// lr = 0.01
    /// batch_size = 16
    /// epochs = 2
    /// ```
    #[serde(default)]
    pub training_args: ArgBag,
    /// Where aggregated parameters and breakpoints are written.
    pub experiment_dir: PathBuf,
    /// Whether to write a breakpoint after every round.
    #[serde(default)]
    pub save_breakpoints: bool,
}

impl ExperimentSettings {
    pub fn breakpoint_dir(&self) -> PathBuf {
        self.experiment_dir.join("breakpoints")
    }
}

fn default_plan_kind() -> PlanKind {
    PlanKind::Gradient
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorKind {
    #[display(fmt = "fedavg")]
    FedAvg,
    #[display(fmt = "scaffold")]
    Scaffold,
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_aggregator"))]
/// The aggregator settings.
pub struct AggregatorSettings {
    /// The aggregation strategy.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator]
    /// kind = "scaffold"
    /// server_lr = 1.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLAB_AGGREGATOR__KIND=fedavg
    /// ```
    pub kind: AggregatorKind,
    /// The server learning rate of the `scaffold` aggregator. Must not be `0`.
    #[serde(default = "default_server_lr")]
    pub server_lr: f64,
    /// Whether aggregator arguments holding parameters are uploaded and sent by handle instead of
    /// inline.
    #[serde(default)]
    pub upload_args: bool,
}

fn default_server_lr() -> f64 {
    1.0
}

fn validate_aggregator(s: &AggregatorSettings) -> Result<(), ValidationError> {
    if s.kind == AggregatorKind::Scaffold && (s.server_lr == 0.0 || !s.server_lr.is_finite()) {
        return Err(ValidationError::new("invalid server learning rate"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
/// The artifact exchange settings.
pub struct ExchangeSettings {
    /// The directory shared with the nodes.
    pub store: PathBuf,
    /// Where the results of the nodes are downloaded to.
    pub download_dir: PathBuf,
}
