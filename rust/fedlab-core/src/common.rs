use std::path::PathBuf;

use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            AsRef,
            Clone,
            Debug,
            Display,
            Eq,
            From,
            Hash,
            Into,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Gets the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// The identifier of a node.
    NodeId
);
string_id!(
    /// The identifier of a researcher.
    ResearcherId
);
string_id!(
    /// The identifier of a job, i.e. of one federated experiment.
    JobId
);

impl JobId {
    /// Creates a fresh random job identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The kind of a training plan.
///
/// Aggregators may refuse to work with some kinds of plans.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// A plan trained with gradient steps over mini-batches.
    #[display(fmt = "gradient")]
    Gradient,
    /// A plan wrapping a closed-form or partial-fit estimator.
    #[display(fmt = "estimator")]
    Estimator,
}

/// The kind of data a dataset holds.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// A table, one sample per row.
    #[display(fmt = "csv")]
    Csv,
    /// A folder of images.
    #[display(fmt = "images")]
    Images,
    /// A well-known dataset shipped with the node.
    #[display(fmt = "default")]
    Default,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Default
    }
}

/// The description of a dataset held by a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// The identifier of the dataset, unique on the node.
    pub dataset_id: String,
    /// A human readable name.
    pub name: String,
    /// The tags the dataset can be searched by.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Where the dataset lives on the node.
    pub path: PathBuf,
    #[serde(default)]
    pub data_type: DataType,
    /// The shape of the dataset, as reported by the node.
    ///
    /// Tables are `[rows, columns]`, images `[samples, channels, dimensions..]`.
    #[serde(default)]
    pub shape: Vec<usize>,
    /// The types of the columns of a table.
    #[serde(default)]
    pub dtypes: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl DatasetDescriptor {
    /// Checks whether the dataset carries all the given tags.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Timing measurements of a training round, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// The wall clock time spent in the training routine.
    pub rtime_training: f64,
    /// The process CPU time spent in the training routine.
    pub ptime_training: f64,
    /// The wall clock time between dispatching the round and collecting the reply. Filled in by
    /// the researcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtime_total: Option<f64>,
}
