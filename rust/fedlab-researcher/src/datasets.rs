use std::collections::{BTreeMap, BTreeSet};

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use fedlab_core::{message::TrainingData, DataType, DatasetDescriptor, NodeId};

/// Inconsistencies between the datasets of a federation.
#[derive(Debug, Display, Error, PartialEq)]
pub enum DataQualityError {
    /// Datasets of different types share the searched tags: {0:?}.
    MixedDataTypes(Vec<DataType>),
    /// The numbers of columns of the federated tables don't match: {0:?}.
    ColumnCounts(Vec<Vec<usize>>),
    /// The types of column {0} of the federated tables don't match: {1:?}.
    ColumnTypes(usize, Vec<String>),
}

/// The datasets of a federation which take part in an experiment, by node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FederatedDataset(BTreeMap<NodeId, Vec<DatasetDescriptor>>);

impl FederatedDataset {
    pub fn new(datasets: BTreeMap<NodeId, Vec<DatasetDescriptor>>) -> Self {
        Self(datasets)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.0.keys().cloned().collect()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.0.contains_key(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&[DatasetDescriptor]> {
        self.0.get(node_id).map(Vec::as_slice)
    }

    /// The identifiers of the datasets, as sent in training requests.
    pub fn data(&self) -> TrainingData {
        self.0
            .iter()
            .map(|(node_id, datasets)| {
                let ids = datasets
                    .iter()
                    .map(|dataset| dataset.dataset_id.clone())
                    .collect();
                (node_id.clone(), ids)
            })
            .collect()
    }

    /// Removes a node from the federation.
    pub fn remove(&mut self, node_id: &NodeId) -> Option<Vec<DatasetDescriptor>> {
        self.0.remove(node_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks that the datasets of the different nodes can be trained on by the same plan.
    ///
    /// Tables must agree on the number and types of their columns. Images which differ in their
    /// dimensions or color channels are only reported.
    ///
    /// # Errors
    /// Fails if the datasets are of different types or if tables don't match.
    pub fn check_quality(&self) -> Result<(), DataQualityError> {
        if self.0.len() < 2 {
            return Ok(());
        }
        info!("checking the quality of the federated datasets");
        let datasets: Vec<&DatasetDescriptor> = self.0.values().flatten().collect();
        let data_types: Vec<DataType> = datasets.iter().map(|dataset| dataset.data_type).collect();
        if data_types.iter().collect::<BTreeSet<_>>().len() > 1 {
            return Err(DataQualityError::MixedDataTypes(data_types));
        }
        let shapes = || -> Vec<Vec<usize>> {
            datasets.iter().map(|dataset| dataset.shape.clone()).collect()
        };

        match data_types.first() {
            Some(DataType::Csv) => {
                if !all_equal(datasets.iter().map(|dataset| dataset.shape.get(1))) {
                    return Err(DataQualityError::ColumnCounts(shapes()));
                }
                let columns = datasets
                    .iter()
                    .map(|dataset| dataset.dtypes.len())
                    .min()
                    .unwrap_or_default();
                for column in 0..columns {
                    let dtypes: Vec<String> = datasets
                        .iter()
                        .map(|dataset| dataset.dtypes[column].clone())
                        .collect();
                    if !all_equal(dtypes.iter()) {
                        return Err(DataQualityError::ColumnTypes(column, dtypes));
                    }
                }
            }
            Some(DataType::Images) => {
                let all_shapes = shapes();
                if !all_equal(datasets.iter().map(|dataset| dataset.shape.get(2..))) {
                    error!(
                        "the dimensions of the federated images don't match: {:?}",
                        all_shapes
                    );
                }
                if !all_equal(datasets.iter().map(|dataset| dataset.shape.get(1))) {
                    error!(
                        "the color channels of the federated images don't match: {:?}",
                        all_shapes
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn all_equal<T: PartialEq>(mut values: impl Iterator<Item = T>) -> bool {
    match values.next() {
        Some(first) => values.all(|value| value == first),
        None => true,
    }
}

impl From<BTreeMap<NodeId, Vec<DatasetDescriptor>>> for FederatedDataset {
    fn from(datasets: BTreeMap<NodeId, Vec<DatasetDescriptor>>) -> Self {
        Self(datasets)
    }
}
