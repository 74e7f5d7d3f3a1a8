//! Parameter sets.
//!
//! A [`Params`] maps layer names to [`Tensor`]s. Every arithmetic operation between two parameter
//! sets requires both sides to have the same layers with the same shapes.

use std::{
    collections::{btree_map, BTreeMap},
    fs,
    iter::FromIterator,
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
/// Errors related to parameter sets.
pub enum ModelError {
    #[error("shape {shape:?} does not fit {len} values")]
    InvalidShape { shape: Vec<usize>, len: usize },
    #[error("shape mismatch in layer {layer}: {left:?} vs {right:?}")]
    ShapeMismatch {
        layer: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    #[error("layer {0} is missing")]
    MissingLayer(String),
    #[error("parameter sets have different layers")]
    LayerMismatch,
    #[error("failed to (de)serialize parameters: {0}")]
    Codec(#[from] bincode::Error),
    #[error("failed to access parameter file: {0}")]
    Io(#[from] std::io::Error),
}

/// A dense numeric array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Creates a tensor of the given shape.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ModelError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(ModelError::InvalidShape {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a one dimensional tensor.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Creates a tensor holding a single value.
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Creates a tensor of zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Creates a tensor of zeros shaped like this one.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Multiplies every value by `factor`.
    pub fn scale(&self, factor: f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|value| value * factor).collect(),
        }
    }

    /// Adds `other` to this tensor, value by value.
    ///
    /// # Errors
    /// Fails if the shapes differ.
    pub fn add_assign(&mut self, other: &Tensor, layer: &str) -> Result<(), ModelError> {
        self.check_shape(other, layer)?;
        for (value, other) in self.data.iter_mut().zip(other.data.iter()) {
            *value += other;
        }
        Ok(())
    }

    /// Subtracts `other` from this tensor, value by value.
    ///
    /// # Errors
    /// Fails if the shapes differ.
    pub fn sub_assign(&mut self, other: &Tensor, layer: &str) -> Result<(), ModelError> {
        self.check_shape(other, layer)?;
        for (value, other) in self.data.iter_mut().zip(other.data.iter()) {
            *value -= other;
        }
        Ok(())
    }

    fn check_shape(&self, other: &Tensor, layer: &str) -> Result<(), ModelError> {
        if self.shape == other.shape {
            Ok(())
        } else {
            Err(ModelError::ShapeMismatch {
                layer: layer.to_string(),
                left: self.shape.clone(),
                right: other.shape.clone(),
            })
        }
    }
}

/// A set of named tensors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Tensor>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(layer.into(), tensor)
    }

    pub fn get(&self, layer: &str) -> Option<&Tensor> {
        self.0.get(layer)
    }

    pub fn get_mut(&mut self, layer: &str) -> Option<&mut Tensor> {
        self.0.get_mut(layer)
    }

    /// Gets a layer.
    ///
    /// # Errors
    /// Fails if the layer is missing.
    pub fn layer(&self, layer: &str) -> Result<&Tensor, ModelError> {
        self.0
            .get(layer)
            .ok_or_else(|| ModelError::MissingLayer(layer.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.0.iter()
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Creates a parameter set with the same layers and shapes, filled with zeros.
    pub fn zeros_like(&self) -> Self {
        self.0
            .iter()
            .map(|(layer, tensor)| (layer.clone(), tensor.zeros_like()))
            .collect()
    }

    /// Multiplies every value of every layer by `factor`.
    pub fn scale(&self, factor: f64) -> Self {
        self.0
            .iter()
            .map(|(layer, tensor)| (layer.clone(), tensor.scale(factor)))
            .collect()
    }

    /// Adds `other` layer by layer.
    ///
    /// # Errors
    /// Fails if the layers or their shapes differ.
    pub fn add_assign(&mut self, other: &Params) -> Result<(), ModelError> {
        self.check_layers(other)?;
        for (layer, tensor) in self.0.iter_mut() {
            tensor.add_assign(other.layer(layer)?, layer)?;
        }
        Ok(())
    }

    /// Subtracts `other` layer by layer.
    ///
    /// # Errors
    /// Fails if the layers or their shapes differ.
    pub fn sub_assign(&mut self, other: &Params) -> Result<(), ModelError> {
        self.check_layers(other)?;
        for (layer, tensor) in self.0.iter_mut() {
            tensor.sub_assign(other.layer(layer)?, layer)?;
        }
        Ok(())
    }

    /// Returns `self + other`.
    pub fn add(&self, other: &Params) -> Result<Params, ModelError> {
        let mut sum = self.clone();
        sum.add_assign(other)?;
        Ok(sum)
    }

    /// Returns `self - other`.
    pub fn sub(&self, other: &Params) -> Result<Params, ModelError> {
        let mut difference = self.clone();
        difference.sub_assign(other)?;
        Ok(difference)
    }

    fn check_layers(&self, other: &Params) -> Result<(), ModelError> {
        if self.0.len() == other.0.len() && self.0.keys().all(|layer| other.0.contains_key(layer))
        {
            Ok(())
        } else {
            Err(ModelError::LayerMismatch)
        }
    }

    /// Serializes the parameters.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes parameters.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Writes the parameters to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Reads parameters from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        Self::from_bytes(&fs::read(path)?)
    }
}

impl FromIterator<(String, Tensor)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<BTreeMap<String, Tensor>> for Params {
    fn from(layers: BTreeMap<String, Tensor>) -> Self {
        Self(layers)
    }
}
