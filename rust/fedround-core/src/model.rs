//! Numeric parameters exchanged between the controller and the nodes.
//!
//! [`Parameters`] are a collection of named layers, each layer being a flat
//! vector of `f64` values. Layers are kept in a `BTreeMap`, hence every
//! iteration over them visits the layers in ascending name order. The flat
//! representation used by the masking primitives concatenates the layers in
//! that order.

use std::{
    collections::{btree_map, BTreeMap},
    iter::FromIterator,
};

use derive_more::{From, Into};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to incompatible parameter layouts.
pub enum ShapeError {
    #[error("layer {0} is missing")]
    MissingLayer(String),

    #[error("layer {0} is unexpected")]
    UnexpectedLayer(String),

    #[error("layer {name} has length {actual}, expected {expected}")]
    LayerLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("flat vector has length {actual}, expected {expected}")]
    FlatLength { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Default, PartialEq, From, Into, Serialize, Deserialize)]
#[serde(transparent)]
/// Named layers of numeric parameters.
pub struct Parameters(BTreeMap<String, Vec<f64>>);

impl FromIterator<(String, Vec<f64>)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (String, Vec<f64>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Parameters {
    type Item = (&'a String, &'a Vec<f64>);
    type IntoIter = btree_map::Iter<'a, String, Vec<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[allow(clippy::len_without_is_empty)]
impl Parameters {
    /// Creates parameters from `(name, values)` pairs.
    pub fn from_layers<N: Into<String>>(layers: impl IntoIterator<Item = (N, Vec<f64>)>) -> Self {
        layers
            .into_iter()
            .map(|(name, values)| (name.into(), values))
            .collect()
    }

    /// Gets the values of a layer.
    pub fn layer(&self, name: &str) -> Option<&[f64]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Gets the total number of values over all layers.
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Checks whether there are no layers at all.
    pub fn has_no_layers(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the layers in ascending name order.
    pub fn layers(&self) -> btree_map::Iter<'_, String, Vec<f64>> {
        self.0.iter()
    }

    /// Checks that `other` has exactly the same layers with the same lengths.
    pub fn check_shape(&self, other: &Parameters) -> Result<(), ShapeError> {
        for (name, values) in &self.0 {
            match other.0.get(name) {
                None => return Err(ShapeError::MissingLayer(name.clone())),
                Some(others) if others.len() != values.len() => {
                    return Err(ShapeError::LayerLength {
                        name: name.clone(),
                        expected: values.len(),
                        actual: others.len(),
                    })
                }
                Some(_) => {}
            }
        }
        if let Some(name) = other.0.keys().find(|name| !self.0.contains_key(*name)) {
            return Err(ShapeError::UnexpectedLayer(name.clone()));
        }
        Ok(())
    }

    /// Creates parameters with the layout of `self` and every value set to zero.
    pub fn zeros_like(&self) -> Self {
        self.map(|_| 0.0)
    }

    /// Applies `f` to every value.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        self.0
            .iter()
            .map(|(name, values)| (name.clone(), values.iter().copied().map(&f).collect()))
            .collect()
    }

    /// Combines `self` with `other` value by value.
    ///
    /// # Errors
    /// Fails if the layouts differ.
    pub fn zip_with(
        &self,
        other: &Parameters,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Self, ShapeError> {
        self.check_shape(other)?;
        Ok(self
            .0
            .iter()
            .map(|(name, values)| {
                // the shape check guarantees the layer exists
                let others = other.0.get(name).map(Vec::as_slice).unwrap_or(&[]);
                let combined = values
                    .iter()
                    .zip(others)
                    .map(|(a, b)| f(*a, *b))
                    .collect();
                (name.clone(), combined)
            })
            .collect())
    }

    /// Adds `weight * other` to `self` in place.
    ///
    /// # Errors
    /// Fails if the layouts differ, in which case `self` is left unchanged.
    pub fn add_scaled(&mut self, weight: f64, other: &Parameters) -> Result<(), ShapeError> {
        self.check_shape(other)?;
        for (name, values) in self.0.iter_mut() {
            if let Some(others) = other.0.get(name) {
                for (value, x) in values.iter_mut().zip(others) {
                    *value += weight * x;
                }
            }
        }
        Ok(())
    }

    /// Checks that every value is finite.
    pub fn is_finite(&self) -> bool {
        self.0.values().flatten().all(|x| x.is_finite())
    }

    /// Concatenates the layers in ascending name order.
    pub fn flatten(&self) -> Vec<f64> {
        self.0.values().flatten().copied().collect()
    }

    /// Rebuilds parameters with the layout of `self` from a flat vector.
    ///
    /// # Errors
    /// Fails if the flat vector has not exactly [`len()`] values.
    ///
    /// [`len()`]: Parameters::len
    pub fn unflatten(&self, flat: &[f64]) -> Result<Self, ShapeError> {
        if flat.len() != self.len() {
            return Err(ShapeError::FlatLength {
                expected: self.len(),
                actual: flat.len(),
            });
        }
        let mut offset = 0;
        Ok(self
            .0
            .iter()
            .map(|(name, values)| {
                let layer = flat[offset..offset + values.len()].to_vec();
                offset += values.len();
                (name.clone(), layer)
            })
            .collect())
    }
}
