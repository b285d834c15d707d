//! Named parameter mappings
//!
//! A model exposes its state as an insertion-ordered mapping from parameter
//! name to tensor, the way a state dict does. Every parameter carries an
//! explicit [`ParamKind`] tag so the aggregation engine never has to guess
//! from the name whether a value is weight-averaged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::tensor::TensorData;

/// How a parameter participates in aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Weight-averaged across contributions (default for trainable tensors).
    #[default]
    Averaged,
    /// Identical across clients; last written value wins (step counters and
    /// other non-trainable statistics).
    Replicated,
}

/// A named parameter value with its aggregation tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Aggregation behavior
    pub kind: ParamKind,
    /// Tensor value
    pub data: TensorData,
}

impl Param {
    /// Creates a weight-averaged parameter
    pub fn averaged(data: TensorData) -> Self {
        Self {
            kind: ParamKind::Averaged,
            data,
        }
    }

    /// Creates a replicated (copy-replace) parameter
    pub fn replicated(data: TensorData) -> Self {
        Self {
            kind: ParamKind::Replicated,
            data,
        }
    }
}

/// Insertion-ordered mapping from parameter name to [`Param`].
///
/// Iteration order is the order of first insertion, which is stable for a
/// given model architecture across its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedParameters {
    order: Vec<String>,
    map: HashMap<String, Param>,
}

impl NamedParameters {
    /// Creates an empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a parameter, replacing any existing value under the same name.
    /// A replaced parameter keeps its original position in iteration order.
    pub fn insert(&mut self, name: impl Into<String>, param: Param) {
        let name = name.into();
        if !self.map.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.map.insert(name, param);
    }

    /// Looks up a parameter by name
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.map.get(name)
    }

    /// Looks up a parameter mutably by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.map.get_mut(name)
    }

    /// Returns true if a parameter with this name exists
    pub fn contains_key(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates parameters in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.order.iter().filter_map(|name| {
            self.map
                .get(name)
                .map(|param| (name.as_str(), param))
        })
    }

    /// Parameter names in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Returns the shape dims of a parameter, if present
    pub fn shape_of(&self, name: &str) -> Option<&[i64]> {
        self.map.get(name).map(|p| p.data.shape().dims())
    }

    /// Returns a copy with only the named keys retained, preserving order
    pub fn filtered(&self, names: &[String]) -> NamedParameters {
        let mut out = NamedParameters::new();
        for (name, param) in self.iter() {
            if names.iter().any(|n| n == name) {
                out.insert(name, param.clone());
            }
        }
        out
    }
}

impl FromIterator<(String, Param)> for NamedParameters {
    fn from_iter<T: IntoIterator<Item = (String, Param)>>(iter: T) -> Self {
        let mut params = NamedParameters::new();
        for (name, param) in iter {
            params.insert(name, param);
        }
        params
    }
}
