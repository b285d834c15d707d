//! Model-side data types for slimfed
//!
//! This crate defines what the aggregation engine consumes and produces:
//! tensors ([`TensorData`], [`TensorShape`]), insertion-ordered named
//! parameter mappings with per-parameter aggregation tags
//! ([`NamedParameters`], [`ParamKind`]), and the [`SlimmableModel`]
//! collaborator contract with a reference implementation
//! ([`SlimmableStack`]).

pub mod model;
pub mod params;
pub mod tensor;

pub use model::{sliced_width, LayerSpec, ModelError, SlimmableModel, SlimmableStack};
pub use params::{NamedParameters, Param, ParamKind};
pub use tensor::{TensorData, TensorShape};
