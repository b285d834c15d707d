//! Slimmable model collaborator
//!
//! The aggregation engine never touches model internals; it talks to models
//! through the [`SlimmableModel`] trait: read a named-parameter view, write a
//! named-parameter view, and reconfigure which slice of the full-width
//! parameters that view addresses.
//!
//! [`SlimmableStack`] is the reference implementation: a stack of linear or
//! convolution-shaped layers whose full-width parameters live in one place,
//! with a width/shift descriptor selecting the active sub-network. The first
//! layer of a network typically keeps its full input dimension (the data
//! shape is fixed) and the last keeps its full output dimension (the label
//! count is fixed); `fix_in`/`fix_out` express that.

use thiserror::Error;
use tracing::debug;

use crate::params::{NamedParameters, Param, ParamKind};
use crate::tensor::{TensorData, TensorShape};

/// Errors from model parameter operations
#[derive(Debug, Error)]
pub enum ModelError {
    /// A supplied tensor does not match the model's view shape
    #[error("Shape mismatch for parameter {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name
        name: String,
        /// Shape the model's current view expects
        expected: Vec<i64>,
        /// Shape actually supplied
        actual: Vec<i64>,
    },

    /// A supplied tensor has the wrong dtype
    #[error("Data type mismatch for parameter {name}: expected {expected}, got {actual}")]
    DataTypeMismatch {
        /// Parameter name
        name: String,
        /// Expected dtype
        expected: &'static str,
        /// Supplied dtype
        actual: &'static str,
    },

    /// A supplied parameter name is not part of the model
    #[error("Unknown parameter {name}")]
    UnknownParameter {
        /// Parameter name
        name: String,
    },

    /// A model parameter is missing from a strict load
    #[error("Missing parameter {name} in strict load")]
    MissingParameter {
        /// Parameter name
        name: String,
    },

    /// Requested width ratio outside (0, 1]
    #[error("Invalid width ratio {ratio}")]
    InvalidRatio {
        /// The offending ratio
        ratio: f64,
    },

    /// Requested shift places the slice outside the full width
    #[error("Shift index {shift} out of range (maximum {limit})")]
    InvalidShift {
        /// The offending shift index
        shift: usize,
        /// Largest shift that still fits
        limit: usize,
    },
}

/// Contract between the aggregation engine and a model implementation.
pub trait SlimmableModel {
    /// Returns the parameters of the currently selected sub-network.
    fn named_parameters(&self) -> NamedParameters;

    /// Writes parameters into the currently selected sub-network.
    ///
    /// With `strict` set, every model parameter must be present in `params`
    /// with a matching shape and dtype; otherwise unknown names and
    /// mismatched tensors are skipped.
    fn set_named_parameters(
        &mut self,
        params: &NamedParameters,
        strict: bool,
    ) -> Result<(), ModelError>;

    /// Reconfigures which slice of the full-width parameters the model's
    /// forward pass reads and writes.
    ///
    /// `output_shift_index`, when set, shifts output dimensions independently
    /// of input dimensions.
    fn switch_width(
        &mut self,
        ratio: f64,
        shift_index: usize,
        output_shift_index: Option<usize>,
    ) -> Result<(), ModelError>;
}

/// Description of one layer in a [`SlimmableStack`].
#[derive(Debug, Clone)]
pub struct LayerSpec {
    /// Layer name, used as the parameter name prefix
    pub name: String,
    /// Full input width
    pub in_features: usize,
    /// Full output width
    pub out_features: usize,
    /// Kernel size for convolution-shaped weights (`[out, in, kh, kw]`);
    /// `None` gives a linear-shaped weight (`[out, in]`)
    pub kernel: Option<(usize, usize)>,
    /// Keep the input dimension at full width (first layer)
    pub fix_in: bool,
    /// Keep the output dimension at full width (last layer)
    pub fix_out: bool,
}

impl LayerSpec {
    /// A linear layer `[out_features, in_features]`
    pub fn linear(name: impl Into<String>, in_features: usize, out_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
            kernel: None,
            fix_in: false,
            fix_out: false,
        }
    }

    /// A convolution layer `[out_features, in_features, kh, kw]`
    pub fn conv(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        kernel: (usize, usize),
    ) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
            kernel: Some(kernel),
            fix_in: false,
            fix_out: false,
        }
    }

    /// Keeps the input dimension at full width
    pub fn with_fixed_input(mut self) -> Self {
        self.fix_in = true;
        self
    }

    /// Keeps the output dimension at full width
    pub fn with_fixed_output(mut self) -> Self {
        self.fix_out = true;
        self
    }

    fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }

    fn bias_name(&self) -> String {
        format!("{}.bias", self.name)
    }
}

/// Offset/length pair addressing one sliced dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DimSlice {
    off: usize,
    len: usize,
}

/// Reference slimmable model: full-width parameter storage plus a view
/// descriptor selecting the active sub-network.
#[derive(Debug, Clone)]
pub struct SlimmableStack {
    layers: Vec<LayerSpec>,
    params: NamedParameters,
    ratio: f64,
    shift: usize,
    out_shift: Option<usize>,
}

/// Width of a slimmed dimension.
pub fn sliced_width(full: usize, ratio: f64) -> usize {
    (full as f64 * ratio).round() as usize
}

impl SlimmableStack {
    /// Creates a stack with zero-initialized parameters at full width.
    ///
    /// Each layer contributes `<name>.weight` and `<name>.bias`; the stack
    /// carries one replicated `steps` counter, the kind of non-trainable
    /// bookkeeping value that is identical across clients.
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        let mut params = NamedParameters::new();
        for layer in &layers {
            let weight_shape = match layer.kernel {
                Some((kh, kw)) => TensorShape::d4(
                    layer.out_features as i64,
                    layer.in_features as i64,
                    kh as i64,
                    kw as i64,
                ),
                None => TensorShape::d2(layer.out_features as i64, layer.in_features as i64),
            };
            params.insert(
                layer.weight_name(),
                Param::averaged(TensorData::zeros_f32(weight_shape)),
            );
            params.insert(
                layer.bias_name(),
                Param::averaged(TensorData::zeros_f32(TensorShape::d1(
                    layer.out_features as i64,
                ))),
            );
        }
        params.insert(
            "steps",
            Param::replicated(TensorData::int64(vec![0], TensorShape::scalar())),
        );

        Self {
            layers,
            params,
            ratio: 1.0,
            shift: 0,
            out_shift: None,
        }
    }

    /// Current view ratio
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Current shift index
    pub fn shift(&self) -> usize {
        self.shift
    }

    /// Increments the replicated step counter, as local training would.
    pub fn increment_steps(&mut self, by: i64) {
        if let Some(param) = self.params.get_mut("steps") {
            if let TensorData::Int64 { data, .. } = &mut param.data {
                for v in data.iter_mut() {
                    *v += by;
                }
            }
        }
    }

    fn dim_slice(
        &self,
        full: usize,
        fixed: bool,
        shift: usize,
    ) -> Result<DimSlice, ModelError> {
        if fixed {
            return Ok(DimSlice { off: 0, len: full });
        }
        let len = sliced_width(full, self.ratio);
        let off = shift * len;
        if off + len > full {
            return Err(ModelError::InvalidShift {
                shift,
                limit: full / len.max(1) - 1,
            });
        }
        Ok(DimSlice { off, len })
    }

    /// Computes the (out, in) slices for one layer under the current view.
    fn layer_view(&self, layer: &LayerSpec) -> Result<(DimSlice, DimSlice), ModelError> {
        let out_shift = self.out_shift.unwrap_or(self.shift);
        let out = self.dim_slice(layer.out_features, layer.fix_out, out_shift)?;
        let input = self.dim_slice(layer.in_features, layer.fix_in, self.shift)?;
        Ok((out, input))
    }

    /// Validates that the current view fits every layer.
    fn validate_view(&self) -> Result<(), ModelError> {
        for layer in &self.layers {
            self.layer_view(layer)?;
        }
        Ok(())
    }
}

/// Copies the `[out, in]`-sliced region out of a full tensor. Trailing
/// dimensions (convolution kernels) are never sliced and copy contiguously.
fn read_region(full: &[f32], full_dims: &[usize], out: DimSlice, input: Option<DimSlice>) -> Vec<f32> {
    match input {
        None => full[out.off..out.off + out.len].to_vec(),
        Some(input) => {
            let in_full = full_dims[1];
            let tail: usize = full_dims[2..].iter().product();
            let mut view = Vec::with_capacity(out.len * input.len * tail);
            for x in 0..out.len {
                for y in 0..input.len {
                    let base = ((out.off + x) * in_full + input.off + y) * tail;
                    view.extend_from_slice(&full[base..base + tail]);
                }
            }
            view
        }
    }
}

/// Writes a sliced view back into its region of a full tensor.
fn write_region(
    full: &mut [f32],
    full_dims: &[usize],
    out: DimSlice,
    input: Option<DimSlice>,
    view: &[f32],
) {
    match input {
        None => full[out.off..out.off + out.len].copy_from_slice(view),
        Some(input) => {
            let in_full = full_dims[1];
            let tail: usize = full_dims[2..].iter().product();
            let mut src = 0;
            for x in 0..out.len {
                for y in 0..input.len {
                    let base = ((out.off + x) * in_full + input.off + y) * tail;
                    full[base..base + tail].copy_from_slice(&view[src..src + tail]);
                    src += tail;
                }
            }
        }
    }
}

impl SlimmableModel for SlimmableStack {
    fn named_parameters(&self) -> NamedParameters {
        let mut view = NamedParameters::new();
        for layer in &self.layers {
            // The view was validated when it was switched to.
            let Ok((out, input)) = self.layer_view(layer) else {
                continue;
            };

            let weight_name = layer.weight_name();
            if let Some(param) = self.params.get(&weight_name) {
                let full_dims = param.data.shape().dims_usize();
                if let Some(full) = param.data.as_f32_slice() {
                    let data = read_region(full, &full_dims, out, Some(input));
                    let mut dims = vec![out.len as i64, input.len as i64];
                    dims.extend(full_dims[2..].iter().map(|&d| d as i64));
                    view.insert(weight_name, Param::averaged(TensorData::float32(data, dims)));
                }
            }

            let bias_name = layer.bias_name();
            if let Some(param) = self.params.get(&bias_name) {
                if let Some(full) = param.data.as_f32_slice() {
                    let data = read_region(full, &[], out, None);
                    view.insert(
                        bias_name,
                        Param::averaged(TensorData::float32(data, vec![out.len as i64])),
                    );
                }
            }
        }
        if let Some(param) = self.params.get("steps") {
            view.insert("steps", param.clone());
        }
        view
    }

    fn set_named_parameters(
        &mut self,
        params: &NamedParameters,
        strict: bool,
    ) -> Result<(), ModelError> {
        let view = self.named_parameters();

        if strict {
            for name in view.keys() {
                if !params.contains_key(name) {
                    return Err(ModelError::MissingParameter {
                        name: name.to_string(),
                    });
                }
            }
        }

        for (name, incoming) in params.iter() {
            let Some(expected) = view.get(name) else {
                if strict {
                    return Err(ModelError::UnknownParameter {
                        name: name.to_string(),
                    });
                }
                continue;
            };

            if incoming.data.dtype() != expected.data.dtype() {
                if strict {
                    return Err(ModelError::DataTypeMismatch {
                        name: name.to_string(),
                        expected: expected.data.dtype(),
                        actual: incoming.data.dtype(),
                    });
                }
                continue;
            }
            if incoming.data.shape() != expected.data.shape() {
                if strict {
                    return Err(ModelError::ShapeMismatch {
                        name: name.to_string(),
                        expected: expected.data.shape().dims().to_vec(),
                        actual: incoming.data.shape().dims().to_vec(),
                    });
                }
                continue;
            }

            if expected.kind == ParamKind::Replicated {
                if let Some(param) = self.params.get_mut(name) {
                    param.data = incoming.data.clone();
                }
                continue;
            }

            // Averaged tensors write through the current view.
            let layer = self
                .layers
                .iter()
                .find(|l| l.weight_name() == name || l.bias_name() == name)
                .cloned();
            let Some(layer) = layer else {
                continue;
            };
            let (out, input) = self.layer_view(&layer)?;
            let is_weight = layer.weight_name() == name;
            if let Some(param) = self.params.get_mut(name) {
                let full_dims = param.data.shape().dims_usize();
                if let (Some(full), Some(src)) =
                    (param.data.as_f32_slice_mut(), incoming.data.as_f32_slice())
                {
                    let input = if is_weight { Some(input) } else { None };
                    write_region(full, &full_dims, out, input, src);
                }
            }
        }
        Ok(())
    }

    fn switch_width(
        &mut self,
        ratio: f64,
        shift_index: usize,
        output_shift_index: Option<usize>,
    ) -> Result<(), ModelError> {
        if ratio <= 0.0 || ratio > 1.0 {
            return Err(ModelError::InvalidRatio { ratio });
        }
        let previous = (self.ratio, self.shift, self.out_shift);
        self.ratio = ratio;
        self.shift = shift_index;
        self.out_shift = output_shift_index;
        if let Err(e) = self.validate_view() {
            (self.ratio, self.shift, self.out_shift) = previous;
            return Err(e);
        }
        debug!(ratio, shift_index, ?output_shift_index, "switched width view");
        Ok(())
    }
}
