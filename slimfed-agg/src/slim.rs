//! Slimmable (sliced) accumulator
//!
//! Extends the streaming accumulator to contributions whose tensors are
//! sub-rectangles of the server tensors: each client trains only a slice of
//! every layer, selected by a shift index. Because different slices touch
//! different elements within one round, the contribution weight is tracked
//! per element, and finalize normalizes only the touched elements while
//! copying the previous server value everywhere else.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::AggError;
use crate::store::ParameterStore;
use slimfed_model::{NamedParameters, Param, ParamKind, SlimmableModel};

/// Elements with accumulated weight below this threshold are treated as
/// untrained this round and keep their previous server value.
const MASS_EPSILON: f32 = 1e-6;

/// Streaming accumulator for sliced contributions with per-element weight mass.
#[derive(Debug)]
pub struct SlimmableAccumulator {
    expected: usize,
    strict_finalize: bool,
    count: usize,
    sums: NamedParameters,
    weight_mass: HashMap<String, Vec<f32>>,
    replicated_written: HashSet<String>,
}

impl SlimmableAccumulator {
    /// Creates an accumulator over the given shared parameter set.
    pub fn new(shared: &NamedParameters, expected: usize) -> Self {
        let mut sums = NamedParameters::new();
        let mut weight_mass = HashMap::new();
        for (name, param) in shared.iter() {
            let mut zero = param.clone();
            zero.data = param.data.zeros_like();
            if param.kind == ParamKind::Averaged {
                weight_mass.insert(name.to_string(), vec![0.0f32; param.data.len()]);
            }
            sums.insert(name, zero);
        }
        Self {
            expected,
            strict_finalize: true,
            count: 0,
            sums,
            weight_mass,
            replicated_written: HashSet::new(),
        }
    }

    /// Controls whether finalizing before `expected` contributions is an error.
    pub fn with_strict_finalize(mut self, strict: bool) -> Self {
        self.strict_finalize = strict;
        self
    }

    /// Contributions folded so far this round.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Contributions expected per round.
    pub fn expected(&self) -> usize {
        self.expected
    }

    fn check_shifts(&self, shifts: &[usize], out_shift: Option<usize>) -> Result<(), AggError> {
        if self.count >= self.expected {
            return Err(AggError::OverAccumulation {
                count: self.count,
                expected: self.expected,
            });
        }
        if shifts.len() > 1 && out_shift.is_some() {
            return Err(AggError::InvalidShiftCombination {
                num_shifts: shifts.len(),
            });
        }
        let mut seen = HashSet::new();
        for &shift in shifts {
            if !seen.insert(shift) {
                return Err(AggError::OverlappingShifts {
                    shifts: shifts.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Accumulates one parameter into its placed region.
    fn place(
        &mut self,
        name: &str,
        incoming: &Param,
        weight: f32,
        shift: usize,
        out_shift: Option<usize>,
    ) -> Result<(), AggError> {
        let Some(sum) = self.sums.get_mut(name) else {
            return Ok(());
        };

        if sum.kind == ParamKind::Replicated {
            sum.data = incoming.data.clone();
            self.replicated_written.insert(name.to_string());
            return Ok(());
        }

        let server_dims = sum.data.shape().dims_usize();
        let contrib_dims = incoming.data.shape().dims_usize();
        let server_shape = sum.data.shape().dims().to_vec();
        let contrib_shape = incoming.data.shape().dims().to_vec();
        if contrib_dims.len() != server_dims.len() {
            return Err(AggError::ShapeMismatch {
                name: name.to_string(),
                expected: server_shape,
                actual: contrib_shape,
                shift,
            });
        }

        let (Some(acc), Some(src)) = (sum.data.as_f32_slice_mut(), incoming.data.as_f32_slice())
        else {
            return Err(AggError::UnsupportedDtype {
                name: name.to_string(),
                dtype: incoming.data.dtype(),
            });
        };
        let mass = self
            .weight_mass
            .get_mut(name)
            .ok_or_else(|| AggError::UnsupportedDtype {
                name: name.to_string(),
                dtype: incoming.data.dtype(),
            })?;

        match contrib_dims.len() {
            0 => Err(AggError::UnsupportedRank {
                name: name.to_string(),
                rank: 0,
            }),
            1 => {
                let x = contrib_dims[0];
                let x_off = if x < server_dims[0] { shift * x } else { 0 };
                if x_off + x > server_dims[0] {
                    return Err(AggError::ShapeMismatch {
                        name: name.to_string(),
                        expected: vec![server_dims[0] as i64],
                        actual: vec![x as i64],
                        shift,
                    });
                }
                for i in 0..x {
                    acc[x_off + i] += weight * src[i];
                    mass[x_off + i] += weight;
                }
                Ok(())
            }
            _ => {
                // Slicing applies to the first two dimensions independently;
                // trailing dimensions (convolution kernels) must match exactly.
                if contrib_dims[2..] != server_dims[2..] {
                    return Err(AggError::ShapeMismatch {
                        name: name.to_string(),
                        expected: server_shape,
                        actual: contrib_shape,
                        shift,
                    });
                }
                let (x, y) = (contrib_dims[0], contrib_dims[1]);
                let (sx, sy) = (server_dims[0], server_dims[1]);
                let x_off = if x < sx {
                    out_shift.unwrap_or(shift) * x
                } else {
                    0
                };
                let y_off = if y < sy { shift * y } else { 0 };
                if x_off + x > sx || y_off + y > sy {
                    return Err(AggError::ShapeMismatch {
                        name: name.to_string(),
                        expected: server_shape,
                        actual: contrib_shape,
                        shift,
                    });
                }
                let tail: usize = server_dims[2..].iter().product();
                for xi in 0..x {
                    for yi in 0..y {
                        let dst = ((x_off + xi) * sy + y_off + yi) * tail;
                        let s = (xi * y + yi) * tail;
                        for t in 0..tail {
                            acc[dst + t] += weight * src[s + t];
                            mass[dst + t] += weight;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Folds one contribution mapping at each of the given shift indices.
    ///
    /// Duplicate shift indices are rejected: equal-size atomic slices at
    /// distinct shifts are disjoint by construction, so a duplicate would
    /// double-count the same elements. Parameters missing from the
    /// contribution are skipped.
    pub fn add(
        &mut self,
        contribution: &NamedParameters,
        weight: f32,
        shifts: &[usize],
    ) -> Result<(), AggError> {
        self.check_shifts(shifts, None)?;

        let names: Vec<String> = self.sums.keys().map(String::from).collect();
        for &shift in shifts {
            for name in &names {
                if let Some(incoming) = contribution.get(name) {
                    self.place(name, incoming, weight, shift, None)?;
                }
            }
        }

        self.count += 1;
        debug!(count = self.count, expected = self.expected, ?shifts, "folded sliced contribution");
        Ok(())
    }

    /// Folds a trained model at each of the given shift indices, switching
    /// the model's width view per shift so every slice contributes its own
    /// trained values.
    ///
    /// This is the orchestrator's fold path; the whole multi-shift fold
    /// counts as a single contribution.
    pub fn add_model(
        &mut self,
        model: &mut dyn SlimmableModel,
        weight: f32,
        slice_ratio: f64,
        shifts: &[usize],
        out_shift: Option<usize>,
    ) -> Result<(), AggError> {
        self.check_shifts(shifts, out_shift)?;

        let names: Vec<String> = self.sums.keys().map(String::from).collect();
        for &shift in shifts {
            model.switch_width(slice_ratio, shift, out_shift)?;
            let view = model.named_parameters();
            for name in &names {
                if let Some(incoming) = view.get(name) {
                    self.place(name, incoming, weight, shift, out_shift)?;
                }
            }
        }

        self.count += 1;
        Ok(())
    }

    /// Normalizes touched elements by their weight mass, copies the previous
    /// server value for untouched elements, writes the result into the server
    /// store and resets all accumulation state.
    pub fn finalize(&mut self, store: &mut ParameterStore) -> Result<(), AggError> {
        if self.count != self.expected && (self.strict_finalize || self.count == 0) {
            return Err(AggError::IncompleteAccumulation {
                count: self.count,
                expected: self.expected,
            });
        }

        for (name, sum) in self.sums.iter() {
            let Some(server) = store.server_mut().get_mut(name) else {
                continue;
            };
            if sum.kind == ParamKind::Replicated {
                if self.replicated_written.contains(name) {
                    server.data = sum.data.clone();
                }
                continue;
            }
            let Some(mass) = self.weight_mass.get(name) else {
                continue;
            };
            if let (Some(dst), Some(acc)) = (server.data.as_f32_slice_mut(), sum.data.as_f32_slice())
            {
                for ((d, &a), &m) in dst.iter_mut().zip(acc.iter()).zip(mass.iter()) {
                    if m.abs() > MASS_EPSILON {
                        *d = a / m;
                    }
                    // else: untouched this round, keep the previous value
                }
            }
        }

        self.reset();
        Ok(())
    }

    /// Discards all partial state, abandoning the round.
    pub fn reset(&mut self) {
        self.count = 0;
        self.replicated_written.clear();
        let names: Vec<String> = self.sums.keys().map(String::from).collect();
        for name in names {
            if let Some(sum) = self.sums.get_mut(&name) {
                sum.data = sum.data.zeros_like();
            }
        }
        for mass in self.weight_mass.values_mut() {
            mass.fill(0.0);
        }
    }
}
