//! Streaming weighted accumulator
//!
//! Client models are folded in one at a time with a scalar weight; at the end
//! of the round the accumulated sums are divided by the summed weight and
//! written into the server store. The accumulator is an owned, round-scoped
//! object: dropping or resetting it discards all partial state.

use std::collections::HashSet;
use tracing::debug;

use crate::error::AggError;
use crate::store::ParameterStore;
use slimfed_model::{NamedParameters, ParamKind, TensorData};

/// Weighted full-shape accumulator (no slicing).
///
/// `expected` guards against double-counting: folding more than `expected`
/// contributions in one round fails, and finalizing with fewer fails unless
/// the accumulator was made tolerant.
#[derive(Debug)]
pub struct ModelAccumulator {
    expected: usize,
    strict_finalize: bool,
    count: usize,
    weight_sum: f32,
    sums: NamedParameters,
    replicated_written: HashSet<String>,
}

impl ModelAccumulator {
    /// Creates an accumulator over the given shared parameter set.
    ///
    /// Buffers are shaped from `shared`, which is typically
    /// [`ParameterStore::shared_view`].
    pub fn new(shared: &NamedParameters, expected: usize) -> Self {
        let mut sums = NamedParameters::new();
        for (name, param) in shared.iter() {
            let mut zero = param.clone();
            zero.data = param.data.zeros_like();
            sums.insert(name, zero);
        }
        Self {
            expected,
            strict_finalize: true,
            count: 0,
            weight_sum: 0.0,
            sums,
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

    /// Accumulated scalar weight.
    pub fn weight_sum(&self) -> f32 {
        self.weight_sum
    }

    /// Folds one full-shape contribution with the given weight.
    pub fn add(&mut self, contribution: &NamedParameters, weight: f32) -> Result<(), AggError> {
        if self.count >= self.expected {
            return Err(AggError::OverAccumulation {
                count: self.count,
                expected: self.expected,
            });
        }

        let names: Vec<String> = self.sums.keys().map(String::from).collect();
        for name in &names {
            let incoming = contribution
                .get(name)
                .ok_or_else(|| AggError::ShapeMismatch {
                    name: name.clone(),
                    expected: self.sums.shape_of(name).unwrap_or_default().to_vec(),
                    actual: Vec::new(),
                    shift: 0,
                })?;

            let Some(sum) = self.sums.get_mut(name) else {
                continue;
            };

            if sum.kind == ParamKind::Replicated {
                sum.data = incoming.data.clone();
                self.replicated_written.insert(name.clone());
                continue;
            }

            if incoming.data.shape() != sum.data.shape() {
                return Err(AggError::ShapeMismatch {
                    name: name.clone(),
                    expected: sum.data.shape().dims().to_vec(),
                    actual: incoming.data.shape().dims().to_vec(),
                    shift: 0,
                });
            }
            let (Some(acc), Some(src)) = (
                sum.data.as_f32_slice_mut(),
                incoming.data.as_f32_slice(),
            ) else {
                return Err(AggError::UnsupportedDtype {
                    name: name.clone(),
                    dtype: incoming.data.dtype(),
                });
            };
            for (a, &v) in acc.iter_mut().zip(src.iter()) {
                *a += weight * v;
            }
        }

        self.count += 1;
        self.weight_sum += weight;
        debug!(count = self.count, expected = self.expected, "folded contribution");
        Ok(())
    }

    /// Divides accumulated sums by the weight sum and writes the result into
    /// the server store, then resets all accumulation state.
    ///
    /// Client-local parameters are not part of the accumulated key set and
    /// are left unchanged.
    pub fn finalize(&mut self, store: &mut ParameterStore) -> Result<(), AggError> {
        if self.count != self.expected && (self.strict_finalize || self.count == 0) {
            return Err(AggError::IncompleteAccumulation {
                count: self.count,
                expected: self.expected,
            });
        }

        let norm = 1.0 / self.weight_sum;
        for (name, sum) in self.sums.iter() {
            let Some(server) = store.server_mut().get_mut(name) else {
                continue;
            };
            if sum.kind == ParamKind::Replicated {
                if self.replicated_written.contains(name) {
                    server.data = sum.data.clone();
                }
            } else if let (Some(dst), Some(acc)) = (
                server.data.as_f32_slice_mut(),
                sum.data.as_f32_slice(),
            ) {
                for (d, &a) in dst.iter_mut().zip(acc.iter()) {
                    *d = a * norm;
                }
            }
        }

        self.reset();
        Ok(())
    }

    /// Discards all partial state, abandoning the round.
    pub fn reset(&mut self) {
        self.count = 0;
        self.weight_sum = 0.0;
        self.replicated_written.clear();
        let names: Vec<String> = self.sums.keys().map(String::from).collect();
        for name in names {
            if let Some(sum) = self.sums.get_mut(&name) {
                sum.data = sum.data.zeros_like();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use slimfed_model::{Param, TensorShape};

    pub(crate) fn create_test_server() -> NamedParameters {
        let mut params = NamedParameters::new();
        params.insert(
            "fc.weight",
            Param::averaged(TensorData::zeros_f32(vec![2i64, 2])),
        );
        params.insert(
            "fc.bias",
            Param::averaged(TensorData::zeros_f32(vec![2i64])),
        );
        params.insert(
            "steps",
            Param::replicated(TensorData::int64(vec![0], TensorShape::scalar())),
        );
        params
    }

    fn contribution(weight_val: f32, steps: i64) -> NamedParameters {
        let mut params = NamedParameters::new();
        params.insert(
            "fc.weight",
            Param::averaged(TensorData::float32(vec![weight_val; 4], vec![2i64, 2])),
        );
        params.insert(
            "fc.bias",
            Param::averaged(TensorData::float32(vec![weight_val; 2], vec![2i64])),
        );
        params.insert(
            "steps",
            Param::replicated(TensorData::int64(vec![steps], TensorShape::scalar())),
        );
        params
    }

    #[test]
    fn test_weighted_average() {
        let mut store = ParameterStore::new(create_test_server());
        let mut accum = ModelAccumulator::new(&store.shared_view(), 2);

        accum.add(&contribution(1.0, 10), 0.5).unwrap();
        accum.add(&contribution(3.0, 20), 0.5).unwrap();
        accum.finalize(&mut store).unwrap();

        // (0.5*1 + 0.5*3) / (0.5 + 0.5) = 2
        assert_eq!(
            store.server().get("fc.weight").unwrap().data.as_f32_slice().unwrap(),
            &[2.0; 4]
        );
        assert_eq!(
            store.server().get("fc.bias").unwrap().data.as_f32_slice().unwrap(),
            &[2.0; 2]
        );
        // Replicated counter: last write wins, no averaging.
        assert_eq!(
            store.server().get("steps").unwrap().data.as_i64_slice().unwrap(),
            &[20]
        );
    }

    #[test]
    fn test_unequal_weights() {
        let mut store = ParameterStore::new(create_test_server());
        let mut accum = ModelAccumulator::new(&store.shared_view(), 2);

        accum.add(&contribution(1.0, 1), 1.0).unwrap();
        accum.add(&contribution(4.0, 2), 3.0).unwrap();
        accum.finalize(&mut store).unwrap();

        // (1*1 + 3*4) / 4 = 3.25
        assert_eq!(
            store.server().get("fc.weight").unwrap().data.as_f32_slice().unwrap(),
            &[3.25; 4]
        );
    }

    #[test]
    fn test_over_accumulation() {
        let store = ParameterStore::new(create_test_server());
        let mut accum = ModelAccumulator::new(&store.shared_view(), 1);

        accum.add(&contribution(1.0, 1), 1.0).unwrap();
        assert!(matches!(
            accum.add(&contribution(2.0, 2), 1.0),
            Err(AggError::OverAccumulation { count: 1, expected: 1 })
        ));
    }

    #[test]
    fn test_incomplete_finalize_strict() {
        let mut store = ParameterStore::new(create_test_server());
        let mut accum = ModelAccumulator::new(&store.shared_view(), 2);

        accum.add(&contribution(1.0, 1), 0.5).unwrap();
        assert!(matches!(
            accum.finalize(&mut store),
            Err(AggError::IncompleteAccumulation { count: 1, expected: 2 })
        ));
    }

    #[test]
    fn test_incomplete_finalize_tolerant() {
        let mut store = ParameterStore::new(create_test_server());
        let mut accum =
            ModelAccumulator::new(&store.shared_view(), 2).with_strict_finalize(false);

        accum.add(&contribution(2.0, 1), 0.5).unwrap();
        accum.finalize(&mut store).unwrap();

        // Single contribution normalized by its own weight.
        assert_eq!(
            store.server().get("fc.weight").unwrap().data.as_f32_slice().unwrap(),
            &[2.0; 4]
        );
    }

    #[test]
    fn test_finalize_with_nothing_folded_fails_even_tolerant() {
        let mut store = ParameterStore::new(create_test_server());
        let mut accum =
            ModelAccumulator::new(&store.shared_view(), 2).with_strict_finalize(false);
        assert!(matches!(
            accum.finalize(&mut store),
            Err(AggError::IncompleteAccumulation { .. })
        ));
    }

    #[test]
    fn test_reset_discards_partial_state() {
        let mut store = ParameterStore::new(create_test_server());
        let mut accum = ModelAccumulator::new(&store.shared_view(), 2);

        accum.add(&contribution(100.0, 7), 0.5).unwrap();
        accum.reset();
        assert_eq!(accum.count(), 0);
        assert_eq!(accum.weight_sum(), 0.0);

        // A clean round after the reset sees none of the discarded data.
        accum.add(&contribution(1.0, 1), 0.5).unwrap();
        accum.add(&contribution(1.0, 1), 0.5).unwrap();
        accum.finalize(&mut store).unwrap();
        assert_eq!(
            store.server().get("fc.weight").unwrap().data.as_f32_slice().unwrap(),
            &[1.0; 4]
        );
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let store = ParameterStore::new(create_test_server());
        let mut accum = ModelAccumulator::new(&store.shared_view(), 1);

        let mut partial = contribution(1.0, 1);
        partial = partial.filtered(&["fc.weight".to_string()]);
        assert!(matches!(
            accum.add(&partial, 1.0),
            Err(AggError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let store = ParameterStore::new(create_test_server());
        let mut accum = ModelAccumulator::new(&store.shared_view(), 1);

        let mut bad = contribution(1.0, 1);
        bad.insert(
            "fc.weight",
            Param::averaged(TensorData::zeros_f32(vec![3i64, 3])),
        );
        assert!(matches!(
            accum.add(&bad, 1.0),
            Err(AggError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_local_keys_untouched_by_finalize() {
        let mut server = create_test_server();
        server.insert(
            "norm.running_mean",
            Param::averaged(TensorData::float32(vec![5.0; 2], vec![2i64])),
        );
        let mut store =
            ParameterStore::new(server).with_local_keys(vec!["norm.running_mean".to_string()]);
        let mut accum = ModelAccumulator::new(&store.shared_view(), 1);

        accum.add(&contribution(1.0, 1), 1.0).unwrap();
        accum.finalize(&mut store).unwrap();

        assert_eq!(
            store.server().get("norm.running_mean").unwrap().data.as_f32_slice().unwrap(),
            &[5.0; 2]
        );
    }
}
