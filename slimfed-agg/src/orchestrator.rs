//! Round orchestration
//!
//! [`MixAggregator`] drives the server side of a training round: it assigns
//! shift indices to the round's participants, folds their trained models into
//! a round-scoped accumulator at uniform weight, and publishes the merged
//! parameters back into the store when the round completes. Exactly one round
//! is active at a time; an abandoned round leaves the store untouched.

use std::collections::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accumulator::ModelAccumulator;
use crate::error::AggError;
use crate::metrics::{timestamp_now, RoundHistory, RoundMetrics};
use crate::sampler::BaseShiftSampler;
use crate::slim::SlimmableAccumulator;
use crate::store::ParameterStore;
use slimfed_common::AggregationScheme;
use slimfed_model::SlimmableModel;

const RATIO_EPSILON: f64 = 1e-9;

/// Width ratio grid: the atomic ratio, the largest client ratio, and the
/// number of shift slots the atomic slices partition the full width into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlimRatios {
    atom: f64,
    max: f64,
    num_slots: usize,
}

impl SlimRatios {
    /// Derives the ratio grid from the participating clients' width ratios.
    ///
    /// The atomic ratio is the smaller of the smallest client ratio and the
    /// configured floor; every client ratio must be an integer multiple of it.
    pub fn from_client_ratios(ratios: &[f64], floor: f64) -> Result<Self, AggError> {
        let mut min = floor;
        let mut max = 0.0f64;
        for &ratio in ratios {
            if ratio < min {
                min = ratio;
            }
            if ratio > max {
                max = ratio;
            }
        }
        if ratios.is_empty() || min <= 0.0 || max > 1.0 {
            return Err(AggError::NonAtomicRatio { ratio: max, atom: min });
        }

        let grid = Self {
            atom: min,
            max,
            num_slots: (max / min).round() as usize,
        };
        for &ratio in ratios {
            grid.num_bases(ratio)?;
        }
        Ok(grid)
    }

    /// The atomic slice ratio
    pub fn atom(&self) -> f64 {
        self.atom
    }

    /// The largest client ratio
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Number of atomic shift slots
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Number of atomic base slices a client of the given ratio trains.
    pub fn num_bases(&self, ratio: f64) -> Result<usize, AggError> {
        let bases = ratio / self.atom;
        if (bases - bases.round()).abs() > RATIO_EPSILON || bases < 1.0 - RATIO_EPSILON {
            return Err(AggError::NonAtomicRatio {
                ratio,
                atom: self.atom,
            });
        }
        Ok(bases.round() as usize)
    }
}

/// How contributions are merged into the server parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationStrategy {
    /// Classic weighted averaging of full-width models
    FederatedAverage,
    /// Sliced accumulation of heterogeneous-width models
    SlimmableMix,
}

impl From<AggregationScheme> for AggregationStrategy {
    fn from(scheme: AggregationScheme) -> Self {
        match scheme {
            AggregationScheme::FederatedAverage => Self::FederatedAverage,
            AggregationScheme::SlimmableMix => Self::SlimmableMix,
        }
    }
}

/// Shift indices and slice ratio assigned to one participant for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftAssignment {
    /// Pairwise-distinct base shift indices
    pub shifts: Vec<usize>,
    /// Width ratio of each trained slice
    pub slice_ratio: f64,
}

enum RoundAccumulator {
    Plain(ModelAccumulator),
    Sliced(SlimmableAccumulator),
}

struct ActiveRound {
    accumulator: RoundAccumulator,
    assignments: HashMap<String, ShiftAssignment>,
    folded: HashSet<String>,
    weight: f32,
    started_ms: u64,
    shifts_trained: Vec<usize>,
}

/// Server-side round orchestrator.
pub struct MixAggregator {
    store: ParameterStore,
    ratios: SlimRatios,
    strategy: AggregationStrategy,
    sampler: BaseShiftSampler,
    strict_finalize: bool,
    round: u64,
    history: RoundHistory,
    active: Option<ActiveRound>,
}

impl MixAggregator {
    /// Creates an orchestrator over the given store and ratio grid.
    pub fn new(
        store: ParameterStore,
        ratios: SlimRatios,
        strategy: AggregationStrategy,
        seed: u64,
    ) -> Self {
        Self {
            store,
            ratios,
            strategy,
            sampler: BaseShiftSampler::new(ratios.num_slots(), seed),
            strict_finalize: true,
            round: 0,
            history: RoundHistory::default(),
            active: None,
        }
    }

    /// Controls whether completing a round with missing participants fails.
    pub fn with_strict_finalize(mut self, strict: bool) -> Self {
        self.strict_finalize = strict;
        self
    }

    /// The parameter store
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// Rounds completed so far
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Completed-round history and slot coverage
    pub fn history(&self) -> &RoundHistory {
        &self.history
    }

    /// Whether a round is currently accepting contributions
    pub fn round_active(&self) -> bool {
        self.active.is_some()
    }

    /// Opens a round for the given `(client_id, width_ratio)` participants
    /// and returns each participant's shift assignment.
    pub fn begin_round(
        &mut self,
        participants: &[(String, f64)],
    ) -> Result<HashMap<String, ShiftAssignment>, AggError> {
        if self.active.is_some() {
            return Err(AggError::RoundInProgress { round: self.round + 1 });
        }

        let mut assignments = HashMap::new();
        for (client_id, ratio) in participants {
            let assignment = match self.strategy {
                AggregationStrategy::FederatedAverage => ShiftAssignment {
                    shifts: vec![0],
                    slice_ratio: 1.0,
                },
                AggregationStrategy::SlimmableMix => {
                    let num_bases = self.ratios.num_bases(*ratio)?;
                    ShiftAssignment {
                        shifts: self.sampler.assign(num_bases)?,
                        slice_ratio: self.ratios.atom(),
                    }
                }
            };
            debug!(client_id = %client_id, ratio, shifts = ?assignment.shifts, "assigned shifts");
            assignments.insert(client_id.clone(), assignment);
        }

        let shared = self.store.shared_view();
        let expected = participants.len();
        let accumulator = match self.strategy {
            AggregationStrategy::FederatedAverage => RoundAccumulator::Plain(
                ModelAccumulator::new(&shared, expected).with_strict_finalize(self.strict_finalize),
            ),
            AggregationStrategy::SlimmableMix => RoundAccumulator::Sliced(
                SlimmableAccumulator::new(&shared, expected)
                    .with_strict_finalize(self.strict_finalize),
            ),
        };

        info!(
            round = self.round + 1,
            participants = expected,
            strategy = ?self.strategy,
            "round opened"
        );
        self.active = Some(ActiveRound {
            accumulator,
            assignments: assignments.clone(),
            folded: HashSet::new(),
            weight: 1.0 / expected as f32,
            started_ms: timestamp_now(),
            shifts_trained: Vec::new(),
        });
        Ok(assignments)
    }

    /// Folds one participant's trained model into the active round.
    ///
    /// Local-only parameters are recorded as the client's overlay rather
    /// than averaged. Each participant folds at most once per round.
    pub fn fold(
        &mut self,
        client_id: &str,
        model: &mut dyn SlimmableModel,
    ) -> Result<(), AggError> {
        let Some(active) = self.active.as_mut() else {
            return Err(AggError::NoActiveRound);
        };
        let Some(assignment) = active.assignments.get(client_id).cloned() else {
            return Err(AggError::UnknownClient {
                client_id: client_id.to_string(),
            });
        };
        if active.folded.contains(client_id) {
            return Err(AggError::AlreadyFolded {
                client_id: client_id.to_string(),
            });
        }

        model.switch_width(1.0, 0, None)?;
        self.store.record_local(client_id, &model.named_parameters());

        match &mut active.accumulator {
            RoundAccumulator::Plain(acc) => {
                acc.add(&model.named_parameters(), active.weight)?;
            }
            RoundAccumulator::Sliced(acc) => {
                acc.add_model(
                    model,
                    active.weight,
                    assignment.slice_ratio,
                    &assignment.shifts,
                    None,
                )?;
            }
        }

        active.folded.insert(client_id.to_string());
        active.shifts_trained.extend_from_slice(&assignment.shifts);
        Ok(())
    }

    /// Finalizes the active round into the store and returns its metrics.
    pub fn complete_round(&mut self) -> Result<RoundMetrics, AggError> {
        let Some(mut active) = self.active.take() else {
            return Err(AggError::NoActiveRound);
        };

        let result = match &mut active.accumulator {
            RoundAccumulator::Plain(acc) => acc.finalize(&mut self.store),
            RoundAccumulator::Sliced(acc) => acc.finalize(&mut self.store),
        };
        if let Err(e) = result {
            // Incomplete round: put it back so stragglers can still fold.
            self.active = Some(active);
            return Err(e);
        }

        self.round += 1;
        let num_participants = active.folded.len() as u32;
        let metrics = RoundMetrics {
            round: self.round,
            num_participants,
            total_weight: num_participants as f32 * active.weight,
            shifts_trained: active.shifts_trained,
            duration_ms: timestamp_now().saturating_sub(active.started_ms),
            timestamp_ms: timestamp_now(),
        };
        info!(
            round = metrics.round,
            participants = metrics.num_participants,
            "round completed"
        );
        self.history.record(metrics.clone());
        Ok(metrics)
    }

    /// Abandons the active round, leaving the server parameters untouched.
    pub fn abort_round(&mut self) {
        if self.active.take().is_some() {
            warn!(round = self.round + 1, "round aborted");
        }
    }

    /// Loads the current server parameters (with the client's local overlay)
    /// into a model at full width.
    pub fn distribute(
        &self,
        model: &mut dyn SlimmableModel,
        client_id: &str,
        strict: bool,
    ) -> Result<(), AggError> {
        model.switch_width(1.0, 0, None)?;
        self.store.load_into(model, client_id, strict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimfed_model::{LayerSpec, SlimmableStack};

    fn create_test_stack() -> SlimmableStack {
        SlimmableStack::new(vec![LayerSpec::linear("fc", 4, 4)])
    }

    fn filled_stack(value: f32) -> SlimmableStack {
        let mut stack = create_test_stack();
        let mut view = stack.named_parameters();
        for name in ["fc.weight", "fc.bias"] {
            if let Some(data) = view.get_mut(name).unwrap().data.as_f32_slice_mut() {
                data.fill(value);
            }
        }
        stack.set_named_parameters(&view, true).unwrap();
        stack
    }

    fn create_test_aggregator(ratios: &[f64], strategy: AggregationStrategy) -> MixAggregator {
        let server = filled_stack(7.0).named_parameters();
        let store = ParameterStore::new(server);
        let grid = SlimRatios::from_client_ratios(ratios, 0.25).unwrap();
        MixAggregator::new(store, grid, strategy, 42)
    }

    #[test]
    fn test_slim_ratios_grid() {
        let grid = SlimRatios::from_client_ratios(&[0.5, 0.25, 1.0], 0.125).unwrap();
        assert_eq!(grid.atom(), 0.125);
        assert_eq!(grid.max(), 1.0);
        assert_eq!(grid.num_slots(), 8);
        assert_eq!(grid.num_bases(0.5).unwrap(), 4);
    }

    #[test]
    fn test_slim_ratios_rejects_non_atomic() {
        assert!(matches!(
            SlimRatios::from_client_ratios(&[0.5, 0.3], 0.25),
            Err(AggError::NonAtomicRatio { .. })
        ));
    }

    #[test]
    fn test_round_lifecycle_guards() {
        let mut agg = create_test_aggregator(&[0.5, 0.5], AggregationStrategy::SlimmableMix);
        assert!(matches!(agg.complete_round(), Err(AggError::NoActiveRound)));

        let participants = vec![("a".to_string(), 0.5), ("b".to_string(), 0.5)];
        agg.begin_round(&participants).unwrap();
        assert!(matches!(
            agg.begin_round(&participants),
            Err(AggError::RoundInProgress { .. })
        ));

        let mut model = filled_stack(1.0);
        assert!(matches!(
            agg.fold("stranger", &mut model),
            Err(AggError::UnknownClient { .. })
        ));

        agg.fold("a", &mut model).unwrap();
        assert!(matches!(
            agg.fold("a", &mut model),
            Err(AggError::AlreadyFolded { .. })
        ));

        // One participant missing: strict completion fails and the round
        // stays open for the straggler.
        assert!(matches!(
            agg.complete_round(),
            Err(AggError::IncompleteAccumulation { .. })
        ));
        assert!(agg.round_active());

        let mut other = filled_stack(1.0);
        agg.fold("b", &mut other).unwrap();
        agg.complete_round().unwrap();
        assert_eq!(agg.round(), 1);
    }

    #[test]
    fn test_slimmable_round_end_to_end() {
        let mut agg = create_test_aggregator(&[0.5, 0.25], AggregationStrategy::SlimmableMix);
        let participants = vec![("wide".to_string(), 0.5), ("narrow".to_string(), 0.25)];
        let assignments = agg.begin_round(&participants).unwrap();
        assert_eq!(assignments["wide"].shifts.len(), 2);
        assert_eq!(assignments["narrow"].shifts.len(), 1);

        let mut wide = filled_stack(1.0);
        let mut narrow = filled_stack(1.0);
        agg.fold("wide", &mut wide).unwrap();
        agg.fold("narrow", &mut narrow).unwrap();
        let metrics = agg.complete_round().unwrap();
        assert_eq!(metrics.num_participants, 2);
        assert_eq!(metrics.shifts_trained.len(), 3);

        // Every trained diagonal cell averaged the all-ones contributions to
        // exactly 1.0; untouched cells keep the pre-round 7.0.
        let weight = agg
            .store()
            .server()
            .get("fc.weight")
            .unwrap()
            .data
            .as_f32_slice()
            .unwrap()
            .to_vec();
        let mut trained: Vec<usize> = metrics.shifts_trained.clone();
        trained.sort_unstable();
        trained.dedup();
        for x in 0..4 {
            for y in 0..4 {
                let expected = if x == y && trained.contains(&x) { 1.0 } else { 7.0 };
                assert_eq!(weight[x * 4 + y], expected, "at ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_federated_average_round() {
        let mut agg = create_test_aggregator(&[1.0, 1.0], AggregationStrategy::FederatedAverage);
        let participants = vec![("a".to_string(), 1.0), ("b".to_string(), 1.0)];
        agg.begin_round(&participants).unwrap();

        let mut a = filled_stack(1.0);
        let mut b = filled_stack(3.0);
        agg.fold("a", &mut a).unwrap();
        agg.fold("b", &mut b).unwrap();
        agg.complete_round().unwrap();

        let weight = agg
            .store()
            .server()
            .get("fc.weight")
            .unwrap()
            .data
            .as_f32_slice()
            .unwrap();
        assert_eq!(weight, &[2.0; 16]);
    }

    #[test]
    fn test_abort_leaves_server_untouched() {
        let mut agg = create_test_aggregator(&[0.5, 0.5], AggregationStrategy::SlimmableMix);
        agg.begin_round(&[("a".to_string(), 0.5)]).unwrap();

        let mut model = filled_stack(100.0);
        agg.fold("a", &mut model).unwrap();
        agg.abort_round();
        assert!(!agg.round_active());
        assert_eq!(agg.round(), 0);

        let weight = agg
            .store()
            .server()
            .get("fc.weight")
            .unwrap()
            .data
            .as_f32_slice()
            .unwrap();
        assert_eq!(weight, &[7.0; 16]);
    }

    #[test]
    fn test_distribute_after_round() {
        let mut agg = create_test_aggregator(&[1.0], AggregationStrategy::FederatedAverage);
        agg.begin_round(&[("a".to_string(), 1.0)]).unwrap();
        let mut model = filled_stack(5.0);
        agg.fold("a", &mut model).unwrap();
        agg.complete_round().unwrap();

        let mut fresh = create_test_stack();
        agg.distribute(&mut fresh, "a", true).unwrap();
        let weight = fresh.named_parameters();
        assert_eq!(
            weight.get("fc.weight").unwrap().data.as_f32_slice().unwrap(),
            &[5.0; 16]
        );
    }
}
