//! Base shift sampling
//!
//! Shift assignment balances which slots of the full-width model get trained
//! over time. Rather than sampling independently each round, a shuffled pool
//! is consumed round-robin so every slot is drawn exactly once per cycle.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::AggError;

/// Cycles through a value pool in shuffled order, reshuffling on exhaustion.
#[derive(Debug)]
pub struct ShuffleSampler {
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl ShuffleSampler {
    /// Creates a sampler over the given values, seeded deterministically.
    pub fn new(values: Vec<usize>, seed: u64) -> Self {
        let mut sampler = Self {
            order: values,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        sampler.order.shuffle(&mut sampler.rng);
        sampler
    }

    /// The values this sampler cycles through.
    pub fn values(&self) -> &[usize] {
        &self.order
    }

    /// Returns the next value in the current shuffle, or `None` for an
    /// empty pool. A fresh shuffle starts once the pool is exhausted.
    pub fn next_value(&mut self) -> Option<usize> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let value = self.order[self.cursor];
        self.cursor += 1;
        Some(value)
    }
}

/// Assigns base shift indices to clients.
///
/// The first shift of each assignment comes from the long-lived shuffled
/// pool, which guarantees even slot coverage across rounds. Additional
/// shifts for wider clients are drawn from the remaining slots so each
/// assignment is pairwise distinct.
#[derive(Debug)]
pub struct BaseShiftSampler {
    num_slots: usize,
    sampler: ShuffleSampler,
    rng: StdRng,
}

impl BaseShiftSampler {
    /// Creates a sampler over `num_slots` shift slots.
    pub fn new(num_slots: usize, seed: u64) -> Self {
        Self {
            num_slots,
            sampler: ShuffleSampler::new((0..num_slots).collect(), seed),
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
        }
    }

    /// Number of shift slots
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Draws `num_bases` pairwise-distinct shift indices.
    pub fn assign(&mut self, num_bases: usize) -> Result<Vec<usize>, AggError> {
        if num_bases == 0 || num_bases > self.num_slots {
            return Err(AggError::InvalidBaseCount {
                requested: num_bases,
                available: self.num_slots,
            });
        }

        let first = self
            .sampler
            .next_value()
            .ok_or(AggError::InvalidBaseCount {
                requested: num_bases,
                available: self.num_slots,
            })?;
        let mut shifts = vec![first];
        if num_bases == 1 {
            return Ok(shifts);
        }

        // Extra bases come from a one-shot sampler over the remaining slots;
        // one pass through a pool of num_slots - 1 values cannot repeat.
        let remaining: Vec<usize> = (0..self.num_slots).filter(|&s| s != first).collect();
        let mut secondary = ShuffleSampler::new(remaining, self.rng.gen());
        for _ in 1..num_bases {
            if let Some(shift) = secondary.next_value() {
                shifts.push(shift);
            }
        }
        Ok(shifts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_shuffle_sampler_covers_pool_each_cycle() {
        let mut sampler = ShuffleSampler::new(vec![0, 1, 2, 3], 7);
        for _ in 0..5 {
            let mut cycle: Vec<usize> = (0..4).filter_map(|_| sampler.next_value()).collect();
            cycle.sort_unstable();
            assert_eq!(cycle, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn test_shuffle_sampler_empty_pool() {
        let mut sampler = ShuffleSampler::new(vec![], 7);
        assert_eq!(sampler.next_value(), None);
    }

    #[test]
    fn test_assign_is_deterministic() {
        let mut a = BaseShiftSampler::new(4, 42);
        let mut b = BaseShiftSampler::new(4, 42);
        for _ in 0..10 {
            assert_eq!(a.assign(2).unwrap(), b.assign(2).unwrap());
        }
    }

    #[test]
    fn test_assign_pairwise_distinct() {
        let mut sampler = BaseShiftSampler::new(8, 3);
        for _ in 0..50 {
            let mut shifts = sampler.assign(3).unwrap();
            assert!(shifts.iter().all(|&s| s < 8));
            shifts.sort_unstable();
            shifts.dedup();
            assert_eq!(shifts.len(), 3);
        }
    }

    #[test]
    fn test_primary_slot_coverage_is_even() {
        // The first base of each assignment is consumed round-robin from the
        // shuffled pool, so over full cycles every slot appears equally often.
        let mut sampler = BaseShiftSampler::new(4, 11);
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..400 {
            let shifts = sampler.assign(1).unwrap();
            *counts.entry(shifts[0]).or_insert(0) += 1;
        }
        for slot in 0..4 {
            assert_eq!(counts.get(&slot), Some(&100), "slot {slot}");
        }
    }

    #[test]
    fn test_invalid_base_count() {
        let mut sampler = BaseShiftSampler::new(4, 0);
        assert!(matches!(
            sampler.assign(0),
            Err(AggError::InvalidBaseCount { requested: 0, available: 4 })
        ));
        assert!(matches!(
            sampler.assign(5),
            Err(AggError::InvalidBaseCount { requested: 5, available: 4 })
        ));
    }
}
