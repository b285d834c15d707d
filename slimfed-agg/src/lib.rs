//! Slimmable Federated Aggregation Engine
//!
//! Merges model updates from clients that train different-width slices of a
//! shared full-width model:
//! - Per-element weight-mass accumulation for mismatched tensor shapes
//! - Shuffled shift assignment for even long-run slot coverage
//! - Round-scoped lifecycle with an abort path that never taints the server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Slimmable Aggregation Engine                       │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ Round Orchestration (MixAggregator)                              │   │
//! │  │  • Shift assignment                                              │   │
//! │  │  • Contribution folding                                          │   │
//! │  │  • Server model update                                           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ Accumulators                                                     │   │
//! │  │  • Weighted full-shape averaging                                 │   │
//! │  │  • Sliced accumulation with per-element weight mass              │   │
//! │  │  • Replicated parameter copy-through                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ Parameter Store                                                  │   │
//! │  │  • Server parameters                                             │   │
//! │  │  • Per-client local overlays                                     │   │
//! │  │  • Snapshot export/import                                        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod accumulator;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod sampler;
pub mod slim;
pub mod store;

pub use accumulator::ModelAccumulator;
pub use error::AggError;
pub use metrics::{RoundHistory, RoundMetrics, SlotCoverage};
pub use orchestrator::{AggregationStrategy, MixAggregator, ShiftAssignment, SlimRatios};
pub use sampler::{BaseShiftSampler, ShuffleSampler};
pub use slim::SlimmableAccumulator;
pub use store::ParameterStore;
