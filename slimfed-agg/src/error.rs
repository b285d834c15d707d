//! Error types for the aggregation engine
//!
//! None of these are swallowed internally; every failure propagates to the
//! caller, which decides whether to abort the round or the run.

use thiserror::Error;

use slimfed_model::ModelError;

/// Errors raised by the accumulators and the round orchestrator.
#[derive(Debug, Error)]
pub enum AggError {
    /// More contributions folded than expected this round; indicates a caller
    /// bug and the round must be aborted
    #[error("Over-accumulation: {count} contributions already folded, expected {expected}")]
    OverAccumulation {
        /// Contributions folded so far
        count: usize,
        /// Contributions expected per round
        expected: usize,
    },

    /// Finalize called before all expected contributions arrived
    #[error("Incomplete accumulation: folded {count} of {expected} expected contributions")]
    IncompleteAccumulation {
        /// Contributions folded so far
        count: usize,
        /// Contributions expected per round
        expected: usize,
    },

    /// A contribution does not fit the server tensor even after slicing
    #[error("Shape mismatch for parameter {name}: contribution {actual:?} does not fit server {expected:?} at shift {shift}")]
    ShapeMismatch {
        /// Parameter name
        name: String,
        /// Server-side shape
        expected: Vec<i64>,
        /// Contribution shape
        actual: Vec<i64>,
        /// Shift index at which placement failed
        shift: usize,
    },

    /// Slicing only generalizes to rank-1 and rank-2+ tensors
    #[error("Unsupported tensor rank {rank} for parameter {name}")]
    UnsupportedRank {
        /// Parameter name
        name: String,
        /// Offending rank
        rank: usize,
    },

    /// Weight averaging is only defined for float tensors
    #[error("Unsupported dtype {dtype} for averaged parameter {name}")]
    UnsupportedDtype {
        /// Parameter name
        name: String,
        /// Offending dtype
        dtype: &'static str,
    },

    /// Duplicate shift indices within one contribution would double-count
    /// the same slice
    #[error("Overlapping shift indices {shifts:?} within one contribution")]
    OverlappingShifts {
        /// The offending shift list
        shifts: Vec<usize>,
    },

    /// An output shift cannot be combined with a multi-shift contribution
    #[error("Output shift cannot be combined with {num_shifts} shift indices")]
    InvalidShiftCombination {
        /// Number of shift indices supplied
        num_shifts: usize,
    },

    /// A client requests more atomic slices than exist
    #[error("Client needs {requested} bases but only {available} slots exist")]
    InvalidBaseCount {
        /// Bases requested
        requested: usize,
        /// Total slot count
        available: usize,
    },

    /// A client ratio is not an integer multiple of the atomic ratio
    #[error("Ratio {ratio} is not an integer multiple of atomic ratio {atom}")]
    NonAtomicRatio {
        /// The offending ratio
        ratio: f64,
        /// Atomic ratio
        atom: f64,
    },

    /// Round operations called out of order
    #[error("No round in progress")]
    NoActiveRound,

    /// A second round cannot start while one is active
    #[error("Round {round} still in progress")]
    RoundInProgress {
        /// The active round number
        round: u64,
    },

    /// A contribution arrived from a client outside this round
    #[error("Client {client_id} is not a participant of this round")]
    UnknownClient {
        /// Client identifier
        client_id: String,
    },

    /// A client tried to contribute twice in one round
    #[error("Contribution from client {client_id} already folded this round")]
    AlreadyFolded {
        /// Client identifier
        client_id: String,
    },

    /// Model collaborator errors
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Parameter store serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}
