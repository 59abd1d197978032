//! # seqlabel Core
//!
//! Data model shared by the seqlabel training driver: gold examples,
//! batches shaped like the serving contract, prediction records and their
//! alignment, BIO tag handling, chunk-level metrics and Viterbi decoding.
//!
//! ## Quick Start
//!
//! ```rust
//! use seqlabel_core::metrics::ChunkScorer;
//!
//! let mut scorer = ChunkScorer::new();
//! scorer.update(&["B-PER", "O", "O"], &["B-PER", "O", "O"]);
//! assert_eq!(scorer.f1(), 1.0);
//! ```
pub mod error;
pub mod metrics;
pub mod tags;
pub mod types;
pub mod viterbi;

// Re-export primary API
pub use error::{Result, TrainError};
pub use metrics::{ChunkScorer, EvalMetrics};
pub use tags::{chunks, Chunk, Tag, TagPosition};
pub use types::{AlignedExample, Batch, Example, Features, PredictionRecord};
pub use viterbi::ViterbiDecoder;
