//! # seqlabel Trainer
//!
//! Drives one sequence-labeling experiment: resolves and persists the
//! configuration, names the run after its hyperparameters, alternates
//! training and throttled evaluation with plateau early stopping, then writes
//! per-split prediction files and a versioned servable export.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use seqlabel_trainer::pipeline::{train_model, TrainRequest};
//!
//! let request = TrainRequest::builder("data", "results")
//!     .with_override("batch_size", serde_json::json!(32))
//!     .build();
//! let outcome = train_model(request)?;
//! println!("{} -> {}", outcome.identity, outcome.training.evaluation);
//! # Ok::<(), seqlabel_core::TrainError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod identity;
pub mod model;
pub mod monitor;
pub mod observer;
pub mod pipeline;
pub mod predictions;
pub mod servable;
pub mod trainer;

pub use config::{resolve, Configuration, TrainingParams};
pub use identity::{build_identity, RunDirs, RunIdentity};
pub use monitor::{ListenerAction, StopIfNoIncrease, TrainingListener};
pub use pipeline::{train_model, ModelSource, PipelineOutcome, TrainRequest};
pub use trainer::{train_and_evaluate, Orchestrator, TrainOutcome};
