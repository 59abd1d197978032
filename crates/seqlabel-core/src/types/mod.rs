pub mod batch;
pub mod example;

pub use batch::{Batch, Features};
pub use example::{AlignedExample, Example, PredictionRecord};
