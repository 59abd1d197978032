//! Chunk-level precision/recall/F1 and token accuracy for evaluation cycles.

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::tags::chunks;

/// Accumulates gold/predicted chunk counts over an evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct ChunkScorer {
    gold_chunks: usize,
    predicted_chunks: usize,
    correct_chunks: usize,
    correct_tokens: usize,
    total_tokens: usize,
}

impl ChunkScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score one sentence. Tokens beyond the shorter sequence are ignored.
    pub fn update<S: AsRef<str>, T: AsRef<str>>(&mut self, gold: &[S], predicted: &[T]) {
        let gold_set: HashSet<_> = chunks(gold).into_iter().collect();
        let pred_set: HashSet<_> = chunks(predicted).into_iter().collect();

        self.gold_chunks += gold_set.len();
        self.predicted_chunks += pred_set.len();
        self.correct_chunks += gold_set.intersection(&pred_set).count();

        for (g, p) in gold.iter().zip(predicted) {
            if g.as_ref() == p.as_ref() {
                self.correct_tokens += 1;
            }
            self.total_tokens += 1;
        }
    }

    pub fn precision(&self) -> f32 {
        ratio(self.correct_chunks, self.predicted_chunks)
    }

    pub fn recall(&self) -> f32 {
        ratio(self.correct_chunks, self.gold_chunks)
    }

    pub fn f1(&self) -> f32 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    pub fn accuracy(&self) -> f32 {
        ratio(self.correct_tokens, self.total_tokens)
    }

    /// Finish the pass into named metrics.
    pub fn finish(&self, global_step: u64, loss: Option<f32>) -> EvalMetrics {
        let mut values = BTreeMap::new();
        values.insert("precision".to_string(), self.precision());
        values.insert("recall".to_string(), self.recall());
        values.insert("f1".to_string(), self.f1());
        values.insert("accuracy".to_string(), self.accuracy());
        if let Some(loss) = loss {
            values.insert("loss".to_string(), loss);
        }
        EvalMetrics {
            global_step,
            values,
        }
    }
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

/// Named metric values produced by one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub global_step: u64,
    pub values: BTreeMap<String, f32>,
}

impl EvalMetrics {
    pub fn get(&self, name: &str) -> Option<f32> {
        self.values.get(name).copied()
    }
}

impl std::fmt::Display for EvalMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step={}", self.global_step)?;
        for (name, value) in &self.values {
            write!(f, ", {name}={value:.4}")?;
        }
        Ok(())
    }
}
