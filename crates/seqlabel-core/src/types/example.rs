use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// One gold example read from a data split.
///
/// `index` is the example's position in its split; predictions are paired with
/// gold examples by this index, never by iteration position alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub index: usize,
    pub words: Vec<String>,
    pub tags: Vec<String>,
}

impl Example {
    #[must_use]
    pub fn new(index: usize, words: Vec<String>, tags: Vec<String>) -> Self {
        Self { index, words, tags }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Predicted tags for the example at `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub index: usize,
    pub tags: Vec<String>,
}

impl PredictionRecord {
    #[must_use]
    pub fn new(index: usize, tags: Vec<String>) -> Self {
        Self { index, tags }
    }
}

/// Words, gold tags and predicted tags for one example, guaranteed to have
/// equal lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedExample {
    index: usize,
    words: Vec<String>,
    gold: Vec<String>,
    predicted: Vec<String>,
}

impl AlignedExample {
    /// Pair a gold example with its prediction.
    ///
    /// Fails with [`TrainError::Alignment`] if the indices differ or if the
    /// three token streams do not have the same length.
    pub fn new(gold: Example, prediction: PredictionRecord) -> Result<Self> {
        if gold.index != prediction.index {
            return Err(TrainError::Alignment {
                index: gold.index,
                reason: format!(
                    "gold example {} paired with prediction {}",
                    gold.index, prediction.index
                ),
            });
        }
        if gold.words.len() != gold.tags.len() || gold.words.len() != prediction.tags.len() {
            return Err(TrainError::Alignment {
                index: gold.index,
                reason: format!(
                    "{} words, {} gold tags, {} predicted tags",
                    gold.words.len(),
                    gold.tags.len(),
                    prediction.tags.len()
                ),
            });
        }
        Ok(Self {
            index: gold.index,
            words: gold.words,
            gold: gold.tags,
            predicted: prediction.tags,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Per-token `(word, gold, predicted)` triples.
    pub fn tokens(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.words
            .iter()
            .zip(&self.gold)
            .zip(&self.predicted)
            .map(|((w, g), p)| (w.as_str(), g.as_str(), p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn aligned_example_yields_triples() {
        let gold = Example::new(0, strings(&["Tom", "is"]), strings(&["B-PER", "O"]));
        let pred = PredictionRecord::new(0, strings(&["B-PER", "B-PER"]));
        let aligned = AlignedExample::new(gold, pred).unwrap();
        let triples: Vec<_> = aligned.tokens().collect();
        assert_eq!(triples, vec![("Tom", "B-PER", "B-PER"), ("is", "O", "B-PER")]);
    }

    #[test]
    fn length_mismatch_is_alignment_error() {
        let gold = Example::new(4, strings(&["Tom", "is", "happy"]), strings(&["B-PER", "O", "O"]));
        let pred = PredictionRecord::new(4, strings(&["B-PER", "O"]));
        match AlignedExample::new(gold, pred) {
            Err(TrainError::Alignment { index, .. }) => assert_eq!(index, 4),
            other => panic!("expected alignment error, got {other:?}"),
        }
    }

    #[test]
    fn gold_tag_mismatch_is_alignment_error() {
        let gold = Example::new(0, strings(&["Tom", "is"]), strings(&["B-PER"]));
        let pred = PredictionRecord::new(0, strings(&["B-PER", "O"]));
        assert!(matches!(
            AlignedExample::new(gold, pred),
            Err(TrainError::Alignment { .. })
        ));
    }

    #[test]
    fn index_mismatch_is_alignment_error() {
        let gold = Example::new(1, strings(&["a"]), strings(&["O"]));
        let pred = PredictionRecord::new(2, strings(&["O"]));
        assert!(matches!(
            AlignedExample::new(gold, pred),
            Err(TrainError::Alignment { index: 1, .. })
        ));
    }
}
