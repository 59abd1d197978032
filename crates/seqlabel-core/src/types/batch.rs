use super::example::Example;
use crate::error::{Result, TrainError};

/// Padding value for `words` rows shorter than the batch maximum.
pub const PAD_WORD: &str = "";

/// Model inputs for one batch, shaped like the serving contract:
/// `words` is `[batch, max_len]` (padded) and `words_len` is `[batch]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub words: Vec<Vec<String>>,
    pub words_len: Vec<usize>,
}

impl Features {
    /// Build padded features from unpadded sentences.
    pub fn from_sentences<S: AsRef<[String]>>(sentences: &[S]) -> Self {
        let max_len = sentences
            .iter()
            .map(|s| s.as_ref().len())
            .max()
            .unwrap_or(0);
        let mut words = Vec::with_capacity(sentences.len());
        let mut words_len = Vec::with_capacity(sentences.len());
        for sentence in sentences {
            let sentence = sentence.as_ref();
            let mut row = sentence.to_vec();
            row.resize(max_len, PAD_WORD.to_string());
            words.push(row);
            words_len.push(sentence.len());
        }
        Self { words, words_len }
    }

    pub fn batch_size(&self) -> usize {
        self.words.len()
    }

    /// Check that every row has a length and that no length exceeds its row.
    pub fn validate(&self) -> Result<()> {
        if self.words.len() != self.words_len.len() {
            return Err(TrainError::Model(format!(
                "{} rows of words but {} lengths",
                self.words.len(),
                self.words_len.len()
            )));
        }
        if let Some(row) = self
            .words
            .iter()
            .zip(&self.words_len)
            .position(|(w, &len)| len > w.len())
        {
            return Err(TrainError::Model(format!(
                "row {row}: length {} exceeds {} words",
                self.words_len[row],
                self.words[row].len()
            )));
        }
        Ok(())
    }

    /// The unpadded words of row `i`, empty when the row or its length is
    /// missing.
    pub fn sentence(&self, i: usize) -> &[String] {
        match (self.words.get(i), self.words_len.get(i)) {
            (Some(row), Some(&len)) => &row[..len.min(row.len())],
            _ => &[],
        }
    }
}

/// A batch of examples: features, gold labels and the split indices of the
/// examples it was built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub features: Features,
    pub labels: Vec<Vec<String>>,
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn from_examples(examples: &[Example]) -> Self {
        let sentences: Vec<&[String]> = examples.iter().map(|e| e.words.as_slice()).collect();
        Self {
            features: Features::from_sentences(&sentences),
            labels: examples.iter().map(|e| e.tags.clone()).collect(),
            indices: examples.iter().map(|e| e.index).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(index: usize, words: &[&str]) -> Example {
        Example::new(
            index,
            words.iter().map(|w| w.to_string()).collect(),
            words.iter().map(|_| "O".to_string()).collect(),
        )
    }

    #[test]
    fn features_are_padded_to_longest_row() {
        let batch = Batch::from_examples(&[example(0, &["a", "b", "c"]), example(1, &["d"])]);
        assert_eq!(batch.features.words_len, vec![3, 1]);
        assert_eq!(batch.features.words[1], vec!["d", "", ""]);
        assert_eq!(batch.features.sentence(1), &["d".to_string()]);
        assert_eq!(batch.indices, vec![0, 1]);
    }

    #[test]
    fn validate_rejects_malformed_lengths() {
        let words = vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]];

        let short = Features {
            words: words.clone(),
            words_len: vec![2],
        };
        assert!(matches!(short.validate(), Err(TrainError::Model(_))));
        assert!(short.sentence(1).is_empty());

        let overlong = Features {
            words: words.clone(),
            words_len: vec![2, 3],
        };
        assert!(matches!(overlong.validate(), Err(TrainError::Model(_))));

        let ok = Features {
            words,
            words_len: vec![2, 1],
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.sentence(0).len(), 2);
    }

    #[test]
    fn empty_batch() {
        let batch = Batch::from_examples(&[]);
        assert!(batch.is_empty());
        assert_eq!(batch.features.batch_size(), 0);
    }
}
