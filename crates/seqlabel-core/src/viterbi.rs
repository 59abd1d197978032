//! # Viterbi Decoding
//!
//! Finds the highest-scoring tag sequence given per-token emission scores and
//! a tag-to-tag transition matrix, with BIO transition constraints.

use crate::error::{Result, TrainError};
use crate::tags::Tag;

/// Viterbi decoder over a fixed tag set.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
    /// `allowed[prev][curr]`
    allowed: Vec<Vec<bool>>,
}

impl ViterbiDecoder {
    /// Create a decoder whose constraint mask is derived from the tag names.
    pub fn new<S: AsRef<str>>(tags: &[S]) -> Self {
        let allowed = tags
            .iter()
            .map(|prev| {
                tags.iter()
                    .map(|curr| Tag::is_valid_transition(prev.as_ref(), curr.as_ref()))
                    .collect()
            })
            .collect();
        Self {
            num_tags: tags.len(),
            allowed,
        }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Decode the optimal tag sequence.
    ///
    /// # Arguments
    /// * `emission_scores` - `[seq_len][num_tags]`
    /// * `transition_matrix` - `[prev][curr]`, `[num_tags][num_tags]`
    ///
    /// # Returns
    /// The optimal tag sequence as indices.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<Vec<usize>> {
        let seq_len = emission_scores.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }

        if let Some(row) = emission_scores.iter().find(|row| row.len() != self.num_tags) {
            return Err(TrainError::Model(format!(
                "emission score dimension mismatch: expected {}, got {}",
                self.num_tags,
                row.len()
            )));
        }
        if transition_matrix.len() != self.num_tags
            || transition_matrix.iter().any(|row| row.len() != self.num_tags)
        {
            return Err(TrainError::Model(format!(
                "transition matrix must be {0}x{0}",
                self.num_tags
            )));
        }

        let mut dp = vec![vec![f32::NEG_INFINITY; self.num_tags]; seq_len];
        let mut backptr = vec![vec![0usize; self.num_tags]; seq_len];

        dp[0].copy_from_slice(&emission_scores[0]);

        for pos in 1..seq_len {
            for curr in 0..self.num_tags {
                let mut best_score = f32::NEG_INFINITY;
                let mut best_prev = None;

                for prev in 0..self.num_tags {
                    if !self.allowed[prev][curr] {
                        continue;
                    }
                    let score = dp[pos - 1][prev] + transition_matrix[prev][curr];
                    if best_prev.is_none() || score > best_score {
                        best_score = score;
                        best_prev = Some(prev);
                    }
                }

                dp[pos][curr] = best_score + emission_scores[pos][curr];
                backptr[pos][curr] = best_prev.unwrap_or(0);
            }
        }

        let mut best_final = 0;
        for tag in 1..self.num_tags {
            if dp[seq_len - 1][tag] > dp[seq_len - 1][best_final] {
                best_final = tag;
            }
        }

        let mut path = Vec::with_capacity(seq_len);
        path.push(best_final);
        let mut curr = best_final;
        for pos in (1..seq_len).rev() {
            curr = backptr[pos][curr];
            path.push(curr);
        }
        path.reverse();
        Ok(path)
    }
}
