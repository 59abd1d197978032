//! Model contract for the training loop, and a structured-perceptron CRF
//! tagger that implements it.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};
use tracing::debug;

use seqlabel_core::{Batch, Features, Result, TrainError, ViterbiDecoder};

use crate::config::TrainingParams;
use crate::observer::{NamedTensors, ObservedValue};

/// Trainable state of a model: named weight tensors plus string metadata
/// needed to rebuild it.
#[derive(Debug, Clone)]
pub struct ModelState {
    pub tensors: HashMap<String, Tensor>,
    pub metadata: BTreeMap<String, String>,
}

/// What the training loop needs from a model.
pub trait SequenceModel {
    fn model_name(&self) -> String;

    /// One update on `batch`; returns the batch loss.
    fn train_step(&mut self, batch: &Batch) -> Result<f32>;

    /// One tag sequence per row, `words_len[i]` tags long.
    fn predict(&self, features: &Features) -> Result<Vec<Vec<String>>>;

    fn state(&self) -> Result<ModelState>;

    fn load_state(&mut self, state: ModelState) -> Result<()>;

    /// Extra values published to the evaluation observer.
    fn observed_tensors(&self) -> NamedTensors {
        NamedTensors::new()
    }
}

pub const DEFAULT_MODEL_NAME: &str = "PerceptronCrf";
pub const DEFAULT_LEARNING_RATE: f64 = 0.1;

/// Shape features; hashed lexical features follow them.
const BIAS: usize = 0;
const ALL_CAPS: usize = 1;
const TITLE_CASE: usize = 2;
const HAS_DIGIT: usize = 3;
const ALL_DIGITS: usize = 4;
const BRACKET_START: usize = 5;
const BRACKET_END: usize = 6;
const LONG_TOKEN: usize = 7;
const FIRST_TOKEN: usize = 8;
const LAST_TOKEN: usize = 9;
const NUM_SHAPE_FEATURES: usize = 10;

/// Structured-perceptron CRF: per-feature emission weights, a tag transition
/// matrix and constrained Viterbi decoding.
#[derive(Debug, Clone)]
pub struct PerceptronTagger {
    name: String,
    tags: Vec<String>,
    tag_index: HashMap<String, usize>,
    buckets: usize,
    /// `[(NUM_SHAPE_FEATURES + buckets) * num_tags]`, row per feature
    emission: Vec<f32>,
    /// `[prev * num_tags + curr]`
    transition: Vec<f32>,
    learning_rate: f32,
    dropout: f32,
    decoder: ViterbiDecoder,
    rng: oorandom::Rand64,
}

impl PerceptronTagger {
    pub fn new(tags: Vec<String>, params: &TrainingParams) -> Result<Self> {
        Self::with_shape(
            tags,
            params.embedding.vocabulary_size,
            params
                .optimizer_params
                .learning_rate
                .unwrap_or(DEFAULT_LEARNING_RATE) as f32,
            params.dropout as f32,
        )
    }

    pub fn with_shape(
        tags: Vec<String>,
        buckets: usize,
        learning_rate: f32,
        dropout: f32,
    ) -> Result<Self> {
        if tags.is_empty() {
            return Err(TrainError::Model("tag vocabulary is empty".into()));
        }
        let buckets = buckets.max(1);
        let num_tags = tags.len();
        let tag_index = tags
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();

        Ok(Self {
            name: DEFAULT_MODEL_NAME.to_string(),
            decoder: ViterbiDecoder::new(&tags),
            tag_index,
            emission: vec![0.0; (NUM_SHAPE_FEATURES + buckets) * num_tags],
            transition: vec![0.0; num_tags * num_tags],
            tags,
            buckets,
            learning_rate,
            dropout: dropout.clamp(0.0, 0.95),
            rng: oorandom::Rand64::new(0x5eed),
        })
    }

    /// Rebuild a tagger from saved state (used when serving).
    pub fn from_state(state: ModelState) -> Result<Self> {
        let tags: Vec<String> = serde_json::from_str(meta(&state, "tags")?)?;
        let buckets = meta(&state, "buckets")?
            .parse()
            .map_err(|e| TrainError::Checkpoint(format!("bad `buckets` metadata: {e}")))?;
        let name = meta(&state, "model_name")?.to_string();
        let mut tagger = Self::with_shape(tags, buckets, 0.0, 0.0)?.with_name(name);
        tagger.load_state(state)?;
        Ok(tagger)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    fn num_tags(&self) -> usize {
        self.tags.len()
    }

    fn extract_features(&self, words: &[String], i: usize) -> Vec<usize> {
        let token = words[i].as_str();
        let mut features = vec![BIAS];

        if token.chars().any(char::is_alphabetic)
            && token.chars().all(|c| !c.is_alphabetic() || c.is_uppercase())
        {
            features.push(ALL_CAPS);
        }
        if token.chars().next().is_some_and(char::is_uppercase) {
            features.push(TITLE_CASE);
        }
        if token.chars().any(|c| c.is_ascii_digit()) {
            features.push(HAS_DIGIT);
        }
        if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
            features.push(ALL_DIGITS);
        }
        if token.starts_with('[') || token.starts_with('(') {
            features.push(BRACKET_START);
        }
        if token.ends_with(']') || token.ends_with(')') {
            features.push(BRACKET_END);
        }
        if token.chars().count() > 3 {
            features.push(LONG_TOKEN);
        }
        if i == 0 {
            features.push(FIRST_TOKEN);
        }
        if i + 1 == words.len() {
            features.push(LAST_TOKEN);
        }

        let lower = token.to_lowercase();
        let suffix: String = {
            let chars: Vec<char> = lower.chars().collect();
            chars[chars.len().saturating_sub(3)..].iter().collect()
        };
        let prev = if i > 0 { words[i - 1].to_lowercase() } else { "<s>".into() };
        let next = words
            .get(i + 1)
            .map_or_else(|| "</s>".to_string(), |w| w.to_lowercase());

        for (salt, value) in [("w", &lower), ("suf", &suffix), ("prev", &prev), ("next", &next)] {
            features.push(NUM_SHAPE_FEATURES + self.bucket(salt, value));
        }
        features
    }

    fn bucket(&self, salt: &str, value: &str) -> usize {
        // FNV-1a, stable across runs and platforms.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in salt.bytes().chain([0u8]).chain(value.bytes()) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.buckets as u64) as usize
    }

    fn emissions(&self, features: &[Vec<usize>]) -> Vec<Vec<f32>> {
        let n = self.num_tags();
        features
            .iter()
            .map(|active| {
                let mut scores = vec![0.0f32; n];
                for &f in active {
                    for (tag, score) in scores.iter_mut().enumerate() {
                        *score += self.emission[f * n + tag];
                    }
                }
                scores
            })
            .collect()
    }

    fn transition_matrix(&self) -> Vec<Vec<f32>> {
        self.transition
            .chunks(self.num_tags())
            .map(<[f32]>::to_vec)
            .collect()
    }

    fn decode(&self, features: &[Vec<usize>]) -> Result<Vec<usize>> {
        self.decoder
            .decode(&self.emissions(features), &self.transition_matrix())
    }

    fn sentence_features(&self, words: &[String]) -> Vec<Vec<usize>> {
        (0..words.len())
            .map(|i| self.extract_features(words, i))
            .collect()
    }

    /// Predict tags for one unpadded sentence.
    pub fn predict_sentence(&self, words: &[String]) -> Result<Vec<String>> {
        let path = self.decode(&self.sentence_features(words))?;
        Ok(path.into_iter().map(|t| self.tags[t].clone()).collect())
    }

    fn gold_indices(&self, labels: &[String]) -> Result<Vec<usize>> {
        labels
            .iter()
            .map(|label| {
                self.tag_index
                    .get(label)
                    .copied()
                    .ok_or_else(|| TrainError::Model(format!("unknown tag {label:?}")))
            })
            .collect()
    }

    fn drop_features(&mut self, features: &mut [Vec<usize>]) {
        if self.dropout <= 0.0 {
            return;
        }
        let keep = f64::from(1.0 - self.dropout);
        for active in features.iter_mut() {
            // The bias feature is never dropped.
            let rng = &mut self.rng;
            active.retain(|&f| f == BIAS || rng.rand_float() < keep);
        }
    }

    /// Perceptron update for one sentence; returns the number of mistagged tokens.
    fn update_sentence(&mut self, words: &[String], labels: &[String]) -> Result<usize> {
        if words.len() != labels.len() {
            return Err(TrainError::Model(format!(
                "{} words but {} labels",
                words.len(),
                labels.len()
            )));
        }
        if words.is_empty() {
            return Ok(0);
        }

        let gold = self.gold_indices(labels)?;
        let mut features = self.sentence_features(words);
        self.drop_features(&mut features);
        let predicted = self.decode(&features)?;

        let n = self.num_tags();
        let lr = self.learning_rate;
        let mut errors = 0;

        for (pos, (&p, &g)) in predicted.iter().zip(&gold).enumerate() {
            if p == g {
                continue;
            }
            errors += 1;
            for &f in &features[pos] {
                self.emission[f * n + g] += lr;
                self.emission[f * n + p] -= lr;
            }
        }

        for pos in 1..gold.len() {
            let (gp, gc) = (gold[pos - 1], gold[pos]);
            let (pp, pc) = (predicted[pos - 1], predicted[pos]);
            if (gp, gc) != (pp, pc) {
                self.transition[gp * n + gc] += lr;
                self.transition[pp * n + pc] -= lr;
            }
        }

        Ok(errors)
    }
}

fn meta<'a>(state: &'a ModelState, key: &str) -> Result<&'a str> {
    state
        .metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TrainError::Checkpoint(format!("missing `{key}` metadata")))
}

fn tensor_values(state: &ModelState, name: &str, rows: usize, cols: usize) -> Result<Vec<f32>> {
    let tensor = state
        .tensors
        .get(name)
        .ok_or_else(|| TrainError::Checkpoint(format!("missing tensor `{name}`")))?;
    if tensor.dims() != [rows, cols] {
        return Err(TrainError::Checkpoint(format!(
            "tensor `{name}` has shape {:?}, expected [{rows}, {cols}]",
            tensor.dims()
        )));
    }
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

impl SequenceModel for PerceptronTagger {
    fn model_name(&self) -> String {
        self.name.clone()
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        if batch.labels.len() != batch.features.batch_size() {
            return Err(TrainError::Model(format!(
                "batch has {} feature rows but {} label rows",
                batch.features.batch_size(),
                batch.labels.len()
            )));
        }
        batch.features.validate()?;

        let mut errors = 0usize;
        let mut tokens = 0usize;
        for (row, labels) in batch.labels.iter().enumerate() {
            let words = batch.features.sentence(row);
            errors += self.update_sentence(words, labels)?;
            tokens += words.len();
        }

        let loss = if tokens == 0 {
            0.0
        } else {
            errors as f32 / tokens as f32
        };
        debug!(loss, tokens, "perceptron step");
        Ok(loss)
    }

    fn predict(&self, features: &Features) -> Result<Vec<Vec<String>>> {
        features.validate()?;
        (0..features.batch_size())
            .map(|row| self.predict_sentence(features.sentence(row)))
            .collect()
    }

    fn state(&self) -> Result<ModelState> {
        let n = self.num_tags();
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "emission".to_string(),
            Tensor::from_vec(self.emission.clone(), (NUM_SHAPE_FEATURES + self.buckets, n), &device)?,
        );
        tensors.insert(
            "transition".to_string(),
            Tensor::from_vec(self.transition.clone(), (n, n), &device)?,
        );

        let mut metadata = BTreeMap::new();
        metadata.insert("model_name".to_string(), self.name.clone());
        metadata.insert("tags".to_string(), serde_json::to_string(&self.tags)?);
        metadata.insert("buckets".to_string(), self.buckets.to_string());
        Ok(ModelState { tensors, metadata })
    }

    fn load_state(&mut self, state: ModelState) -> Result<()> {
        if let Some(tags) = state.metadata.get("tags") {
            let saved: Vec<String> = serde_json::from_str(tags)?;
            if saved != self.tags {
                return Err(TrainError::Checkpoint(format!(
                    "checkpoint tags {saved:?} do not match model tags {:?}",
                    self.tags
                )));
            }
        }
        let n = self.num_tags();
        self.emission = tensor_values(&state, "emission", NUM_SHAPE_FEATURES + self.buckets, n)?;
        self.transition = tensor_values(&state, "transition", n, n)?;
        Ok(())
    }

    fn observed_tensors(&self) -> NamedTensors {
        let mut tensors = NamedTensors::new();
        tensors.insert("transition", ObservedValue::Floats(self.transition.clone()));
        tensors
    }
}
