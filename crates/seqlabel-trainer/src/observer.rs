//! Evaluation-time tensor observation.
//!
//! During evaluation the orchestrator publishes the values of each batch under
//! raw identifiers (`words`, `labels`, `predictions`, ...). An [`EvalObserver`]
//! receives them; [`TensorObserver`] captures a configured subset under
//! logical names, decodes the byte-string ones and logs them.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use seqlabel_core::Batch;

/// A published value.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedValue {
    Bytes(Vec<Vec<u8>>),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

/// Values published for one evaluation batch, keyed by raw identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedTensors {
    values: BTreeMap<String, ObservedValue>,
}

impl NamedTensors {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard tensors of an evaluation batch: `words`, `words_len`,
    /// `labels` and `predictions`, flattened row by row.
    pub fn from_batch(batch: &Batch, predictions: &[Vec<String>]) -> Self {
        let flatten = |rows: &[Vec<String>]| {
            ObservedValue::Bytes(
                rows.iter()
                    .flatten()
                    .map(|s| s.as_bytes().to_vec())
                    .collect(),
            )
        };
        let mut tensors = Self::new();
        tensors.insert("words", flatten(&batch.features.words));
        tensors.insert(
            "words_len",
            ObservedValue::Ints(batch.features.words_len.iter().map(|&l| l as i64).collect()),
        );
        tensors.insert("labels", flatten(&batch.labels));
        tensors.insert("predictions", flatten(predictions));
        tensors
    }

    pub fn insert(&mut self, id: impl Into<String>, value: ObservedValue) {
        self.values.insert(id.into(), value);
    }

    pub fn extend(&mut self, other: NamedTensors) {
        self.values.extend(other.values);
    }

    pub fn get(&self, id: &str) -> Option<&ObservedValue> {
        self.values.get(id)
    }
}

/// Receives the tensors of every evaluation batch. Never called during training.
pub trait EvalObserver {
    fn begin(&mut self, _global_step: u64) {}

    fn observe(&mut self, tensors: &NamedTensors);

    fn end(&mut self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl EvalObserver for NoopObserver {
    fn observe(&mut self, _tensors: &NamedTensors) {}
}

/// Turns one published byte string into text.
pub type Decoder = Box<dyn Fn(&[u8]) -> String + Send>;

/// Lossy UTF-8 decoding.
pub fn utf8_decoder() -> Decoder {
    Box::new(|bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned())
}

/// A captured value: either as published or decoded to text.
#[derive(Debug, Clone, PartialEq)]
pub enum Captured {
    Raw(ObservedValue),
    Decoded(Vec<String>),
}

impl fmt::Display for Captured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Captured::Decoded(items) => write!(f, "{}", items.join(" ")),
            Captured::Raw(ObservedValue::Ints(v)) => write!(f, "{v:?}"),
            Captured::Raw(ObservedValue::Floats(v)) => write!(f, "{v:?}"),
            Captured::Raw(ObservedValue::Bytes(v)) => write!(f, "<{} byte strings>", v.len()),
        }
    }
}

/// Configurable capture/decode observer.
pub struct TensorObserver {
    capture: BTreeMap<String, String>,
    capture_and_decode: BTreeMap<String, String>,
    decoders: BTreeMap<String, Decoder>,
    last: BTreeMap<String, Captured>,
    global_step: u64,
    batches_seen: usize,
}

impl TensorObserver {
    /// * `capture` - logical name -> raw identifier, kept as published
    /// * `capture_and_decode` - logical name -> raw identifier, decoded with
    ///   the decoder registered under the same logical name
    /// * `decoders` - logical name -> decoder
    pub fn new(
        capture: BTreeMap<String, String>,
        capture_and_decode: BTreeMap<String, String>,
        decoders: BTreeMap<String, Decoder>,
    ) -> Self {
        Self {
            capture,
            capture_and_decode,
            decoders,
            last: BTreeMap::new(),
            global_step: 0,
            batches_seen: 0,
        }
    }

    /// Words, labels and predictions of each batch, decoded as UTF-8.
    pub fn standard() -> Self {
        let decoded = [
            ("word_str", "words"),
            ("labels_str", "labels"),
            ("predict_str", "predictions"),
        ];
        Self::new(
            BTreeMap::from([("words_len".to_string(), "words_len".to_string())]),
            decoded
                .iter()
                .map(|(name, id)| (name.to_string(), id.to_string()))
                .collect(),
            decoded
                .iter()
                .map(|(name, _)| (name.to_string(), utf8_decoder()))
                .collect(),
        )
    }

    /// Values captured from the most recent batch.
    pub fn last_capture(&self) -> &BTreeMap<String, Captured> {
        &self.last
    }

    /// Batches observed during the current evaluation.
    pub fn batches_seen(&self) -> usize {
        self.batches_seen
    }
}

impl EvalObserver for TensorObserver {
    fn begin(&mut self, global_step: u64) {
        self.global_step = global_step;
        self.batches_seen = 0;
        self.last.clear();
    }

    fn observe(&mut self, tensors: &NamedTensors) {
        self.batches_seen += 1;
        self.last.clear();

        for (name, id) in &self.capture {
            match tensors.get(id) {
                Some(value) => {
                    self.last.insert(name.clone(), Captured::Raw(value.clone()));
                }
                None => debug!(name = %name, id = %id, "tensor not published"),
            }
        }

        for (name, id) in &self.capture_and_decode {
            let captured = match (tensors.get(id), self.decoders.get(name)) {
                (Some(ObservedValue::Bytes(items)), Some(decode)) => {
                    Captured::Decoded(items.iter().map(|b| decode(b.as_slice())).collect())
                }
                (Some(value), _) => Captured::Raw(value.clone()),
                (None, _) => {
                    debug!(name = %name, id = %id, "tensor not published");
                    continue;
                }
            };
            self.last.insert(name.clone(), captured);
        }

        for (name, value) in &self.last {
            debug!(
                step = self.global_step,
                batch = self.batches_seen,
                "{name}: {value}"
            );
        }
    }

    fn end(&mut self) {
        debug!(
            step = self.global_step,
            batches = self.batches_seen,
            "evaluation observation finished"
        );
    }
}

impl fmt::Debug for TensorObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorObserver")
            .field("capture", &self.capture)
            .field("capture_and_decode", &self.capture_and_decode)
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("batches_seen", &self.batches_seen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqlabel_core::Example;

    fn batch() -> Batch {
        Batch::from_examples(&[Example::new(
            0,
            vec!["Tom".into(), "is".into()],
            vec!["B-PER".into(), "O".into()],
        )])
    }

    #[test]
    fn from_batch_publishes_standard_ids() {
        let tensors = NamedTensors::from_batch(&batch(), &[vec!["B-PER".into(), "B-PER".into()]]);
        assert_eq!(
            tensors.get("words"),
            Some(&ObservedValue::Bytes(vec![b"Tom".to_vec(), b"is".to_vec()]))
        );
        assert_eq!(tensors.get("words_len"), Some(&ObservedValue::Ints(vec![2])));
        assert!(tensors.get("labels").is_some());
        assert!(tensors.get("predictions").is_some());
    }

    #[test]
    fn standard_observer_decodes_strings() {
        let mut observer = TensorObserver::standard();
        observer.begin(7);
        let tensors = NamedTensors::from_batch(&batch(), &[vec!["B-PER".into(), "O".into()]]);
        observer.observe(&tensors);

        let last = observer.last_capture();
        assert_eq!(
            last.get("word_str"),
            Some(&Captured::Decoded(vec!["Tom".into(), "is".into()]))
        );
        assert_eq!(
            last.get("predict_str"),
            Some(&Captured::Decoded(vec!["B-PER".into(), "O".into()]))
        );
        assert_eq!(
            last.get("words_len"),
            Some(&Captured::Raw(ObservedValue::Ints(vec![2])))
        );
        assert_eq!(observer.batches_seen(), 1);
    }

    #[test]
    fn custom_decoder_and_missing_ids() {
        let mut observer = TensorObserver::new(
            BTreeMap::from([("absent".to_string(), "nope".to_string())]),
            BTreeMap::from([("upper".to_string(), "words".to_string())]),
            BTreeMap::from([(
                "upper".to_string(),
                Box::new(|b: &[u8]| String::from_utf8_lossy(b).to_uppercase()) as Decoder,
            )]),
        );
        observer.observe(&NamedTensors::from_batch(&batch(), &[vec![]]));
        let last = observer.last_capture();
        assert!(!last.contains_key("absent"));
        assert_eq!(
            last.get("upper"),
            Some(&Captured::Decoded(vec!["TOM".into(), "IS".into()]))
        );
    }
}
