//! Prediction files: one `word gold predicted` line per token, a blank line
//! after each example.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use seqlabel_core::{AlignedExample, PredictionRecord, Result, TrainError};

use crate::config::{Configuration, TrainingParams};
use crate::data::{BatchStream, ExampleGenerator, InputMode, InputProducer};
use crate::model::SequenceModel;

/// Splits exported after training.
pub const EXPORTED_SPLITS: [&str; 2] = ["train", "test"];

/// Predictions of `model` over an evaluation-mode batch stream, one record per
/// example, produced lazily batch by batch.
pub struct PredictionStream<'a> {
    model: &'a dyn SequenceModel,
    batches: BatchStream,
    pending: VecDeque<PredictionRecord>,
}

impl<'a> PredictionStream<'a> {
    pub fn new(model: &'a dyn SequenceModel, batches: BatchStream) -> Self {
        Self {
            model,
            batches,
            pending: VecDeque::new(),
        }
    }

    fn refill(&mut self) -> Option<Result<()>> {
        let batch = match self.batches.next()? {
            Ok(batch) => batch,
            Err(e) => return Some(Err(e)),
        };
        let predictions = match self.model.predict(&batch.features) {
            Ok(predictions) => predictions,
            Err(e) => return Some(Err(e)),
        };
        if predictions.len() != batch.indices.len() {
            return Some(Err(TrainError::Model(format!(
                "{} predictions for a batch of {}",
                predictions.len(),
                batch.indices.len()
            ))));
        }
        self.pending.extend(
            batch
                .indices
                .iter()
                .zip(predictions)
                .map(|(&index, tags)| PredictionRecord::new(index, tags)),
        );
        Some(Ok(()))
    }
}

impl Iterator for PredictionStream<'_> {
    type Item = Result<PredictionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() {
            if let Err(e) = self.refill()? {
                return Some(Err(e));
            }
        }
        self.pending.pop_front().map(Ok)
    }
}

/// Writes prediction files for one trained model.
pub struct PredictionExporter<'a> {
    model: &'a dyn SequenceModel,
    producer: &'a dyn InputProducer,
    generator: &'a dyn ExampleGenerator,
    params: &'a TrainingParams,
}

impl<'a> PredictionExporter<'a> {
    pub fn new(
        model: &'a dyn SequenceModel,
        producer: &'a dyn InputProducer,
        generator: &'a dyn ExampleGenerator,
        params: &'a TrainingParams,
    ) -> Self {
        Self {
            model,
            producer,
            generator,
            params,
        }
    }

    /// Predict over `input` and write the aligned result to `output`,
    /// truncating it first. Returns the number of examples written.
    pub fn write(&self, split: &str, input: &Path, output: &Path) -> Result<usize> {
        let write_err = |source| TrainError::Write {
            path: output.to_path_buf(),
            source,
        };
        let mut writer = BufWriter::new(File::create(output).map_err(write_err)?);

        let mut gold = self.generator.examples(input)?;
        let mut predicted = PredictionStream::new(
            self.model,
            self.producer.batches(input, InputMode::Eval, self.params)?,
        );

        let mut written = 0;
        loop {
            let aligned = match (gold.next().transpose()?, predicted.next().transpose()?) {
                (Some(example), Some(record)) => AlignedExample::new(example, record)?,
                (None, None) => break,
                (Some(example), None) => {
                    return Err(TrainError::Alignment {
                        index: example.index,
                        reason: "prediction stream ended before the gold examples".into(),
                    });
                }
                (None, Some(record)) => {
                    return Err(TrainError::Alignment {
                        index: record.index,
                        reason: "gold examples ended before the prediction stream".into(),
                    });
                }
            };

            for (word, gold_tag, predicted_tag) in aligned.tokens() {
                writeln!(writer, "{word} {gold_tag} {predicted_tag}").map_err(write_err)?;
            }
            writeln!(writer).map_err(write_err)?;
            written += 1;
        }
        writer.flush().map_err(write_err)?;

        info!(split, examples = written, path = %output.display(), "predictions written");
        Ok(written)
    }

    /// Write predictions for the `train` and `test` splits to their
    /// configured `preds` files.
    pub fn export_all(&self, config: &Configuration) -> Result<BTreeMap<String, PathBuf>> {
        let mut files = BTreeMap::new();
        for split in EXPORTED_SPLITS {
            let output = config.preds_file(split)?;
            self.write(split, &config.split_file(split)?, &output)?;
            files.insert(split.to_string(), output);
        }
        Ok(files)
    }
}

/// Write the predictions of `model` for one split.
pub fn write_predictions(
    split: &str,
    model: &dyn SequenceModel,
    producer: &dyn InputProducer,
    generator: &dyn ExampleGenerator,
    params: &TrainingParams,
    input: &Path,
    output: &Path,
) -> Result<usize> {
    PredictionExporter::new(model, producer, generator, params).write(split, input, output)
}
