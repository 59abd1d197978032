//! Data loading for CoNLL-style BIO files, and the producer/generator
//! contracts the training loop and the prediction writer read through.
//!
//! File format: one `token ... tag` line per token (first column is the word,
//! last column the tag), a blank line between sentences. `#` lines before the
//! first token of a sentence are headers and skipped; inside a sentence they
//! are tokens.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use seqlabel_core::tags::OUTSIDE;
use seqlabel_core::{Batch, Example, Result, TrainError};

use crate::config::TrainingParams;

pub type ExampleStream = Box<dyn Iterator<Item = Result<Example>>>;
pub type BatchStream = Box<dyn Iterator<Item = Result<Batch>>>;

/// How a split is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Shuffled, repeated `epochs` times (forever when unset).
    Train,
    /// One ordered pass.
    Eval,
}

/// Produces model-ready batches from a data file.
///
/// In [`InputMode::Eval`] batches must follow file order, so that example
/// indices line up with an [`ExampleGenerator`] over the same file.
pub trait InputProducer {
    fn batches(&self, path: &Path, mode: InputMode, params: &TrainingParams)
        -> Result<BatchStream>;
}

/// Produces gold examples from a data file, in file order.
pub trait ExampleGenerator {
    fn examples(&self, path: &Path) -> Result<ExampleStream>;
}

/// Lazy reader yielding one [`Example`] per sentence.
pub struct ConllReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    next_index: usize,
    done: bool,
}

impl ConllReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| TrainError::Input {
            path: path.clone(),
            line: 0,
            reason: e.to_string(),
        })?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
            next_index: 0,
            done: false,
        })
    }

    fn read_sentence(&mut self) -> Result<Option<Example>> {
        let mut words = Vec::new();
        let mut tags = Vec::new();

        while let Some(line) = self.lines.next() {
            self.line_no += 1;
            let line = line?;
            let line = line.trim();

            if line.is_empty() {
                if words.is_empty() {
                    continue;
                }
                break;
            }
            // `#` lines are headers only before the first token of a sentence.
            if line.starts_with('#') && words.is_empty() {
                continue;
            }

            let mut columns = line.split_whitespace();
            match (columns.next(), columns.last()) {
                (Some(word), Some(tag)) => {
                    words.push(word.to_string());
                    tags.push(tag.to_string());
                }
                _ => {
                    return Err(TrainError::Input {
                        path: self.path.clone(),
                        line: self.line_no,
                        reason: format!("expected `token tag`, got {line:?}"),
                    })
                }
            }
        }

        if words.is_empty() {
            return Ok(None);
        }
        let example = Example::new(self.next_index, words, tags);
        self.next_index += 1;
        Ok(Some(example))
    }
}

impl Iterator for ConllReader {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_sentence() {
            Ok(Some(example)) => Some(Ok(example)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Load a whole split into memory.
pub fn load_conll<P: AsRef<Path>>(path: P) -> Result<Vec<Example>> {
    ConllReader::open(path)?.collect()
}

/// Load the tag vocabulary, one tag per line.
pub fn load_tags<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Collect the tag vocabulary of a split: `O` first, then sorted.
pub fn collect_tags<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    for example in ConllReader::open(path)? {
        seen.extend(example?.tags);
    }
    seen.remove(OUTSIDE);
    let mut tags = vec![OUTSIDE.to_string()];
    tags.extend(seen);
    Ok(tags)
}

/// [`ExampleGenerator`] over CoNLL files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConllExampleGenerator;

impl ExampleGenerator for ConllExampleGenerator {
    fn examples(&self, path: &Path) -> Result<ExampleStream> {
        Ok(Box::new(ConllReader::open(path)?))
    }
}

/// [`InputProducer`] over CoNLL files.
#[derive(Debug, Clone, Copy)]
pub struct ConllInputProducer {
    seed: u64,
}

impl ConllInputProducer {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Default for ConllInputProducer {
    fn default() -> Self {
        Self::new(42)
    }
}

impl InputProducer for ConllInputProducer {
    fn batches(
        &self,
        path: &Path,
        mode: InputMode,
        params: &TrainingParams,
    ) -> Result<BatchStream> {
        let batch_size = params.batch_size.max(1);
        match mode {
            InputMode::Eval => Ok(Box::new(OrderedBatches {
                reader: ConllReader::open(path)?,
                batch_size,
            })),
            InputMode::Train => {
                let examples = load_conll(path)?;
                if examples.is_empty() {
                    warn!(path = %path.display(), "training split is empty");
                }
                debug!(
                    path = %path.display(),
                    examples = examples.len(),
                    batch_size,
                    "training stream opened"
                );
                Ok(Box::new(ShuffledBatches::new(
                    examples,
                    batch_size,
                    params.buffer.max(1),
                    params.epochs,
                    self.seed,
                )))
            }
        }
    }
}

struct OrderedBatches {
    reader: ConllReader,
    batch_size: usize,
}

impl Iterator for OrderedBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut examples = Vec::with_capacity(self.batch_size);
        while examples.len() < self.batch_size {
            match self.reader.next() {
                Some(Ok(example)) => examples.push(example),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        if examples.is_empty() {
            None
        } else {
            Some(Ok(Batch::from_examples(&examples)))
        }
    }
}

/// Repeats the split `epochs` times (forever if `None`), shuffling each pass
/// within windows of `buffer` examples.
struct ShuffledBatches {
    examples: Vec<Example>,
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    epochs: Option<u64>,
    batch_size: usize,
    buffer: usize,
    rng: oorandom::Rand64,
}

impl ShuffledBatches {
    fn new(
        examples: Vec<Example>,
        batch_size: usize,
        buffer: usize,
        epochs: Option<u64>,
        seed: u64,
    ) -> Self {
        let mut batches = Self {
            order: (0..examples.len()).collect(),
            examples,
            cursor: 0,
            epoch: 0,
            epochs,
            batch_size,
            buffer,
            rng: oorandom::Rand64::new(u128::from(seed)),
        };
        batches.shuffle();
        batches
    }

    fn shuffle(&mut self) {
        for window in self.order.chunks_mut(self.buffer) {
            for i in (1..window.len()).rev() {
                let j = self.rng.rand_range(0..(i as u64 + 1)) as usize;
                window.swap(i, j);
            }
        }
    }

    fn next_example(&mut self) -> Option<Example> {
        if self.examples.is_empty() {
            return None;
        }
        if self.cursor == self.order.len() {
            self.epoch += 1;
            if self.epochs.is_some_and(|limit| self.epoch >= limit) {
                return None;
            }
            self.cursor = 0;
            self.shuffle();
        }
        let example = self.examples[self.order[self.cursor]].clone();
        self.cursor += 1;
        Some(example)
    }
}

impl Iterator for ShuffledBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut examples = Vec::with_capacity(self.batch_size);
        while examples.len() < self.batch_size {
            match self.next_example() {
                Some(example) => examples.push(example),
                None => break,
            }
        }
        if examples.is_empty() {
            None
        } else {
            Some(Ok(Batch::from_examples(&examples)))
        }
    }
}
