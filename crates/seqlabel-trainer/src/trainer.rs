//! Train/evaluate loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use seqlabel_core::{ChunkScorer, EvalMetrics, Result, TrainError};

use crate::checkpoint::CheckpointStore;
use crate::config::{Configuration, TrainingParams};
use crate::data::{InputMode, InputProducer};
use crate::identity::create_dir;
use crate::model::SequenceModel;
use crate::monitor::{ListenerAction, TrainingListener};
use crate::observer::{EvalObserver, NamedTensors};

pub const EVAL_DIR: &str = "eval";
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Result of a train/evaluate run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    /// Metrics of the last evaluation.
    pub evaluation: EvalMetrics,
    /// Checkpoints written during this run.
    pub checkpoints: Vec<PathBuf>,
    pub global_step: u64,
    /// Whether a listener ended training before `max_steps`.
    pub stopped_early: bool,
}

/// Alternates training steps and throttled evaluation cycles for one run
/// directory.
pub struct Orchestrator<'a> {
    params: &'a TrainingParams,
    store: CheckpointStore,
    eval_dir: PathBuf,
}

impl<'a> Orchestrator<'a> {
    pub fn new(params: &'a TrainingParams, model_dir: &Path) -> Self {
        Self {
            params,
            store: CheckpointStore::new(model_dir)
                .with_keep_max(params.estimator.keep_checkpoint_max),
            eval_dir: model_dir.join(EVAL_DIR),
        }
    }

    pub fn eval_dir(&self) -> &Path {
        &self.eval_dir
    }

    /// Run until `max_steps` or until a listener asks to stop.
    pub fn run(
        &self,
        model: &mut dyn SequenceModel,
        train_input: &dyn InputProducer,
        eval_input: &dyn InputProducer,
        listener: &mut dyn TrainingListener,
        observer: &mut dyn EvalObserver,
    ) -> Result<TrainOutcome> {
        create_dir(&self.eval_dir)?;

        let max_steps = self.params.train_spec.max_steps;
        let throttle = Duration::from_secs(self.params.eval_spec.throttle_secs);
        let checkpoint_every = Duration::from_secs(self.params.estimator.save_checkpoints_secs);

        let mut global_step = self.restore(model)?;
        let mut checkpoints = Vec::new();
        let mut saved_step = global_step;
        let mut last_checkpoint = Instant::now();
        let mut last_eval = Instant::now();
        let mut evaluation: Option<EvalMetrics> = None;
        let mut losses: Vec<f32> = Vec::new();
        let mut stopped_early = false;

        if global_step < max_steps {
            info!(
                model = %model.model_name(),
                start = global_step,
                max_steps,
                "training started"
            );
            let mut batches = train_input.batches(&self.params.train, InputMode::Train, self.params)?;

            while global_step < max_steps {
                let Some(batch) = batches.next() else {
                    warn!(step = global_step, "training input exhausted before max_steps");
                    break;
                };
                let loss = model.train_step(&batch?)?;
                global_step += 1;
                losses.push(loss);
                debug!(step = global_step, loss, "train step");

                if last_checkpoint.elapsed() >= checkpoint_every {
                    checkpoints.push(self.checkpoint(model, global_step)?);
                    saved_step = global_step;
                    last_checkpoint = Instant::now();
                }

                if last_eval.elapsed() < throttle {
                    continue;
                }
                if saved_step != global_step {
                    checkpoints.push(self.checkpoint(model, global_step)?);
                    saved_step = global_step;
                    last_checkpoint = Instant::now();
                }
                let metrics =
                    self.evaluate(model, eval_input, observer, global_step, mean(&losses))?;
                losses.clear();
                last_eval = Instant::now();

                let action = listener.after_evaluation(&metrics);
                evaluation = Some(metrics);
                if action == ListenerAction::Stop {
                    info!(
                        step = global_step,
                        listener = listener.name(),
                        "training stopped early"
                    );
                    stopped_early = true;
                    break;
                }
            }
        } else {
            info!(step = global_step, max_steps, "checkpoint already at max_steps");
        }

        if saved_step != global_step || self.store.latest()?.is_none() {
            checkpoints.push(self.checkpoint(model, global_step)?);
        }
        let evaluation = match evaluation {
            Some(metrics) if metrics.global_step == global_step => metrics,
            _ => self.evaluate(model, eval_input, observer, global_step, mean(&losses))?,
        };

        info!(step = global_step, %evaluation, stopped_early, "training finished");
        Ok(TrainOutcome {
            evaluation,
            checkpoints,
            global_step,
            stopped_early,
        })
    }

    /// Load the latest checkpoint into `model`; returns its global step.
    fn restore(&self, model: &mut dyn SequenceModel) -> Result<u64> {
        let Some(checkpoint) = self.store.latest()? else {
            return Ok(0);
        };
        let (state, meta) = self.store.load(&checkpoint)?;
        model.load_state(state)?;
        info!(
            step = meta.global_step,
            path = %checkpoint.weights.display(),
            "resumed from checkpoint"
        );
        Ok(meta.global_step)
    }

    fn checkpoint(&self, model: &dyn SequenceModel, global_step: u64) -> Result<PathBuf> {
        Ok(self.store.save(global_step, &model.state()?)?.weights)
    }

    /// One full pass over the evaluation split.
    pub fn evaluate(
        &self,
        model: &dyn SequenceModel,
        eval_input: &dyn InputProducer,
        observer: &mut dyn EvalObserver,
        global_step: u64,
        loss: Option<f32>,
    ) -> Result<EvalMetrics> {
        let mut scorer = ChunkScorer::new();
        observer.begin(global_step);

        for batch in eval_input.batches(&self.params.test, InputMode::Eval, self.params)? {
            let batch = batch?;
            let predictions = model.predict(&batch.features)?;
            if predictions.len() != batch.len() {
                return Err(TrainError::Model(format!(
                    "{} predictions for a batch of {}",
                    predictions.len(),
                    batch.len()
                )));
            }
            for (gold, predicted) in batch.labels.iter().zip(&predictions) {
                scorer.update(gold, predicted);
            }

            let mut tensors = NamedTensors::from_batch(&batch, &predictions);
            tensors.extend(model.observed_tensors());
            observer.observe(&tensors);
        }

        observer.end();
        let metrics = scorer.finish(global_step, loss);
        self.record(&metrics)?;
        info!(%metrics, "evaluation");
        Ok(metrics)
    }

    fn record(&self, metrics: &EvalMetrics) -> Result<()> {
        let path = self.eval_dir.join(METRICS_FILE);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(metrics)?)?;
        Ok(())
    }
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

/// Train and evaluate `model` in `model_dir` with the options of `config`.
pub fn train_and_evaluate(
    model: &mut dyn SequenceModel,
    train_input: &dyn InputProducer,
    eval_input: &dyn InputProducer,
    config: &Configuration,
    model_dir: &Path,
    listener: &mut dyn TrainingListener,
    observer: &mut dyn EvalObserver,
) -> Result<TrainOutcome> {
    let params = config.training_params()?;
    Orchestrator::new(&params, model_dir).run(model, train_input, eval_input, listener, observer)
}
