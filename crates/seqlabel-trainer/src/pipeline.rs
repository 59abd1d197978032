//! End-to-end experiment driver: configuration, run identity, training,
//! prediction files and servable export.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::info;

use seqlabel_core::Result;

use crate::config::{resolve, Configuration};
use crate::data::{
    collect_tags, load_tags, ConllExampleGenerator, ConllInputProducer, ExampleGenerator,
    InputProducer,
};
use crate::identity::{RunDirs, RunIdentity};
use crate::model::{PerceptronTagger, SequenceModel, DEFAULT_MODEL_NAME};
use crate::monitor::StopIfNoIncrease;
use crate::observer::{EvalObserver, TensorObserver};
use crate::predictions::PredictionExporter;
use crate::servable::{export_servable, FeatureContract};
use crate::trainer::{Orchestrator, TrainOutcome};

/// Builds a model from the resolved configuration.
pub type ModelFn = Box<dyn FnOnce(&Configuration) -> Result<Box<dyn SequenceModel>>>;

/// Where the model comes from, and so where its run name comes from.
pub enum ModelSource {
    /// A constructor plus the name used in the run identity.
    Function { model: ModelFn, name: String },
    /// A ready model; the run name is its [`SequenceModel::model_name`].
    Model(Box<dyn SequenceModel>),
}

impl ModelSource {
    fn instantiate(self, config: &Configuration) -> Result<(Box<dyn SequenceModel>, String)> {
        match self {
            ModelSource::Function { model, name } => Ok((model(&config.estimator_params())?, name)),
            ModelSource::Model(model) => {
                let name = model.model_name();
                Ok((model, name))
            }
        }
    }
}

/// The reference tagger, with tags from the `tags` file or, when that file is
/// absent, collected from the training split.
pub fn reference_model(config: &Configuration) -> Result<Box<dyn SequenceModel>> {
    let params = config.training_params()?;
    let tags = if params.tags.is_file() {
        load_tags(&params.tags)?
    } else {
        info!(path = %params.tags.display(), "no tags file, collecting tags from the training split");
        collect_tags(&params.train)?
    };
    Ok(Box::new(PerceptronTagger::new(tags, &params)?))
}

/// Everything needed to run one experiment.
pub struct TrainRequest {
    pub data_dir: PathBuf,
    pub result_dir: PathBuf,
    pub overrides: Map<String, Value>,
    pub model: ModelSource,
    pub input_producer: Box<dyn InputProducer>,
    pub example_generator: Box<dyn ExampleGenerator>,
    pub observer: Box<dyn EvalObserver>,
    /// Metric watched by the early-stop monitor.
    pub monitor_metric: String,
}

impl TrainRequest {
    pub fn builder(data_dir: impl Into<PathBuf>, result_dir: impl Into<PathBuf>) -> TrainRequestBuilder {
        TrainRequestBuilder {
            data_dir: data_dir.into(),
            result_dir: result_dir.into(),
            overrides: Map::new(),
            model: None,
            input_producer: None,
            example_generator: None,
            observer: None,
            monitor_metric: "f1".to_string(),
        }
    }
}

#[must_use]
pub struct TrainRequestBuilder {
    data_dir: PathBuf,
    result_dir: PathBuf,
    overrides: Map<String, Value>,
    model: Option<ModelSource>,
    input_producer: Option<Box<dyn InputProducer>>,
    example_generator: Option<Box<dyn ExampleGenerator>>,
    observer: Option<Box<dyn EvalObserver>>,
    monitor_metric: String,
}

impl TrainRequestBuilder {
    /// Replace the top-level option `key`.
    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(key.into(), value);
        self
    }

    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn model_fn<F>(mut self, name: impl Into<String>, model: F) -> Self
    where
        F: FnOnce(&Configuration) -> Result<Box<dyn SequenceModel>> + 'static,
    {
        self.model = Some(ModelSource::Function {
            model: Box::new(model),
            name: name.into(),
        });
        self
    }

    pub fn model(mut self, model: Box<dyn SequenceModel>) -> Self {
        self.model = Some(ModelSource::Model(model));
        self
    }

    pub fn input_producer(mut self, producer: Box<dyn InputProducer>) -> Self {
        self.input_producer = Some(producer);
        self
    }

    pub fn example_generator(mut self, generator: Box<dyn ExampleGenerator>) -> Self {
        self.example_generator = Some(generator);
        self
    }

    pub fn observer(mut self, observer: Box<dyn EvalObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn monitor_metric(mut self, metric: impl Into<String>) -> Self {
        self.monitor_metric = metric.into();
        self
    }

    /// Fill unset collaborators with the CoNLL readers, the reference tagger
    /// and the standard tensor observer.
    pub fn build(self) -> TrainRequest {
        TrainRequest {
            data_dir: self.data_dir,
            result_dir: self.result_dir,
            overrides: self.overrides,
            model: self.model.unwrap_or_else(|| ModelSource::Function {
                model: Box::new(reference_model),
                name: DEFAULT_MODEL_NAME.to_string(),
            }),
            input_producer: self
                .input_producer
                .unwrap_or_else(|| Box::new(ConllInputProducer::default())),
            example_generator: self
                .example_generator
                .unwrap_or_else(|| Box::new(ConllExampleGenerator)),
            observer: self
                .observer
                .unwrap_or_else(|| Box::new(TensorObserver::standard())),
            monitor_metric: self.monitor_metric,
        }
    }
}

/// Artifacts of a finished experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub training: TrainOutcome,
    pub identity: String,
    pub run_dirs: RunDirs,
    /// The persisted configuration log.
    pub params_file: PathBuf,
    /// Prediction file per split.
    pub predictions: BTreeMap<String, PathBuf>,
    /// Directory of the servable export.
    pub export: PathBuf,
}

/// Resolve and persist the configuration, train, then write predictions for
/// `train` and `test` and export the servable model.
pub fn train_model(request: TrainRequest) -> Result<PipelineOutcome> {
    let TrainRequest {
        data_dir,
        result_dir,
        overrides,
        model,
        input_producer,
        example_generator,
        mut observer,
        monitor_metric,
    } = request;

    let config = resolve(overrides, &data_dir, &result_dir)?;
    let params = config.training_params()?;
    let (mut model, name) = model.instantiate(&config)?;

    let identity = RunIdentity::from_params(name, &params);
    let run_dirs = RunDirs::create(&identity, &params)?;
    info!(identity = %identity, model_dir = %run_dirs.model_dir.display(), "run started");

    let mut monitor = StopIfNoIncrease::from_params(monitor_metric, &params.hook.stop_if_no_increase);
    let training = Orchestrator::new(&params, &run_dirs.model_dir).run(
        model.as_mut(),
        input_producer.as_ref(),
        input_producer.as_ref(),
        &mut monitor,
        observer.as_mut(),
    )?;

    let predictions = PredictionExporter::new(
        model.as_ref(),
        input_producer.as_ref(),
        example_generator.as_ref(),
        &params,
    )
    .export_all(&config)?;

    let export = export_servable(
        &run_dirs.model_dir,
        &run_dirs.saved_model_dir,
        &FeatureContract::standard(),
    )?;

    Ok(PipelineOutcome {
        training,
        identity: identity.to_string(),
        params_file: config.path("params_log_file")?,
        run_dirs,
        predictions,
        export,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn build_defaults_to_reference_tagger() {
        let request = TrainRequest::builder("data", "results")
            .with_override("batch_size", json!(4))
            .build();
        assert!(matches!(
            &request.model,
            ModelSource::Function { name, .. } if name == DEFAULT_MODEL_NAME
        ));
        assert_eq!(request.overrides.get("batch_size"), Some(&json!(4)));
        assert_eq!(request.monitor_metric, "f1");
    }

    #[test]
    fn model_source_names() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::defaults(dir.path(), dir.path());
        let tagger =
            PerceptronTagger::with_shape(vec!["O".into()], 4, 0.1, 0.0).unwrap().with_name("Tiny");

        let (_, name) = ModelSource::Model(Box::new(tagger.clone()))
            .instantiate(&config)
            .unwrap();
        assert_eq!(name, "Tiny");

        let (model, name) = ModelSource::Function {
            model: Box::new(move |_: &Configuration| Ok(Box::new(tagger) as Box<dyn SequenceModel>)),
            name: "Explicit".into(),
        }
        .instantiate(&config)
        .unwrap();
        assert_eq!(name, "Explicit");
        assert_eq!(model.model_name(), "Tiny");
    }

    #[test]
    fn reference_model_collects_tags_without_tags_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.conllz"), "Tom B-PER\nleft O\n").unwrap();
        let config = Configuration::defaults(dir.path(), dir.path());

        let model = reference_model(&config).unwrap();
        assert_eq!(model.model_name(), DEFAULT_MODEL_NAME);
    }
}
