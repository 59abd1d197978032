//! Experiment configuration: default tree, override resolution, persistence
//! and the typed view used by the training loop.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{json, Map, Value};
use tracing::info;

use seqlabel_core::{Result, TrainError};

use crate::checkpoint::DEFAULT_KEEP_MAX;

/// File name of the persisted configuration inside the result directory.
pub const PARAMS_LOG_FILE: &str = "params.json";

/// Resolved experiment configuration.
///
/// A nested JSON tree. Keys are kept sorted at every level, so the
/// persisted document is deterministic. There is no mutating API once a
/// configuration has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Configuration {
    values: Map<String, Value>,
}

impl Configuration {
    /// The default configuration tree for the given data and result directories.
    pub fn defaults(data_dir: &Path, result_dir: &Path) -> Self {
        let data = |name: &str| path_string(&data_dir.join(name));
        let result = |name: &str| path_string(&result_dir.join(name));

        let values = json!({
            "dim": 300,
            "dropout": 0.5,
            "num_oov_buckets": 1,
            "epochs": null,
            "batch_size": 20,
            "buffer": 15000,
            "lstm_size": 100,
            "words": data("unicode_char_list.txt"),
            "lookup": data("lookup.txt"),
            "chars": data("vocab.chars.txt"),
            "tags": data("tags.txt"),
            "glove": data("glove.npz"),

            "model_dir": result("model_dir"),
            "params_log_file": result(PARAMS_LOG_FILE),

            "train": data("train.conllz"),
            "test": data("test.conllz"),

            "preds": {
                "train": result("preds_train.txt"),
                "test": result("preds_test.txt"),
            },

            "optimizer_params": {},

            "saved_model_dir": result("saved_model"),

            "hook": {
                "stop_if_no_increase": {
                    "min_steps": 100,
                    "run_every_secs": 60,
                    "max_steps_without_increase": 20
                }
            },

            "train_spec": {
                "max_steps": 5000
            },
            "eval_spec": {
                "throttle_secs": 60
            },

            "estimator": {
                "save_checkpoints_secs": 120
            },

            "embedding": {
                "vocabulary_size": 128003
            }
        });

        match values {
            Value::Object(values) => Self { values },
            _ => unreachable!("default configuration is an object"),
        }
    }

    /// Replace top-level keys with the caller's values.
    ///
    /// The replacement is shallow: an override for `hook` replaces the whole
    /// `hook` mapping, nested defaults under it are not kept.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        for (key, value) in overrides {
            self.values.insert(key, value);
        }
        self
    }

    /// Write the configuration to its `params_log_file`, 4-space indented
    /// with sorted keys.
    pub fn persist(&self) -> Result<PathBuf> {
        let path = self.path("params_log_file")?;
        let write_err = |source| TrainError::ConfigWrite {
            path: path.clone(),
            source,
        };

        let file = File::create(&path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        let mut ser =
            serde_json::Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"    "));
        self.values.serialize(&mut ser).map_err(|e| TrainError::ConfigWrite {
            path: path.clone(),
            source: e.into(),
        })?;
        writer.write_all(b"\n").map_err(write_err)?;
        writer.flush().map_err(write_err)?;

        info!(path = %path.display(), "configuration persisted");
        Ok(path)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A string-valued option as a path.
    pub fn path(&self, key: &str) -> Result<PathBuf> {
        match self.values.get(key) {
            Some(Value::String(s)) => Ok(PathBuf::from(s)),
            Some(other) => Err(invalid(key, format!("expected a path string, got {other}"))),
            None => Err(invalid(key, "missing".into())),
        }
    }

    /// Input file of a data split (`train`, `test`, ...).
    pub fn split_file(&self, split: &str) -> Result<PathBuf> {
        self.path(split)
    }

    /// Prediction output file of a data split, from the `preds` mapping.
    pub fn preds_file(&self, split: &str) -> Result<PathBuf> {
        let key = format!("preds.{split}");
        match self.values.get("preds").and_then(|preds| preds.get(split)) {
            Some(Value::String(s)) => Ok(PathBuf::from(s)),
            Some(other) => Err(invalid(&key, format!("expected a path string, got {other}"))),
            None => Err(invalid(&key, "missing".into())),
        }
    }

    /// Deep copy handed to model construction; changes made to it never
    /// reach the persisted log.
    pub fn estimator_params(&self) -> Configuration {
        self.clone()
    }

    /// Extract the typed options the training loop needs.
    pub fn training_params(&self) -> Result<TrainingParams> {
        Ok(TrainingParams {
            dropout: self.field("dropout")?,
            batch_size: self.field("batch_size")?,
            buffer: self.field("buffer")?,
            epochs: self.field("epochs")?,
            tags: self.field("tags")?,
            model_dir: self.field("model_dir")?,
            saved_model_dir: self.field("saved_model_dir")?,
            train: self.field("train")?,
            test: self.field("test")?,
            optimizer_params: self.field("optimizer_params")?,
            hook: self.field("hook")?,
            train_spec: self.field("train_spec")?,
            eval_spec: self.field("eval_spec")?,
            estimator: self.field("estimator")?,
            embedding: self.field("embedding")?,
        })
    }

    fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.values.get(key).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| invalid(key, e.to_string()))
    }
}

/// Build the default tree, apply `overrides` and persist the result.
pub fn resolve(
    overrides: Map<String, Value>,
    data_dir: &Path,
    result_dir: &Path,
) -> Result<Configuration> {
    let config = Configuration::defaults(data_dir, result_dir).with_overrides(overrides);
    config.persist()?;
    Ok(config)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn invalid(key: &str, reason: String) -> TrainError {
    TrainError::InvalidConfig {
        key: key.to_string(),
        reason,
    }
}

/// Typed view over the options consumed by the training loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingParams {
    pub dropout: f64,
    pub batch_size: usize,
    /// Shuffle window, in examples.
    pub buffer: usize,
    /// Passes over the training split; `None` repeats forever.
    pub epochs: Option<u64>,
    pub tags: PathBuf,
    pub model_dir: PathBuf,
    pub saved_model_dir: PathBuf,
    pub train: PathBuf,
    pub test: PathBuf,
    pub optimizer_params: OptimizerParams,
    pub hook: HookParams,
    pub train_spec: TrainSpec,
    pub eval_spec: EvalSpec,
    pub estimator: EstimatorParams,
    pub embedding: EmbeddingParams,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerParams {
    #[serde(default)]
    pub learning_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookParams {
    pub stop_if_no_increase: StopIfNoIncreaseParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopIfNoIncreaseParams {
    pub min_steps: u64,
    pub run_every_secs: u64,
    pub max_steps_without_increase: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSpec {
    pub max_steps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSpec {
    pub throttle_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorParams {
    pub save_checkpoints_secs: u64,
    /// Checkpoints kept on disk; older ones are pruned.
    #[serde(default = "default_keep_checkpoint_max")]
    pub keep_checkpoint_max: usize,
}

fn default_keep_checkpoint_max() -> usize {
    DEFAULT_KEEP_MAX
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingParams {
    pub vocabulary_size: usize,
}

/// Parse `key=value` override arguments. Values are read as JSON and fall
/// back to a plain string.
pub fn parse_overrides<S: AsRef<str>>(args: &[S]) -> Result<Map<String, Value>> {
    let mut overrides = Map::new();
    for arg in args {
        let arg = arg.as_ref();
        let (key, raw) = arg
            .split_once('=')
            .ok_or_else(|| invalid(arg, "expected key=value".into()))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        overrides.insert(key.trim().to_string(), value);
    }
    Ok(overrides)
}

/// Read an override map from a JSON file.
pub fn load_overrides(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str(&content)? {
        Value::Object(map) => Ok(map),
        other => Err(invalid(
            &path.display().to_string(),
            format!("expected a JSON object, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("overrides must be an object"),
        }
    }

    #[test]
    fn defaults_join_paths() {
        let config = Configuration::defaults(Path::new("data"), Path::new("out"));
        assert_eq!(config.path("tags").unwrap(), Path::new("data").join("tags.txt"));
        assert_eq!(
            config.path("params_log_file").unwrap(),
            Path::new("out").join("params.json")
        );
        assert_eq!(
            config.preds_file("test").unwrap(),
            Path::new("out").join("preds_test.txt")
        );
        assert_eq!(config.get("epochs"), Some(&Value::Null));
    }

    #[test]
    fn defaults_extract_into_typed_params() {
        let params = Configuration::defaults(Path::new("d"), Path::new("r"))
            .training_params()
            .unwrap();
        assert_eq!(params.batch_size, 20);
        assert_eq!(params.dropout, 0.5);
        assert_eq!(params.epochs, None);
        assert_eq!(params.optimizer_params.learning_rate, None);
        assert_eq!(params.hook.stop_if_no_increase.min_steps, 100);
        assert_eq!(params.hook.stop_if_no_increase.max_steps_without_increase, 20);
        assert_eq!(params.train_spec.max_steps, 5000);
        assert_eq!(params.eval_spec.throttle_secs, 60);
        assert_eq!(params.estimator.save_checkpoints_secs, 120);
        assert_eq!(params.embedding.vocabulary_size, 128003);
    }

    #[test]
    fn override_is_shallow() {
        let config = Configuration::defaults(Path::new("d"), Path::new("r")).with_overrides(
            overrides(json!({"hook": {"stop_if_no_increase": {"min_steps": 5}}})),
        );
        assert_eq!(
            config.get("hook"),
            Some(&json!({"stop_if_no_increase": {"min_steps": 5}}))
        );
        // The dropped nested defaults surface when the typed view is built.
        match config.training_params() {
            Err(TrainError::InvalidConfig { key, .. }) => assert_eq!(key, "hook"),
            other => panic!("expected invalid hook, got {other:?}"),
        }
    }

    #[test]
    fn override_adds_unknown_keys_and_replaces_scalars() {
        let config = Configuration::defaults(Path::new("d"), Path::new("r"))
            .with_overrides(overrides(json!({"batch_size": 64, "dev": "d/dev.conllz"})));
        assert_eq!(config.get("batch_size"), Some(&json!(64)));
        assert_eq!(config.split_file("dev").unwrap(), PathBuf::from("d/dev.conllz"));
    }

    #[test]
    fn resolve_persists_sorted_document() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve(
            overrides(json!({"optimizer_params": {"learning_rate": 0.01}})),
            Path::new("data"),
            dir.path(),
        )
        .unwrap();

        let written = std::fs::read_to_string(dir.path().join("params.json")).unwrap();
        assert!(written.contains("\n    \"batch_size\": 20"));
        let batch = written.find("\"batch_size\"").unwrap();
        let buffer = written.find("\"buffer\"").unwrap();
        let tags = written.find("\"tags\"").unwrap();
        assert!(batch < buffer && buffer < tags);

        let reread: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(&reread, &serde_json::to_value(&config).unwrap());
        assert_eq!(
            config.training_params().unwrap().optimizer_params.learning_rate,
            Some(0.01)
        );
    }

    #[test]
    fn resolve_fails_when_log_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        match resolve(Map::new(), Path::new("data"), &missing) {
            Err(TrainError::ConfigWrite { path, .. }) => {
                assert_eq!(path, missing.join("params.json"))
            }
            other => panic!("expected ConfigWrite, got {other:?}"),
        }
    }

    #[test]
    fn estimator_params_is_a_detached_copy() {
        let config = Configuration::defaults(Path::new("d"), Path::new("r"));
        let working = config.estimator_params().with_overrides(overrides(json!({"extra": 1})));
        assert!(config.get("extra").is_none());
        assert!(working.get("extra").is_some());
    }

    #[test]
    fn parse_overrides_reads_json_or_strings() {
        let parsed =
            parse_overrides(&["batch_size=8", "train=/tmp/a.conllz", "hook={\"x\": 1}"]).unwrap();
        assert_eq!(parsed["batch_size"], json!(8));
        assert_eq!(parsed["train"], json!("/tmp/a.conllz"));
        assert_eq!(parsed["hook"], json!({"x": 1}));
        assert!(parse_overrides(&["novalue"]).is_err());
    }

    #[test]
    fn preds_file_per_split() {
        let config = Configuration::defaults(Path::new("d"), Path::new("r"));
        assert_eq!(config.preds_file("train").unwrap(), Path::new("r").join("preds_train.txt"));
        assert!(matches!(
            config.preds_file("dev"),
            Err(TrainError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn keep_checkpoint_max_defaults_when_absent() {
        let config = Configuration::defaults(Path::new("d"), Path::new("r"));
        assert_eq!(config.training_params().unwrap().estimator.keep_checkpoint_max, DEFAULT_KEEP_MAX);

        let config = config.with_overrides(overrides(json!({
            "estimator": {"save_checkpoints_secs": 10, "keep_checkpoint_max": 2}
        })));
        assert_eq!(config.training_params().unwrap().estimator.keep_checkpoint_max, 2);
    }
}
