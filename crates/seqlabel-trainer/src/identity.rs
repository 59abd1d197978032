//! Run identity: a readable key derived from the hyperparameters that
//! distinguish one experiment from another, and the directories keyed by it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use seqlabel_core::{Result, TrainError};

use crate::config::TrainingParams;

/// Rendering of an absent value.
pub const MISSING: &str = "None";

/// Build the run identifier
/// `{model_name}-{batch_size}-{learning_rate}-{dropout}-{max_steps}-{max_steps_without_increase}`.
pub fn build_identity(
    model_name: &str,
    batch_size: usize,
    learning_rate: Option<f64>,
    max_steps: u64,
    max_steps_without_increase: u64,
    dropout: f64,
) -> String {
    let learning_rate = learning_rate.map_or_else(|| MISSING.to_string(), render_float);
    let dropout = render_float(dropout);
    format!("{model_name}-{batch_size}-{learning_rate}-{dropout}-{max_steps}-{max_steps_without_increase}")
}

/// Shortest round-trip rendering that keeps a `.0` on whole numbers and
/// switches to a signed two-digit exponent outside `[1e-4, 1e16)`.
pub fn render_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return value.to_string();
    }
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let scientific = format!("{value:e}");
        return match scientific.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(digits) => ('-', digits),
                    None => ('+', exponent),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => scientific,
        };
    }
    let plain = value.to_string();
    if plain.contains('.') {
        plain
    } else {
        format!("{plain}.0")
    }
}

/// The six hyperparameters a run is keyed on.
#[derive(Debug, Clone, PartialEq)]
pub struct RunIdentity {
    pub model_name: String,
    pub batch_size: usize,
    pub learning_rate: Option<f64>,
    pub dropout: f64,
    pub max_steps: u64,
    pub max_steps_without_increase: u64,
}

impl RunIdentity {
    pub fn from_params(model_name: impl Into<String>, params: &TrainingParams) -> Self {
        Self {
            model_name: model_name.into(),
            batch_size: params.batch_size,
            learning_rate: params.optimizer_params.learning_rate,
            dropout: params.dropout,
            max_steps: params.train_spec.max_steps,
            max_steps_without_increase: params.hook.stop_if_no_increase.max_steps_without_increase,
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&build_identity(
            &self.model_name,
            self.batch_size,
            self.learning_rate,
            self.max_steps,
            self.max_steps_without_increase,
            self.dropout,
        ))
    }
}

/// Per-run checkpoint and export directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirs {
    pub model_dir: PathBuf,
    pub saved_model_dir: PathBuf,
}

impl RunDirs {
    pub fn for_identity(identity: &RunIdentity, params: &TrainingParams) -> Self {
        let key = identity.to_string();
        Self {
            model_dir: params.model_dir.join(&key),
            saved_model_dir: params.saved_model_dir.join(&key),
        }
    }

    /// Resolve and create both directories. Existing directories are reused.
    pub fn create(identity: &RunIdentity, params: &TrainingParams) -> Result<Self> {
        let dirs = Self::for_identity(identity, params);
        create_dir(&dirs.model_dir)?;
        create_dir(&dirs.saved_model_dir)?;
        Ok(dirs)
    }
}

/// `create_dir_all`, reported as [`TrainError::Directory`].
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| TrainError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    #[test]
    fn identity_format() {
        assert_eq!(
            build_identity("BilstmCrfModel", 20, Some(0.001), 5000, 20, 0.5),
            "BilstmCrfModel-20-0.001-0.5-5000-20"
        );
    }

    #[test]
    fn identity_float_rendering() {
        assert_eq!(
            build_identity("m", 8, Some(1e-5), 10, 2, 1.0),
            "m-8-1e-05-1.0-10-2"
        );
        assert_eq!(render_float(0.0001), "0.0001");
        assert_eq!(render_float(1.5e-7), "1.5e-07");
        assert_eq!(render_float(1e16), "1e+16");
        assert_eq!(render_float(0.0), "0.0");
        assert_eq!(render_float(-2.0), "-2.0");
    }

    #[test]
    fn identity_is_idempotent_without_learning_rate() {
        let first = build_identity("crf", 32, None, 100, 3, 0.2);
        let second = build_identity("crf", 32, None, 100, 3, 0.2);
        assert_eq!(first, second);
        assert_eq!(first, "crf-32-None-0.2-100-3");
    }

    #[test]
    fn identity_from_params() {
        let params = Configuration::defaults(Path::new("d"), Path::new("r"))
            .training_params()
            .unwrap();
        let identity = RunIdentity::from_params("perceptron_crf", &params);
        assert_eq!(identity.to_string(), "perceptron_crf-20-None-0.5-5000-20");
        assert_eq!(identity, RunIdentity::from_params("perceptron_crf", &params));
    }

    #[test]
    fn run_dirs_are_created_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let params = Configuration::defaults(Path::new("d"), dir.path())
            .training_params()
            .unwrap();
        let identity = RunIdentity::from_params("m", &params);

        let first = RunDirs::create(&identity, &params).unwrap();
        let second = RunDirs::create(&identity, &params).unwrap();
        assert_eq!(first, second);
        assert!(first.model_dir.is_dir());
        assert!(first.saved_model_dir.is_dir());
        assert!(first.model_dir.ends_with("model_dir/m-20-None-0.5-5000-20"));
    }

    #[test]
    fn directory_error_on_file_in_the_way() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        assert!(matches!(
            create_dir(&blocker.join("child")),
            Err(TrainError::Directory { .. })
        ));
    }
}
