//! Versioned, self-describing export of a trained model for serving.
//!
//! Layout of `<export_dir>/<version>/`:
//!
//! ```text
//! signature.json              feature contract, outputs, model name, step
//! variables/model.safetensors weights of the latest checkpoint
//! variables/meta.json         checkpoint metadata
//! ```
//!
//! The artifact is assembled under `temp-<version>` and renamed into place,
//! so a version directory is either complete or absent.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use seqlabel_core::{Features, Result, TrainError};

use crate::checkpoint::{write_json, CheckpointMeta, CheckpointStore};
use crate::identity::create_dir;
use crate::model::{ModelState, PerceptronTagger, SequenceModel};

pub const SIGNATURE_FILE: &str = "signature.json";
pub const VARIABLES_DIR: &str = "variables";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    String,
    Int32,
}

/// Element type and shape of one input or output; `None` is a free dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Vec<Option<usize>>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Vec<Option<usize>>) -> Self {
        Self { dtype, shape }
    }
}

/// Inputs a serving client must provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureContract {
    pub inputs: BTreeMap<String, TensorSpec>,
}

impl FeatureContract {
    /// `words`: 2-D strings `[batch, time]`; `words_len`: 1-D int32 `[batch]`.
    pub fn standard() -> Self {
        Self {
            inputs: BTreeMap::from([
                (
                    "words".to_string(),
                    TensorSpec::new(DType::String, vec![None, None]),
                ),
                (
                    "words_len".to_string(),
                    TensorSpec::new(DType::Int32, vec![None]),
                ),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub model_name: String,
    pub global_step: u64,
    pub contract: FeatureContract,
    pub outputs: BTreeMap<String, TensorSpec>,
}

/// Export the latest checkpoint of `model_dir` as version "now" (Unix seconds).
pub fn export_servable(
    model_dir: &Path,
    export_dir: &Path,
    contract: &FeatureContract,
) -> Result<PathBuf> {
    let version = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| TrainError::Export(format!("system clock before Unix epoch: {e}")))?
        .as_secs();
    export_servable_versioned(model_dir, export_dir, contract, version)
}

/// Export the latest checkpoint of `model_dir` to `<export_dir>/<version>`.
///
/// Fails with [`TrainError::Export`] if there is no checkpoint or if the
/// version already exists; an existing export is never overwritten.
pub fn export_servable_versioned(
    model_dir: &Path,
    export_dir: &Path,
    contract: &FeatureContract,
    version: u64,
) -> Result<PathBuf> {
    let store = CheckpointStore::new(model_dir);
    let checkpoint = store.latest()?.ok_or_else(|| {
        TrainError::Export(format!("no checkpoint in {}", model_dir.display()))
    })?;
    let (state, meta) = store.load(&checkpoint)?;

    let target = export_dir.join(version.to_string());
    if target.exists() {
        return Err(TrainError::Export(format!(
            "version {version} already exported at {}",
            target.display()
        )));
    }

    create_dir(export_dir)?;
    let staging = export_dir.join(format!("temp-{version}"));
    fs::create_dir(&staging).map_err(|e| {
        TrainError::Export(format!("cannot stage {}: {e}", staging.display()))
    })?;

    let variables = staging.join(VARIABLES_DIR);
    fs::create_dir(&variables)?;
    candle_core::safetensors::save(&state.tensors, variables.join(WEIGHTS_FILE))?;
    write_json(&variables.join(META_FILE), &meta)?;

    let signature = Signature {
        model_name: meta
            .metadata
            .get("model_name")
            .cloned()
            .unwrap_or_default(),
        global_step: meta.global_step,
        contract: contract.clone(),
        outputs: BTreeMap::from([(
            "tags".to_string(),
            TensorSpec::new(DType::String, vec![None, None]),
        )]),
    };
    write_json(&staging.join(SIGNATURE_FILE), &signature)?;

    fs::rename(&staging, &target).map_err(|e| {
        TrainError::Export(format!("cannot publish {}: {e}", target.display()))
    })?;

    info!(
        version,
        step = meta.global_step,
        path = %target.display(),
        "servable exported"
    );
    Ok(target)
}

/// A loaded export, ready to tag padded batches.
#[derive(Debug)]
pub struct Servable {
    dir: PathBuf,
    signature: Signature,
    tagger: PerceptronTagger,
}

impl Servable {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let signature: Signature =
            serde_json::from_str(&fs::read_to_string(dir.join(SIGNATURE_FILE))?)?;
        if signature.contract != FeatureContract::standard() {
            return Err(TrainError::Export(format!(
                "{} declares an unsupported feature contract",
                dir.display()
            )));
        }

        let variables = dir.join(VARIABLES_DIR);
        let meta: CheckpointMeta =
            serde_json::from_str(&fs::read_to_string(variables.join(META_FILE))?)?;
        let tensors = candle_core::safetensors::load(variables.join(WEIGHTS_FILE), &Device::Cpu)?;
        let tagger = PerceptronTagger::from_state(ModelState {
            tensors,
            metadata: meta.metadata,
        })?;

        Ok(Self {
            dir,
            signature,
            tagger,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Tag a padded batch: `words[i]` holds at least `words_len[i]` tokens.
    pub fn predict(&self, words: &[Vec<String>], words_len: &[usize]) -> Result<Vec<Vec<String>>> {
        self.tagger.predict(&Features {
            words: words.to_vec(),
            words_len: words_len.to_vec(),
        })
    }
}
