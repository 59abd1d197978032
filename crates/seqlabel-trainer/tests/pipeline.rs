use std::fs;
use std::path::Path;

use serde_json::{json, Value};

use seqlabel_core::TrainError;
use seqlabel_trainer::model::PerceptronTagger;
use seqlabel_trainer::pipeline::{train_model, TrainRequest, TrainRequestBuilder};
use seqlabel_trainer::servable::{export_servable_versioned, FeatureContract, Servable};

const TRAIN: &str = "\
# doc 1
Tom B-PER
is O
happy O

Anna B-PER
Smith I-PER
left O
Paris B-LOC

the O
end O
";

const TEST: &str = "\
Tom B-PER
left O
Paris B-LOC
";

fn write_data(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("train.conllz"), TRAIN).unwrap();
    fs::write(dir.join("test.conllz"), TEST).unwrap();
    fs::write(dir.join("tags.txt"), "O\nB-PER\nI-PER\nB-LOC\nI-LOC\n").unwrap();
}

fn request(dir: &Path) -> TrainRequestBuilder {
    let data = dir.join("data");
    write_data(&data);
    let results = dir.join("results");
    fs::create_dir_all(&results).unwrap();
    TrainRequest::builder(&data, results)
        .with_override("batch_size", json!(2))
        .with_override("train_spec", json!({"max_steps": 6}))
        .with_override("eval_spec", json!({"throttle_secs": 0}))
        .with_override("embedding", json!({"vocabulary_size": 128}))
        .with_override(
            "hook",
            json!({"stop_if_no_increase": {
                "min_steps": 1000,
                "run_every_secs": 0,
                "max_steps_without_increase": 1000
            }}),
        )
}

#[test]
fn end_to_end_run() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = train_model(request(dir.path()).build()).unwrap();

    assert_eq!(outcome.identity, "PerceptronCrf-2-None-0.5-6-1000");
    assert_eq!(outcome.training.global_step, 6);
    assert!(!outcome.training.stopped_early);
    assert!(outcome.training.evaluation.get("f1").is_some());

    // Persisted configuration: overrides applied, 4-space indent.
    let params_text = fs::read_to_string(&outcome.params_file).unwrap();
    assert!(params_text.contains("\n    \"batch_size\": 2,"));
    let params: Value = serde_json::from_str(&params_text).unwrap();
    assert_eq!(params["train_spec"], json!({"max_steps": 6}));
    assert_eq!(params["dim"], json!(300));

    // Run directories keyed by identity.
    let results = dir.path().join("results");
    assert_eq!(
        outcome.run_dirs.model_dir,
        results.join("model_dir").join(&outcome.identity)
    );
    assert!(outcome.run_dirs.model_dir.join("checkpoint.json").is_file());
    assert!(outcome.run_dirs.model_dir.join("eval/metrics.jsonl").is_file());

    // One line per token plus a blank line per sentence.
    let train_preds = fs::read_to_string(&outcome.predictions["train"]).unwrap();
    assert_eq!(train_preds.lines().count(), 9 + 3);
    assert!(train_preds.starts_with("Tom B-PER "));
    let test_preds = fs::read_to_string(results.join("preds_test.txt")).unwrap();
    assert_eq!(test_preds.lines().filter(|l| l.is_empty()).count(), 1);

    let servable = Servable::load(&outcome.export).unwrap();
    assert_eq!(servable.signature().global_step, 6);
    let tags = servable
        .predict(&[vec!["Tom".into(), "left".into(), "Paris".into()]], &[3])
        .unwrap();
    assert_eq!(tags[0].len(), 3);
}

#[test]
fn second_export_of_same_version_fails() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = train_model(request(dir.path()).build()).unwrap();
    let signature = outcome.export.join("signature.json");
    let before = fs::read_to_string(&signature).unwrap();

    let version: u64 = outcome
        .export
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.parse().ok())
        .unwrap();
    let result = export_servable_versioned(
        &outcome.run_dirs.model_dir,
        &outcome.run_dirs.saved_model_dir,
        &FeatureContract::standard(),
        version,
    );

    assert!(matches!(result, Err(TrainError::Export(_))));
    assert_eq!(fs::read_to_string(&signature).unwrap(), before);
}

#[test]
fn explicit_model_names_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let tags = vec!["O", "B-PER", "I-PER", "B-LOC", "I-LOC"]
        .into_iter()
        .map(String::from)
        .collect();
    let tagger = PerceptronTagger::with_shape(tags, 128, 0.1, 0.0)
        .unwrap()
        .with_name("Tiny");

    let outcome = train_model(
        request(dir.path())
            .with_override("optimizer_params", json!({"learning_rate": 0.1}))
            .model(Box::new(tagger))
            .build(),
    )
    .unwrap();

    assert_eq!(outcome.identity, "Tiny-2-0.1-0.5-6-1000");
    assert!(outcome.export.starts_with(
        dir.path().join("results/saved_model/Tiny-2-0.1-0.5-6-1000")
    ));
}

#[test]
fn unwritable_result_dir_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("results");
    fs::write(&blocker, b"").unwrap();
    let data = dir.path().join("data");
    write_data(&data);

    let result = train_model(TrainRequest::builder(&data, &blocker).build());
    assert!(matches!(result, Err(TrainError::ConfigWrite { .. })));
}
