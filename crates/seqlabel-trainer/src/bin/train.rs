//! Train the reference tagger on a CoNLL data directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use seqlabel_trainer::config::{load_overrides, parse_overrides};
use seqlabel_trainer::pipeline::{reference_model, train_model, TrainRequest};

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train, evaluate and export a sequence labeling model")]
#[command(version)]
struct Cli {
    /// Directory holding train.conllz, test.conllz and tags.txt
    #[arg(short, long, env = "SEQLABEL_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Directory receiving params.json, checkpoints, predictions and exports
    #[arg(short, long, env = "SEQLABEL_RESULT_DIR", default_value = "results")]
    result_dir: PathBuf,

    /// Name used in the run identity
    #[arg(short, long)]
    model_name: Option<String>,

    /// Top-level override `key=<json>`, repeatable
    #[arg(short, long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// JSON file with a map of top-level overrides, applied before --set
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(cli: Cli) -> Result<()> {
    let mut overrides = match &cli.params {
        Some(path) => load_overrides(path)
            .with_context(|| format!("reading overrides from {}", path.display()))?,
        None => Default::default(),
    };
    overrides.extend(parse_overrides(&cli.set).context("parsing --set overrides")?);

    let mut builder = TrainRequest::builder(&cli.data_dir, &cli.result_dir).with_overrides(overrides);
    if let Some(name) = cli.model_name {
        builder = builder.model_fn(name, reference_model);
    }

    let outcome = train_model(builder.build()).context("training failed")?;

    info!(
        identity = %outcome.identity,
        step = outcome.training.global_step,
        stopped_early = outcome.training.stopped_early,
        "{}",
        outcome.training.evaluation
    );
    for (split, path) in &outcome.predictions {
        info!(split = %split, path = %path.display(), "predictions");
    }
    info!(path = %outcome.export.display(), "servable");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(e) = run(cli) {
        eprintln!("Training failed: {e:#}");
        std::process::exit(1);
    }
}
