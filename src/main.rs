#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{CommandFactory, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use readmit::data::{DEFAULT_TARGET_COLUMN, load_feature_table};
use readmit::infer::ReadmissionModel;
use readmit::ingest::clean_export;
use readmit::serve;
use readmit::threshold::ThresholdPolicy;
use readmit::train::{TrainConfig, run_training};

#[derive(Parser)]
#[command(
    name = "readmit",
    about = "Hospital readmission risk model training and serving",
    long_about = "Trains candidate classifiers on labeled hospital encounter data, selects a \
                 decision threshold under a recall floor, and publishes or serves the winning \
                 model bundle."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean a raw encounter export and derive readmission labels
    #[command(about = "Clean a raw export (outputs: labeled training CSV)")]
    Ingest {
        /// Path to the raw diabetes encounter CSV
        #[arg(value_name = "RAW_CSV")]
        input: PathBuf,

        /// Where to write the cleaned, labeled CSV
        #[arg(long, default_value = "encounters_clean.csv")]
        output: PathBuf,
    },

    /// Cross-validate the candidate models and publish the best bundle
    #[command(about = "Train and publish a model (outputs: model.toml + sidecars + reports)")]
    Train {
        /// Path to the labeled training CSV
        #[arg(value_name = "TRAINING_CSV")]
        data: PathBuf,

        /// Directory for the published artifacts
        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,

        /// Label column to train against
        #[arg(long, default_value = DEFAULT_TARGET_COLUMN)]
        target: String,

        /// Number of stratified cross-validation folds
        #[arg(long, default_value = "5")]
        folds: usize,

        /// Seed for fold shuffling and the forest candidate
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Retained values per categorical column before pooling into Other
        #[arg(long, default_value = "30")]
        top_k: usize,

        /// Minimum acceptable recall at the published threshold
        #[arg(long, default_value = "0.70")]
        recall_floor: f64,

        /// Lowest threshold on the selection grid
        #[arg(long, default_value = "0.05")]
        grid_start: f64,

        /// Highest threshold on the selection grid
        #[arg(long, default_value = "0.95")]
        grid_end: f64,

        /// Spacing between grid thresholds
        #[arg(long, default_value = "0.01")]
        grid_step: f64,
    },

    /// Score an encounter CSV with a published bundle
    #[command(about = "Batch-score encounters (outputs: predictions.csv)")]
    Predict {
        /// Path to the encounter CSV to score
        #[arg(value_name = "ENCOUNTER_CSV")]
        data: PathBuf,

        /// Directory holding the published artifacts
        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,

        /// Where to write the scored rows
        #[arg(long, default_value = "predictions.csv")]
        output: PathBuf,
    },

    /// Serve the published bundle over HTTP
    #[command(about = "Serve /health and /predict from a published bundle")]
    Serve {
        /// Directory holding the published artifacts
        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8000")]
        address: SocketAddr,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Ingest { input, output }) => run_ingest(input, output),
        Some(Commands::Train {
            data,
            artifact_dir,
            target,
            folds,
            seed,
            top_k,
            recall_floor,
            grid_start,
            grid_end,
            grid_step,
        }) => run_train(
            data,
            artifact_dir,
            target,
            folds,
            seed,
            top_k,
            ThresholdPolicy {
                recall_floor,
                grid_start,
                grid_end,
                grid_step,
            },
        ),
        Some(Commands::Predict {
            data,
            artifact_dir,
            output,
        }) => run_predict(data, artifact_dir, output),
        Some(Commands::Serve {
            artifact_dir,
            address,
        }) => run_serve(artifact_dir, address),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_ingest(input: PathBuf, output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    clean_export(&input, &output)?;
    Ok(())
}

fn run_train(
    data: PathBuf,
    artifact_dir: PathBuf,
    target: String,
    folds: usize,
    seed: u64,
    top_k: usize,
    policy: ThresholdPolicy,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = TrainConfig::new(data, artifact_dir);
    config.target_column = target;
    config.folds = folds;
    config.seed = seed;
    config.top_k = top_k;
    config.policy = policy;
    run_training(&config)?;
    Ok(())
}

fn run_predict(
    data: PathBuf,
    artifact_dir: PathBuf,
    output: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let model = ReadmissionModel::load(&artifact_dir)?;
    let table = load_feature_table(&data)?;
    let predictions = model.score_table(&table)?;

    let mut writer = csv::Writer::from_path(&output)?;
    writer.write_record(["probability", "label"])?;
    for prediction in &predictions {
        writer.write_record([
            prediction.probability.to_string(),
            prediction.label.to_string(),
        ])?;
    }
    writer.flush()?;

    let flagged = predictions.iter().filter(|p| p.label == 1).count();
    println!(
        "Scored {} encounters with '{}' -> {} ({} flagged at threshold {:.2})",
        predictions.len(),
        model.model_name(),
        output.display(),
        flagged,
        model.threshold()
    );
    Ok(())
}

fn run_serve(
    artifact_dir: PathBuf,
    address: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve::run(&artifact_dir, address))?;
    Ok(())
}
