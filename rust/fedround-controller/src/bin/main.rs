use std::{mem, path::PathBuf, process};

use anyhow::{anyhow, Context};
use structopt::StructOpt;
use tracing_subscriber::*;

use fedround_controller::{
    checkpoint::{Checkpoint, CheckpointManager},
    settings::Settings,
    storage::FileStore,
};
use fedround_core::ExperimentId;

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Loads and validates the settings
    Check,
    /// Prints a summary of the latest checkpoint of an experiment
    Inspect {
        /// The experiment, defaults to the one of the configuration file
        #[structopt(long)]
        experiment: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let mut settings = Settings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    if let Command::Check = opt.command {
        println!("{:#?}", settings);
    }

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(mem::take(&mut settings.log.filter))
        .with_ansi(true)
        .init();

    let result = match opt.command {
        Command::Check => {
            info!("settings in {} are valid", opt.config_path.display());
            Ok(())
        }
        Command::Inspect { experiment } => inspect(&settings, experiment).await,
    };

    if let Err(err) = result {
        error!("{:#}", err);
        process::exit(1);
    }
}

async fn inspect(settings: &Settings, experiment: Option<String>) -> anyhow::Result<()> {
    let experiment_id = experiment
        .or_else(|| settings.experiment.experiment_id.clone())
        .map(ExperimentId::new)
        .ok_or_else(|| anyhow!("no experiment given and none configured"))?;

    let mut checkpoints = CheckpointManager::new(FileStore::new(&settings.checkpoint.path));
    let checkpoint = checkpoints
        .load(&experiment_id, None)
        .await
        .with_context(|| format!("failed to load the latest checkpoint of {}", experiment_id))?;

    print_summary(&checkpoint);
    Ok(())
}

fn print_summary(checkpoint: &Checkpoint) {
    println!("experiment:    {}", checkpoint.experiment_id);
    println!("researcher:    {}", checkpoint.researcher_id);
    println!("saved at:      {}", checkpoint.created_at);
    println!("round:         {}/{}", checkpoint.round_current, checkpoint.round_limit);
    println!("aggregator:    {}", checkpoint.aggregator.name());
    println!("optimizer:     {}", checkpoint.optimizer.name());
    println!("nodes:         {}", checkpoint.dataset.len());
    for record in &checkpoint.history {
        println!(
            "round {:>4}: {} participants, {} samples, completed at {}",
            record.round_number,
            record.participants.len(),
            record.sample_count(),
            record.completed_at,
        );
        for (node, reply) in &record.participants {
            println!("    {:<24} {:>8} samples", node, reply.sample_count);
        }
    }
}
