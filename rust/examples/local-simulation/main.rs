//! Trains a linear regression over in-process nodes.
//!
//! ```text
//! RUST_LOG=info cargo run --example local-simulation -- --nodes 5 --rounds 10 --secure
//! ```

use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use structopt::StructOpt;
use tracing::{error_span, info};
use tracing_futures::Instrument;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fedround_controller::{
    experiment::ExperimentBuilder,
    secagg::SecureAggregation,
    state_machine::replies::ReplyReceiver,
    transport::LocalTransport,
};
use fedround_core::{mask::MaskConfig, message::TrainingArgs, model::Parameters, NodeId};

mod node;

use node::{Directory, Node, TAG};

#[derive(Debug, StructOpt)]
#[structopt(name = "local-simulation")]
struct Opt {
    /// The number of nodes
    #[structopt(long, default_value = "3")]
    nodes: usize,

    /// The number of rounds
    #[structopt(long, default_value = "5")]
    rounds: u64,

    /// The number of local updates per round
    #[structopt(long, default_value = "10")]
    updates: u64,

    /// The local learning rate
    #[structopt(long, default_value = "0.1")]
    learning_rate: f64,

    /// Mask the parameters of the nodes
    #[structopt(long)]
    secure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .init();

    let opt = Opt::from_args();

    let nodes: Vec<(NodeId, Arc<Node>)> = (0..opt.nodes)
        .map(|i| {
            let node_id = NodeId::new(format!("node-{}", i));
            let node = Node::new(node_id.clone(), 50 * (i + 1));
            (node_id, node)
        })
        .collect();

    let (replies, reply_tx) = ReplyReceiver::new();
    let transport = nodes
        .iter()
        .fold(LocalTransport::new(reply_tx), |transport, (node_id, node)| {
            transport.with_node(node_id.clone(), node.clone())
        });

    let (mut experiment, events, _canceller) =
        ExperimentBuilder::new("researcher-0", Arc::new(Directory::new(&nodes)))
            .with_experiment_id("local-simulation")
            .with_transport(Arc::new(transport), replies)
            .with_tags(vec![TAG])
            .with_initial_params(Parameters::from_layers(vec![
                ("weight", vec![0.0]),
                ("bias", vec![0.0]),
            ]))
            .with_training_args(TrainingArgs {
                num_updates: Some(opt.updates),
                learning_rate: Some(opt.learning_rate),
                ..TrainingArgs::default()
            })
            .with_secure_aggregation(SecureAggregation::new(
                opt.secure,
                MaskConfig::default(),
                Duration::from_secs(5),
            )?)
            .with_round_limit(opt.rounds)
            .with_round_timeout(Duration::from_secs(10))
            .build()
            .await?;

    let mut phases = events.phase_listener();
    tokio::spawn(
        async move {
            while let Some(event) = phases.changed().await {
                info!("round {}: {}", event.round_id, event.event);
            }
        }
        .instrument(error_span!("events")),
    );

    let report = experiment.run(opt.rounds, false).await;
    if let Some(failure) = report.failure {
        return Err(anyhow!("the experiment stopped early: {}", failure));
    }

    for record in experiment.history() {
        let losses: Vec<f64> = record
            .participants
            .values()
            .filter_map(|summary| summary.metrics.get("loss").copied())
            .collect();
        info!(
            "round {}: {} samples from {} nodes, mean loss {:.4}",
            record.round_number,
            record.sample_count(),
            record.participants.len(),
            losses.iter().sum::<f64>() / losses.len().max(1) as f64,
        );
    }
    let global = experiment.global_params();
    info!(
        "fitted weight {:?} and bias {:?}, expected 2 and -1",
        global.layer("weight"),
        global.layer("bias"),
    );
    Ok(())
}
