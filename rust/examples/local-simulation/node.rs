use std::{collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fedround_controller::{
    dataset::{Catalog, CatalogError, CatalogQuery, DatasetMetadata},
    transport::NodeHandler,
};
use fedround_core::{
    crypto::ExchangeKeyPair,
    message::{
        AuxVars,
        Metrics,
        NodeError,
        NodeErrorKind,
        Reply,
        ReplyParams,
        Request,
        SecaggSetupReply,
        SecaggSetupRequest,
        Timing,
        TrainingArgs,
        WorkReply,
        WorkRequest,
    },
    model::Parameters,
    NodeId,
    StateLedger,
};

pub const TAG: &str = "regression";

/// A node fitting `y = weight * x + bias` on samples drawn around a common line.
pub struct Node {
    node_id: NodeId,
    samples: Vec<(f64, f64)>,
    ledger: Mutex<StateLedger>,
    /// The key pair of every secure aggregation session the node joined.
    sessions: Mutex<BTreeMap<String, ExchangeKeyPair>>,
}

impl Node {
    pub fn new(node_id: NodeId, sample_count: usize) -> Arc<Self> {
        let mut rng = rand::thread_rng();
        let samples = (0..sample_count)
            .map(|_| {
                let x: f64 = rng.gen_range(-1.0..1.0);
                let noise: f64 = rng.gen_range(-0.1..0.1);
                (x, 2.0 * x - 1.0 + noise)
            })
            .collect();
        Arc::new(Self {
            node_id,
            samples,
            ledger: Mutex::new(StateLedger::new()),
            sessions: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn metadata(&self) -> DatasetMetadata {
        DatasetMetadata {
            dataset_id: format!("{}-line", self.node_id),
            tags: vec![TAG.to_string()],
            sample_count: self.samples.len() as u64,
            data_type: "csv".into(),
            shape: vec![self.samples.len(), 2],
            dtypes: vec!["float64".into(), "float64".into()],
        }
    }

    /// The mean squared error of the line on the samples of the node.
    fn loss(&self, params: &Parameters) -> Option<f64> {
        let weight = *params.layer("weight")?.first()?;
        let bias = *params.layer("bias")?.first()?;
        let n = self.samples.len().max(1) as f64;
        Some(
            self.samples
                .iter()
                .map(|(x, y)| (weight * x + bias - y).powi(2))
                .sum::<f64>()
                / n,
        )
    }

    fn fit(&self, params: &Parameters, args: &TrainingArgs) -> Option<Parameters> {
        let mut weight = *params.layer("weight")?.first()?;
        let mut bias = *params.layer("bias")?.first()?;
        let lr = args.learning_rate.unwrap_or(0.1);
        let steps = args.num_updates.or(args.epochs).unwrap_or(1);
        let n = self.samples.len().max(1) as f64;
        for _ in 0..steps {
            let (grad_weight, grad_bias) =
                self.samples
                    .iter()
                    .fold((0.0, 0.0), |(grad_weight, grad_bias), (x, y)| {
                        let error = weight * x + bias - y;
                        (grad_weight + error * x, grad_bias + error)
                    });
            weight -= lr * 2.0 * grad_weight / n;
            bias -= lr * 2.0 * grad_bias / n;
        }
        Some(Parameters::from_layers(vec![
            ("weight", vec![weight]),
            ("bias", vec![bias]),
        ]))
    }

    async fn train(&self, request: WorkRequest) -> WorkReply {
        if let Err(mismatch) = self.ledger.lock().await.check(request.state_id) {
            warn!("{}: {}", self.node_id, mismatch);
            return WorkReply::failure(
                &request,
                NodeError {
                    kind: NodeErrorKind::StateMismatch,
                    message: mismatch.to_string(),
                },
            );
        }

        let started = Instant::now();
        let params = match self.fit(&request.params, &request.training_args) {
            Some(params) => params,
            None => return WorkReply::failure(&request, training_error("unexpected model layout")),
        };
        let elapsed = started.elapsed().as_secs_f64();
        let sample_count = self.samples.len() as u64;
        let metrics: Metrics = self
            .loss(&params)
            .map(|loss| ("loss".to_string(), loss))
            .into_iter()
            .collect();

        let params = match &request.secagg {
            Some(args) => {
                let keys = match self.sessions.lock().await.get(&args.session_id) {
                    Some(keys) => keys.clone(),
                    None => {
                        return WorkReply::failure(
                            &request,
                            training_error(format!("unknown session {}", args.session_id)),
                        )
                    }
                };
                match args.mask(&self.node_id, &keys, sample_count, &params.flatten()) {
                    Ok(masked) => ReplyParams::Masked(masked),
                    Err(error) => return WorkReply::failure(&request, training_error(error)),
                }
            }
            None => ReplyParams::Plain(params),
        };

        let next = self.ledger.lock().await.record(request.state_id);
        debug!("{} trained round {}, now at state {:?}", self.node_id, request.round_number, next);
        WorkReply::success(
            &request,
            params,
            sample_count,
            AuxVars::new(),
            Timing {
                rtime_training: elapsed,
                ptime_training: elapsed,
            },
        )
        .with_metrics(metrics)
    }

    async fn join(&self, request: SecaggSetupRequest) -> SecaggSetupReply {
        let keys = ExchangeKeyPair::generate();
        let public_key = keys.public;
        self.sessions
            .lock()
            .await
            .insert(request.session_id.clone(), keys);
        debug!("{} joined session {}", self.node_id, request.session_id);
        SecaggSetupReply::ack(&request, public_key)
    }
}

fn training_error(message: impl ToString) -> NodeError {
    NodeError {
        kind: NodeErrorKind::Training,
        message: message.to_string(),
    }
}

#[async_trait]
impl NodeHandler for Node {
    async fn handle(&self, request: Request) -> Option<Reply> {
        let reply = match request {
            Request::Train(request) => Reply::Train(self.train(request).await),
            Request::SecaggSetup(request) => Reply::SecaggSetup(self.join(request).await),
        };
        Some(reply)
    }
}

/// A catalog answering from the metadata of the in-process nodes.
pub struct Directory {
    datasets: BTreeMap<NodeId, DatasetMetadata>,
}

impl Directory {
    pub fn new(nodes: &[(NodeId, Arc<Node>)]) -> Self {
        Self {
            datasets: nodes
                .iter()
                .map(|(node_id, node)| (node_id.clone(), node.metadata()))
                .collect(),
        }
    }
}

#[async_trait]
impl Catalog for Directory {
    async fn list_datasets(
        &self,
        query: &CatalogQuery,
    ) -> Result<BTreeMap<NodeId, Vec<DatasetMetadata>>, CatalogError> {
        Ok(self
            .datasets
            .iter()
            .filter(|(node_id, _)| query.nodes.as_ref().map_or(true, |nodes| nodes.contains(*node_id)))
            .filter(|(_, metadata)| query.tags.iter().all(|tag| metadata.tags.contains(tag)))
            .map(|(node_id, metadata)| (node_id.clone(), vec![metadata.clone()]))
            .collect())
    }
}
