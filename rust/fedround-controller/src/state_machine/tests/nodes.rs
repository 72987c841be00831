//! Simulated nodes, driven through the local transport.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
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
        WorkReply,
        WorkRequest,
    },
    NodeId,
    StateLedger,
};

use crate::transport::NodeHandler;

/// How a simulated node answers the training requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Behaviour {
    /// Sets every parameter to `value`.
    Constant { value: f64, sample_count: u64 },
    /// Adds `delta` to every parameter.
    Step { delta: f64, sample_count: u64 },
    /// Never replies.
    Silent,
    /// Replies with a training failure.
    Fail,
}

/// A node which trains on simulated data.
#[derive(Debug)]
pub struct SimulatedNode {
    node_id: NodeId,
    behaviour: Mutex<Behaviour>,
    /// The time the node takes to answer a training request.
    delay: Mutex<Duration>,
    ledger: Mutex<StateLedger>,
    /// The key pair the node joined every session with.
    sessions: Mutex<BTreeMap<String, ExchangeKeyPair>>,
    received: Mutex<Vec<Request>>,
}

impl SimulatedNode {
    pub fn new(node_id: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            node_id: NodeId::from(node_id),
            behaviour: Mutex::new(behaviour),
            delay: Mutex::new(Duration::from_secs(0)),
            ledger: Mutex::new(StateLedger::new()),
            sessions: Mutex::new(BTreeMap::new()),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Forgets every session the node joined.
    pub fn leave_sessions(&self) {
        self.sessions.lock().unwrap().clear();
    }

    /// Forgets every state the node produced.
    pub fn reset_ledger(&self) {
        *self.ledger.lock().unwrap() = StateLedger::new();
    }

    /// Gets the training requests received so far.
    pub fn work_requests(&self) -> Vec<WorkRequest> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|request| match request {
                Request::Train(request) => Some(request.clone()),
                Request::SecaggSetup(_) => None,
            })
            .collect()
    }

    /// Gets the number of secure aggregation setup requests received so far.
    pub fn setup_requests(&self) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|request| matches!(request, Request::SecaggSetup(_)))
            .count()
    }

    fn train(&self, request: WorkRequest, behaviour: Behaviour) -> Option<WorkReply> {
        if let Err(mismatch) = self.ledger.lock().unwrap().check(request.state_id) {
            return Some(WorkReply::failure(
                &request,
                NodeError {
                    kind: NodeErrorKind::StateMismatch,
                    message: mismatch.to_string(),
                },
            ));
        }
        let (params, sample_count) = match behaviour {
            Behaviour::Constant {
                value,
                sample_count,
            } => (request.params.map(|_| value), sample_count),
            Behaviour::Step {
                delta,
                sample_count,
            } => (request.params.map(|x| x + delta), sample_count),
            Behaviour::Silent => return None,
            Behaviour::Fail => {
                return Some(WorkReply::failure(
                    &request,
                    NodeError {
                        kind: NodeErrorKind::Training,
                        message: "simulated training failure".into(),
                    },
                ))
            }
        };
        self.ledger.lock().unwrap().record(request.state_id);

        let params = match &request.secagg {
            Some(args) => {
                let keys = match self.sessions.lock().unwrap().get(&args.session_id) {
                    Some(keys) => keys.clone(),
                    None => return Some(WorkReply::failure(&request, setup_error("unknown session"))),
                };
                match args.mask(&self.node_id, &keys, sample_count, &params.flatten()) {
                    Ok(masked) => ReplyParams::Masked(masked),
                    Err(error) => return Some(WorkReply::failure(&request, setup_error(error))),
                }
            }
            None => ReplyParams::Plain(params),
        };
        let metrics: Metrics = vec![("loss".to_string(), 1.0 / (request.round_number + 1) as f64)]
            .into_iter()
            .collect();
        Some(
            WorkReply::success(
                &request,
                params,
                sample_count,
                AuxVars::new(),
                Timing {
                    rtime_training: 0.01,
                    ptime_training: 0.01,
                },
            )
            .with_metrics(metrics),
        )
    }

    fn join(&self, request: SecaggSetupRequest) -> Option<SecaggSetupReply> {
        match *self.behaviour.lock().unwrap() {
            Behaviour::Silent => None,
            Behaviour::Fail => Some(SecaggSetupReply::refuse(
                &request,
                setup_error("simulated setup failure"),
            )),
            _ => {
                let keys = ExchangeKeyPair::generate();
                let public_key = keys.public;
                self.sessions
                    .lock()
                    .unwrap()
                    .insert(request.session_id.clone(), keys);
                Some(SecaggSetupReply::ack(&request, public_key))
            }
        }
    }
}

fn setup_error(message: impl ToString) -> NodeError {
    NodeError {
        kind: NodeErrorKind::Setup,
        message: message.to_string(),
    }
}

#[async_trait]
impl NodeHandler for SimulatedNode {
    async fn handle(&self, request: Request) -> Option<Reply> {
        self.received.lock().unwrap().push(request.clone());
        match request {
            Request::Train(request) => {
                // the node trains with the behaviour it had when the request arrived
                let behaviour = self.behaviour.lock().unwrap().clone();
                let delay = *self.delay.lock().unwrap();
                if delay > Duration::from_secs(0) {
                    tokio::time::sleep(delay).await;
                }
                self.train(request, behaviour).map(Reply::Train)
            }
            Request::SecaggSetup(request) => self.join(request).map(Reply::SecaggSetup),
        }
    }
}
