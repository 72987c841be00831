#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedround controller
//!
//! The controller of a round based federated learning experiment.
//!
//! A federated experiment trains a model on data that never leaves the nodes holding it. The
//! controller resolves which node trains on which dataset, and then drives the training in
//! rounds: it selects the participants of a round, sends each of them a work request with the
//! current global parameters, waits for all of their replies and aggregates the returned
//! parameters into the next global parameters.
//!
//! ## Overview
//!
//! - [`dataset`]: resolution of the [`FederatedDataset`] from a catalog of the node datasets.
//! - [`selection`]: selection of the participants of every round.
//! - [`state_machine`]: the state machine driving a single round.
//! - [`aggregation`]: the aggregators combining the results of a round.
//! - [`node_state`]: the state kept per node across rounds.
//! - [`secagg`]: secure aggregation, in which the controller only ever learns the sum of the
//!   masked results.
//! - [`checkpoint`] and [`storage`]: durable checkpoints of an experiment.
//! - [`experiment`]: the [`Experiment`] tying everything together.
//! - [`transport`]: the interface to the nodes.
//!
//! ## Rounds are all or nothing
//!
//! A round completes only if every participant replied successfully. A missing reply, a failure
//! reported by a node or an invalid reply fails the round, and a failed round leaves the
//! experiment exactly as it was after the last completed round.
//!
//! [`FederatedDataset`]: crate::dataset::FederatedDataset
//! [`Experiment`]: crate::experiment::Experiment

#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

pub mod aggregation;
pub mod checkpoint;
pub mod dataset;
pub mod experiment;
pub mod node_state;
pub mod secagg;
pub mod selection;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod transport;
