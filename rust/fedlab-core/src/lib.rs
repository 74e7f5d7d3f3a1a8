#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedlab core
//!
//! Types shared by the researcher (the coordinator of a federated experiment) and the nodes
//! (the participants holding the data):
//!
//! - [`common`]: identifiers, dataset descriptors and timing records.
//! - [`model`]: parameter sets, i.e. named numeric tensors with elementwise arithmetic.
//! - [`args`]: the training argument bag and its validation.
//! - [`message`]: the shapes of every message exchanged between researcher and nodes.
//! - [`channel`]: the message channel seam and an in-process loopback bus.
//! - [`exchange`]: the artifact exchange seam and a filesystem backed implementation.
//! - [`settings`]: settings sections shared by both services.

pub mod args;
pub mod channel;
pub mod common;
pub mod exchange;
pub mod message;
pub mod model;
pub mod settings;

pub use self::{
    common::{DataType, DatasetDescriptor, JobId, NodeId, PlanKind, ResearcherId, Timing},
    model::{ModelError, Params, Tensor},
};

/// A bag of free-form arguments, as sent over the wire.
pub type ArgBag = serde_json::Map<String, serde_json::Value>;
