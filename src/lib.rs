//! kube-fledged: a controller that pre-caches container images on cluster
//! nodes.
//!
//! Operators declare the desired set of (image, node selector) pairs as
//! `ImageCache` custom resources; the controller converges the cluster by
//! running short-lived per-(image, node) pull or purge jobs and aggregating
//! their outcomes back onto the resource status.
//!
//! The crate is organised as a two-queue pipeline:
//!
//! - the [`controller`] consumes reconciliation intents from the control
//!   queue and fans work out to the data-plane queue;
//! - the [`images`] manager consumes the data-plane queue, owns the job
//!   lifecycle and pushes one aggregated status update per pass back onto
//!   the control queue.

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod images;
pub mod store;
pub mod workqueue;

pub use crate::config::Config;
pub use crate::controller::Controller;
pub use crate::error::Error;

#[cfg(test)]
pub(crate) mod test_support;
