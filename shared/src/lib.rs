//! Engine of the qpbench network benchmark.
//!
//! A client and a server negotiate a [`message::Request`], run one
//! [`backend::Workload`] inside a timed test window and swap the
//! [`message::NodeStat`] counters each side kept. The [`stats`] module
//! reduces those into the reported figures.

pub mod atomic_extension;
pub mod backend;
pub mod client;
pub mod codec;
pub mod cpu;
pub mod error;
pub mod message;
pub mod param;
pub mod rdma_controller;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
