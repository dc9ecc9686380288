//! Queue-pair abstraction the RDMA workloads are written against.
//!
//! A [`Device`] opens [`QueuePair`]s, each owning one registered buffer and
//! one completion queue. Endpoints describe themselves to the peer with a
//! [`QpInfo`], which travels over the control connection before the pair is
//! connected.

use std::time::Duration;

use crate::error::Result;

pub use self::{
    config::{Config, QpType, GRH_SIZE},
    qp_info::{QpInfo, QP_INFO_SIZE},
    send::{Opcode, WorkRequest},
    soft::SoftFabric,
    work_completion::{WcOpcode, WcStatus, WorkCompletion},
};

pub mod config;
pub mod qp_info;
pub mod send;
pub mod soft;
pub mod work_completion;

#[cfg(feature = "verbs")]
mod memory_region;
#[cfg(feature = "verbs")]
pub mod verbs;

/// A provider of queue pairs.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, config: &Config) -> Result<Box<dyn QueuePair>>;
}

pub trait QueuePair: Send {
    fn qp_type(&self) -> QpType;

    /// This endpoint and its registered buffer, as the peer needs to see it.
    fn local_info(&self) -> QpInfo;

    fn connect(&mut self, remote: &QpInfo) -> Result<()>;

    fn post_send(&mut self, wr: &WorkRequest) -> Result<()>;

    /// Posts a receive into `len` bytes of the buffer starting at `offset`.
    fn post_recv(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<()>;

    /// Appends at most `max` completions and returns how many were added.
    fn poll(&mut self, completions: &mut Vec<WorkCompletion>, max: usize) -> Result<usize>;

    /// Blocks until a completion may be available or `timeout` passes.
    /// Returns whether something arrived.
    fn wait_completion(&mut self, timeout: Duration) -> Result<bool>;

    fn write_local(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    fn read_local(&self, offset: usize, out: &mut [u8]) -> Result<()>;

    fn buffer_len(&self) -> usize;

    /// Largest payload a single datagram may carry.
    fn mtu(&self) -> u32;
}

pub(crate) fn check_range(what: &'static str, offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(crate::error::Error::Internal(format!(
            "{what}: {len} bytes at offset {offset} exceed the {size} byte buffer"
        ))),
    }
}
