//! Queue pairs emulated in memory, for running the RDMA workloads between
//! two sessions of the same process.
//!
//! Every endpoint owns a buffer and a completion channel. Two-sided
//! operations land in the peer's posted receives; a reliable endpoint keeps
//! sends that found no receive until one is posted, the unreliable types
//! drop them. One-sided operations copy directly into or out of the peer's
//! buffer after checking its key and bounds.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};

use super::{
    check_range, Config, Device, Opcode, QpInfo, QpType, QueuePair, WcOpcode, WorkCompletion,
    WorkRequest,
};

const ATOMIC_SIZE: usize = 8;
const FIRST_QPN: u32 = 0x100;
const QKEY: u32 = 0x1111_1111;

/// An in-process fabric. Clones share the same set of endpoints.
#[derive(Clone, Default)]
pub struct SoftFabric {
    inner: Arc<Fabric>,
}

#[derive(Default)]
struct Fabric {
    endpoints: RwLock<HashMap<u32, Arc<Endpoint>>>,
    next_qpn: AtomicU32,
}

struct Endpoint {
    qpn: u32,
    qp_type: QpType,
    rkey: u32,
    vaddr: u64,
    memory: Mutex<Vec<u8>>,
    receives: Mutex<Receives>,
    cq: Sender<WorkCompletion>,
}

#[derive(Default)]
struct Receives {
    posted: VecDeque<PostedRecv>,
    backlog: VecDeque<Inbound>,
}

struct PostedRecv {
    wr_id: u64,
    offset: usize,
    len: usize,
}

struct Inbound {
    data: Vec<u8>,
    immediate: bool,
    origin: Origin,
}

/// The sender's completion, held back until the message lands.
type Origin = Option<(Arc<Endpoint>, WorkCompletion)>;

impl SoftFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, qpn: u32) -> Option<Arc<Endpoint>> {
        self.inner.endpoints.read().get(&qpn).cloned()
    }
}

impl Device for SoftFabric {
    fn name(&self) -> &str {
        "soft"
    }

    fn open(&self, config: &Config) -> Result<Box<dyn QueuePair>> {
        let qpn = FIRST_QPN + self.inner.next_qpn.fetch_add(1, Ordering::Relaxed);
        let (cq, completions) = unbounded();
        let endpoint = Arc::new(Endpoint {
            qpn,
            qp_type: config.qp_type,
            rkey: rand::random(),
            vaddr: u64::from(qpn) << 32,
            memory: Mutex::new(vec![0; config.buffer_size]),
            receives: Mutex::new(Receives::default()),
            cq,
        });
        self.inner.endpoints.write().insert(qpn, endpoint.clone());
        debug!("opened soft {} queue pair {qpn}", config.qp_type.name());

        Ok(Box::new(SoftQp {
            fabric: self.clone(),
            endpoint,
            completions,
            ready: VecDeque::new(),
            peer: None,
            psn: rand::random::<u32>() & 0xff_ffff,
            mtu: config.mtu,
        }))
    }
}

pub struct SoftQp {
    fabric: SoftFabric,
    endpoint: Arc<Endpoint>,
    completions: Receiver<WorkCompletion>,
    ready: VecDeque<WorkCompletion>,
    peer: Option<Arc<Endpoint>>,
    psn: u32,
    mtu: u32,
}

impl Endpoint {
    fn complete(&self, wc: WorkCompletion) {
        // the receiving half lives as long as the queue pair
        let _ = self.cq.send(wc);
    }

    /// Hands a two-sided message to this endpoint. A reliable endpoint
    /// with no receive posted holds the message, and the sender's
    /// completion with it, until one is.
    fn deliver(&self, data: Vec<u8>, immediate: bool, origin: Origin) {
        let mut receives = self.receives.lock();
        match receives.posted.pop_front() {
            Some(recv) => self.land(recv, &data, immediate),
            None if self.qp_type == QpType::Rc => {
                receives.backlog.push_back(Inbound {
                    data,
                    immediate,
                    origin,
                });
                return;
            }
            None => {}
        }
        drop(receives);
        complete_origin(origin);
    }

    fn land(&self, recv: PostedRecv, data: &[u8], immediate: bool) {
        let opcode = if immediate {
            WcOpcode::RecvImm
        } else {
            WcOpcode::Recv
        };
        // a write with immediate already placed its payload
        let payload = if immediate { &[][..] } else { data };
        let overhead = self.qp_type.recv_overhead();

        if payload.len() + overhead > recv.len {
            self.complete(WorkCompletion::failed(recv.wr_id, opcode, "local length error"));
            return;
        }

        let start = recv.offset + overhead;
        self.memory.lock()[start..start + payload.len()].copy_from_slice(payload);
        self.complete(WorkCompletion::success(
            recv.wr_id,
            opcode,
            data.len() + overhead,
        ));
    }

    /// Offset of `[addr, addr + len)` inside this endpoint's buffer.
    fn resolve(&self, addr: u64, len: usize, rkey: u32, size: usize) -> Option<usize> {
        if rkey != self.rkey {
            return None;
        }
        let offset = usize::try_from(addr.checked_sub(self.vaddr)?).ok()?;
        (offset.checked_add(len)? <= size).then_some(offset)
    }
}

fn complete_origin(origin: Origin) {
    if let Some((sender, wc)) = origin {
        sender.complete(wc);
    }
}

impl SoftQp {
    fn peer(&self) -> Result<Arc<Endpoint>> {
        self.peer
            .clone()
            .ok_or_else(|| Error::Rdma(format!("queue pair {} is not connected", self.endpoint.qpn)))
    }

    fn copy_out(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let memory = self.endpoint.memory.lock();
        check_range("send", offset, len, memory.len())?;
        Ok(memory[offset..offset + len].to_vec())
    }

    /// Performs a one-sided operation. Returns `None` when the completion
    /// was handed to the target to report once it lands.
    fn one_sided(&self, peer: &Endpoint, wr: &WorkRequest) -> Result<Option<WorkCompletion>> {
        let opcode = match wr.opcode {
            Opcode::Send => WcOpcode::Send,
            Opcode::Write | Opcode::WriteImm(_) => WcOpcode::Write,
            Opcode::Read => WcOpcode::Read,
            Opcode::CompareSwap { .. } => WcOpcode::CompareSwap,
            Opcode::FetchAdd(_) => WcOpcode::FetchAdd,
        };
        let denied = || WorkCompletion::failed(wr.wr_id, opcode, "remote access error");

        match wr.opcode {
            Opcode::Write | Opcode::WriteImm(_) => {
                let data = self.copy_out(wr.offset, wr.len)?;
                {
                    let mut memory = peer.memory.lock();
                    let size = memory.len();
                    let Some(at) = peer.resolve(wr.remote_addr, wr.len, wr.rkey, size) else {
                        return Ok(Some(denied()));
                    };
                    memory[at..at + wr.len].copy_from_slice(&data);
                }
                if matches!(wr.opcode, Opcode::WriteImm(_)) {
                    let wc = WorkCompletion::success(wr.wr_id, opcode, wr.len);
                    peer.deliver(data, true, self.origin(wr, wc));
                    return Ok(None);
                }
            }
            Opcode::Read => {
                let data = {
                    let memory = peer.memory.lock();
                    let Some(at) = peer.resolve(wr.remote_addr, wr.len, wr.rkey, memory.len())
                    else {
                        return Ok(Some(denied()));
                    };
                    memory[at..at + wr.len].to_vec()
                };
                self.write_local_bytes(wr.offset, &data)?;
            }
            Opcode::CompareSwap { .. } | Opcode::FetchAdd(_) => {
                if wr.len != ATOMIC_SIZE || wr.remote_addr % ATOMIC_SIZE as u64 != 0 {
                    return Ok(Some(denied()));
                }
                let old = {
                    let mut memory = peer.memory.lock();
                    let size = memory.len();
                    let Some(at) = peer.resolve(wr.remote_addr, ATOMIC_SIZE, wr.rkey, size)
                    else {
                        return Ok(Some(denied()));
                    };
                    let target = &mut memory[at..at + ATOMIC_SIZE];
                    let old = u64::read_from(&*target).unwrap_or_default();
                    let new = match wr.opcode {
                        Opcode::CompareSwap { compare, swap } if old == compare => swap,
                        Opcode::FetchAdd(add) => old.wrapping_add(add),
                        _ => old,
                    };
                    target.copy_from_slice(new.as_bytes());
                    old
                };
                self.write_local_bytes(wr.offset, old.as_bytes())?;
            }
            Opcode::Send => {
                return Err(Error::Internal("send routed as a one-sided operation".into()))
            }
        }

        Ok(Some(WorkCompletion::success(wr.wr_id, opcode, wr.len)))
    }

    fn origin(&self, wr: &WorkRequest, wc: WorkCompletion) -> Origin {
        wr.signaled.then(|| (self.endpoint.clone(), wc))
    }

    fn write_local_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut memory = self.endpoint.memory.lock();
        check_range("local write", offset, data.len(), memory.len())?;
        memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl QueuePair for SoftQp {
    fn qp_type(&self) -> QpType {
        self.endpoint.qp_type
    }

    fn local_info(&self) -> QpInfo {
        QpInfo {
            qpn: self.endpoint.qpn,
            psn: self.psn,
            qkey: QKEY,
            rkey: self.endpoint.rkey,
            vaddr: self.endpoint.vaddr,
            ..Default::default()
        }
    }

    fn connect(&mut self, remote: &QpInfo) -> Result<()> {
        let peer = self
            .fabric
            .lookup(remote.qpn)
            .ok_or_else(|| Error::Rdma(format!("no queue pair {} on the fabric", remote.qpn)))?;
        if peer.qp_type != self.endpoint.qp_type {
            return Err(Error::Rdma(format!(
                "cannot connect {} queue pair to {} queue pair",
                self.endpoint.qp_type.name(),
                peer.qp_type.name()
            )));
        }
        debug!("soft queue pair {} connected to {}", self.endpoint.qpn, peer.qpn);
        self.peer = Some(peer);
        Ok(())
    }

    fn post_send(&mut self, wr: &WorkRequest) -> Result<()> {
        let qp_type = self.endpoint.qp_type;
        let supported = match qp_type {
            QpType::Rc => true,
            QpType::Uc => !wr.opcode.is_atomic() && wr.opcode != Opcode::Read,
            QpType::Ud => !wr.opcode.is_one_sided(),
        };
        if !supported {
            return Err(Error::Unsupported(format!(
                "{:?} on {} queue pairs",
                wr.opcode,
                qp_type.name()
            )));
        }

        let peer = self.peer()?;
        let wc = if wr.opcode.is_one_sided() {
            self.one_sided(&peer, wr)?
        } else if qp_type == QpType::Ud && wr.len > self.mtu as usize {
            Some(WorkCompletion::failed(wr.wr_id, WcOpcode::Send, "message exceeds MTU"))
        } else {
            let data = self.copy_out(wr.offset, wr.len)?;
            let wc = WorkCompletion::success(wr.wr_id, WcOpcode::Send, wr.len);
            peer.deliver(data, false, self.origin(wr, wc));
            None
        };

        match wc {
            Some(wc) if wr.signaled || !wc.is_success() => self.endpoint.complete(wc),
            _ => {}
        }
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<()> {
        check_range("receive", offset, len, self.buffer_len())?;
        let recv = PostedRecv {
            wr_id,
            offset,
            len,
        };

        let mut receives = self.endpoint.receives.lock();
        match receives.backlog.pop_front() {
            Some(inbound) => {
                self.endpoint.land(recv, &inbound.data, inbound.immediate);
                drop(receives);
                complete_origin(inbound.origin);
            }
            None => receives.posted.push_back(recv),
        }
        Ok(())
    }

    fn poll(&mut self, completions: &mut Vec<WorkCompletion>, max: usize) -> Result<usize> {
        let mut polled = 0;
        while polled < max {
            let Some(wc) = self
                .ready
                .pop_front()
                .or_else(|| self.completions.try_recv().ok())
            else {
                break;
            };
            completions.push(wc);
            polled += 1;
        }
        Ok(polled)
    }

    fn wait_completion(&mut self, timeout: Duration) -> Result<bool> {
        if !self.ready.is_empty() {
            return Ok(true);
        }
        match self.completions.recv_timeout(timeout) {
            Ok(wc) => {
                self.ready.push_back(wc);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Internal(
                "completion channel closed while its queue pair is open".into(),
            )),
        }
    }

    fn write_local(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.write_local_bytes(offset, data)
    }

    fn read_local(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let memory = self.endpoint.memory.lock();
        check_range("local read", offset, out.len(), memory.len())?;
        out.copy_from_slice(&memory[offset..offset + out.len()]);
        Ok(())
    }

    fn buffer_len(&self) -> usize {
        self.endpoint.memory.lock().len()
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }
}

impl Drop for SoftQp {
    fn drop(&mut self) {
        self.fabric
            .inner
            .endpoints
            .write()
            .remove(&self.endpoint.qpn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma_controller::WcStatus;

    fn config(qp_type: QpType) -> Config {
        Config {
            device: None,
            port: 1,
            qp_type,
            buffer_size: 64,
            max_send_wr: 16,
            max_recv_wr: 16,
            rd_atomic: 4,
            mtu: 32,
            service_level: 0,
            src_path_bits: 0,
            static_rate: 0,
        }
    }

    fn connected(qp_type: QpType) -> (Box<dyn QueuePair>, Box<dyn QueuePair>) {
        let fabric = SoftFabric::new();
        let mut a = fabric.open(&config(qp_type)).unwrap();
        let mut b = fabric.open(&config(qp_type)).unwrap();
        let (ai, bi) = (a.local_info(), b.local_info());
        a.connect(&bi).unwrap();
        b.connect(&ai).unwrap();
        (a, b)
    }

    fn drain(qp: &mut dyn QueuePair) -> Vec<WorkCompletion> {
        let mut out = Vec::new();
        qp.poll(&mut out, 16).unwrap();
        out
    }

    #[test]
    fn reliable_send_waits_for_receive() {
        let (mut a, mut b) = connected(QpType::Rc);
        a.write_local(0, b"hello").unwrap();
        a.post_send(&WorkRequest::send(1, 0, 5)).unwrap();
        assert!(drain(a.as_mut()).is_empty());
        assert!(drain(b.as_mut()).is_empty());

        b.post_recv(9, 8, 16).unwrap();
        let wcs = drain(b.as_mut());
        assert_eq!(wcs, vec![WorkCompletion::success(9, WcOpcode::Recv, 5)]);
        assert_eq!(drain(a.as_mut())[0].opcode, WcOpcode::Send);
        let mut got = [0u8; 5];
        b.read_local(8, &mut got).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn datagrams_reserve_routing_header() {
        let (mut a, mut b) = connected(QpType::Ud);
        b.post_recv(1, 0, 8).unwrap();
        a.post_send(&WorkRequest::send(2, 0, 4)).unwrap();
        // too small for the header plus payload
        assert!(!drain(b.as_mut())[0].is_success());

        // larger than the 32 byte MTU
        let (mut a, mut b) = connected(QpType::Ud);
        b.post_recv(1, 0, 64).unwrap();
        assert!(a.post_send(&WorkRequest::send(3, 0, 40)).is_ok());
        assert!(!drain(a.as_mut())[0].is_success());
        assert!(drain(b.as_mut()).is_empty());
    }

    #[test]
    fn one_sided_write_is_silent_on_target() {
        let (mut a, mut b) = connected(QpType::Rc);
        let target = b.local_info();
        a.write_local(0, &[5; 8]).unwrap();
        a.post_send(&WorkRequest::remote(1, Opcode::Write, 0, 8, target.vaddr + 8, target.rkey))
            .unwrap();
        assert!(drain(a.as_mut())[0].is_success());
        assert!(drain(b.as_mut()).is_empty());

        let mut got = [0u8; 8];
        b.read_local(8, &mut got).unwrap();
        assert_eq!(got, [5; 8]);
    }

    #[test]
    fn bad_key_is_a_completion_error() {
        let (mut a, b) = connected(QpType::Rc);
        let target = b.local_info();
        a.post_send(&WorkRequest::remote(
            1,
            Opcode::Read,
            0,
            8,
            target.vaddr,
            target.rkey.wrapping_add(1),
        ))
        .unwrap();
        let wcs = drain(a.as_mut());
        assert_eq!(wcs[0].status, WcStatus::Failed("remote access error".into()));
    }

    #[test]
    fn atomics_return_previous_value() {
        let (mut a, b) = connected(QpType::Rc);
        let target = b.local_info();
        let op = |wr_id, opcode| WorkRequest::remote(wr_id, opcode, 16, 8, target.vaddr, target.rkey);

        a.post_send(&op(1, Opcode::FetchAdd(3))).unwrap();
        a.post_send(&op(2, Opcode::CompareSwap { compare: 3, swap: 10 })).unwrap();
        a.post_send(&op(3, Opcode::CompareSwap { compare: 3, swap: 20 })).unwrap();
        assert_eq!(drain(a.as_mut()).len(), 3);

        let mut old = [0u8; 8];
        a.read_local(16, &mut old).unwrap();
        assert_eq!(u64::from_ne_bytes(old), 10);

        let mut value = [0u8; 8];
        b.read_local(0, &mut value).unwrap();
        assert_eq!(u64::from_ne_bytes(value), 10);
    }

    #[test]
    fn unreliable_types_reject_reads() {
        let (mut a, _b) = connected(QpType::Uc);
        let err = a
            .post_send(&WorkRequest::remote(1, Opcode::Read, 0, 8, 0, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn event_wait_sees_completion() {
        let (mut a, mut b) = connected(QpType::Rc);
        assert!(!b.wait_completion(Duration::from_millis(10)).unwrap());
        b.post_recv(1, 0, 8).unwrap();
        a.post_send(&WorkRequest::send(1, 0, 8)).unwrap();
        assert!(b.wait_completion(Duration::from_millis(10)).unwrap());
        assert_eq!(drain(b.as_mut()).len(), 1);
    }
}
