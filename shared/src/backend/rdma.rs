//! Queue-pair workloads.
//!
//! Every workload opens one queue pair on the session's device, swaps
//! [`QpInfo`] with the peer over the control connection and connects. The
//! registered buffer holds two slots: receives and incoming one-sided
//! traffic land in the first, outgoing payloads and atomic results live in
//! the second.
//!
//! One-sided workloads have a passive node that never observes the
//! traffic. It accounts nothing, and the report credits it with what the
//! active node charged to the remote counters.

use std::time::Duration;

use tracing::{debug, warn};
use zerocopy::FromBytes;

use crate::{
    error::{Error, Result},
    message::{Direction, Request},
    param::{ParamIndex as P, ParamTable},
    rdma_controller::{
        Config, Opcode, QpInfo, QpType, QueuePair, WcOpcode, WcStatus, WorkCompletion,
        WorkRequest, QP_INFO_SIZE,
    },
    session::{Role, Session},
};

use super::{apply_affinity, use_common, Backend, Workload};

const BW_SIZE: u32 = 64 * 1024;
const LAT_SIZE: u32 = 1;
const ATOMIC_SIZE: u32 = 8;
const DEFAULT_RD_ATOMIC: u32 = 4;

/// Sends and receives kept in flight by the two-sided workloads.
const TWO_SIDED_DEPTH: usize = 64;
const POLL_BATCH: usize = 16;
/// Busy-poll iterations between checks for a peer notification.
const URGENT_CHECK_SPINS: u32 = 1024;
const EVENT_SLICE: Duration = Duration::from_millis(50);

const SEND_ID: u64 = 1;
const RECV_ID: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Atomic {
    CompareSwap,
    FetchAdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Sends in one direction.
    Bw,
    /// Sends in both directions at once.
    BiBw,
    /// One send each way per round trip.
    Lat,
    WriteBw,
    /// Writes with immediate data, one each way per round trip.
    WriteLat,
    /// Plain writes; each side spins on the last byte of its receive slot.
    WritePollLat,
    ReadBw,
    ReadLat,
    /// Atomics kept in flight for message rate.
    AtomicRate(Atomic),
    /// One atomic at a time, checking every returned value.
    AtomicVerify(Atomic),
}

impl Kind {
    fn of(workload: Workload) -> (Kind, QpType) {
        use Workload::*;
        match workload {
            RcBw => (Kind::Bw, QpType::Rc),
            RcBiBw => (Kind::BiBw, QpType::Rc),
            RcLat => (Kind::Lat, QpType::Rc),
            RcRdmaWriteBw => (Kind::WriteBw, QpType::Rc),
            RcRdmaWriteLat => (Kind::WriteLat, QpType::Rc),
            RcRdmaWritePollLat => (Kind::WritePollLat, QpType::Rc),
            RcRdmaReadBw => (Kind::ReadBw, QpType::Rc),
            RcRdmaReadLat => (Kind::ReadLat, QpType::Rc),
            RcCompareSwapMr => (Kind::AtomicRate(Atomic::CompareSwap), QpType::Rc),
            RcFetchAddMr => (Kind::AtomicRate(Atomic::FetchAdd), QpType::Rc),
            VerRcCompareSwap => (Kind::AtomicVerify(Atomic::CompareSwap), QpType::Rc),
            VerRcFetchAdd => (Kind::AtomicVerify(Atomic::FetchAdd), QpType::Rc),
            UcBw => (Kind::Bw, QpType::Uc),
            UcBiBw => (Kind::BiBw, QpType::Uc),
            UcLat => (Kind::Lat, QpType::Uc),
            UcRdmaWriteBw => (Kind::WriteBw, QpType::Uc),
            UcRdmaWriteLat => (Kind::WriteLat, QpType::Uc),
            UcRdmaWritePollLat => (Kind::WritePollLat, QpType::Uc),
            UdBw => (Kind::Bw, QpType::Ud),
            UdBiBw => (Kind::BiBw, QpType::Ud),
            _ => (Kind::Lat, QpType::Ud),
        }
    }

    fn default_size(self) -> u32 {
        match self {
            Kind::Bw | Kind::BiBw | Kind::WriteBw | Kind::ReadBw => BW_SIZE,
            Kind::Lat | Kind::WriteLat | Kind::WritePollLat | Kind::ReadLat => LAT_SIZE,
            Kind::AtomicRate(_) | Kind::AtomicVerify(_) => ATOMIC_SIZE,
        }
    }

    fn is_atomic(self) -> bool {
        matches!(self, Kind::AtomicRate(_) | Kind::AtomicVerify(_))
    }

    /// Whether the workload issues reads or atomics, which the responder
    /// bounds by `rd_atomic`.
    fn uses_rd_atomic(self) -> bool {
        matches!(self, Kind::ReadBw | Kind::ReadLat) || self.is_atomic()
    }

    /// Work requests a node keeps outstanding.
    fn depth(self, rd_atomic: u32) -> usize {
        match self {
            Kind::ReadBw | Kind::AtomicRate(_) => rd_atomic.max(1) as usize,
            Kind::ReadLat | Kind::AtomicVerify(_) => 1,
            _ => TWO_SIDED_DEPTH,
        }
    }

    /// Whether this node needs receives posted before the window opens.
    fn receives(self, sender: bool) -> bool {
        match self {
            Kind::Bw => !sender,
            Kind::BiBw | Kind::Lat | Kind::WriteLat => true,
            _ => false,
        }
    }
}

struct Channel {
    qp: Box<dyn QueuePair>,
    qp_type: QpType,
    remote: QpInfo,
    msg_size: usize,
    /// Bytes per buffer slot, a multiple of 8.
    slot: usize,
    depth: usize,
    busy_poll: bool,
    wcs: Vec<WorkCompletion>,
    idle: u32,
}

impl Channel {
    fn post_recv(&mut self) -> Result<()> {
        self.qp.post_recv(RECV_ID, 0, self.slot)
    }

    fn post_send(&mut self) -> Result<()> {
        self.qp
            .post_send(&WorkRequest::send(SEND_ID, self.slot, self.msg_size))
    }

    /// Posts a one-sided operation against the start of the peer's buffer.
    fn post_remote(&mut self, opcode: Opcode, len: usize) -> Result<()> {
        self.qp.post_send(&WorkRequest::remote(
            SEND_ID,
            opcode,
            self.slot,
            len,
            self.remote.vaddr,
            self.remote.rkey,
        ))
    }

    /// Waits for the next batch of completions, leaving them in `wcs`.
    /// Returns false once the test window has closed.
    fn next_batch(&mut self, sess: &mut Session) -> Result<bool> {
        self.wcs.clear();
        loop {
            if sess.is_finished() {
                return Ok(false);
            }
            let polled = self.qp.poll(&mut self.wcs, POLL_BATCH)?;
            if polled > 0 {
                sess.stat_mut().note_cqes(polled);
                return Ok(true);
            }
            if self.busy_poll {
                self.idle = self.idle.wrapping_add(1);
                if self.idle % URGENT_CHECK_SPINS == 0 {
                    sess.poll_urgent()?;
                }
            } else {
                self.qp.wait_completion(EVENT_SLICE)?;
                sess.poll_urgent()?;
            }
        }
    }

    /// Charges one completion. A failed completion on a reliable
    /// connection leaves the queue pair unusable and ends the test.
    fn settle(
        &self,
        sess: &mut Session,
        wc: &WorkCompletion,
        direction: Direction,
        bytes: usize,
    ) -> Result<bool> {
        if wc.is_success() {
            sess.stat_mut().account(direction, bytes as u64);
            return Ok(true);
        }
        if sess.is_finished() {
            return Ok(false);
        }
        sess.stat_mut().account_error(direction);
        let status = match &wc.status {
            WcStatus::Failed(reason) => reason.clone(),
            WcStatus::Success => String::new(),
        };
        warn!("{} completion failed: {status}", op_name(wc.opcode));
        if self.qp_type == QpType::Rc {
            return Err(Error::Completion {
                op: op_name(wc.opcode),
                status,
            });
        }
        Ok(false)
    }

    fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.qp.read_local(offset, &mut raw)?;
        u64::read_from(&raw[..]).ok_or_else(|| Error::Internal("short atomic result".into()))
    }
}

fn op_name(opcode: WcOpcode) -> &'static str {
    match opcode {
        WcOpcode::Send => "send",
        WcOpcode::Write => "RDMA write",
        WcOpcode::Read => "RDMA read",
        WcOpcode::CompareSwap => "compare and swap",
        WcOpcode::FetchAdd => "fetch and add",
        WcOpcode::Recv | WcOpcode::RecvImm => "receive",
    }
}

pub struct Rdma {
    kind: Kind,
    qp_type: QpType,
    channel: Option<Channel>,
}

impl Rdma {
    pub fn new(workload: Workload) -> Self {
        let (kind, qp_type) = Kind::of(workload);
        Self {
            kind,
            qp_type,
            channel: None,
        }
    }

    fn check(&self, req: &Request, mtu: u32) -> Result<()> {
        if req.msg_size == 0 {
            return Err(Error::invalid("msg_size", "must be nonzero"));
        }
        if self.qp_type == QpType::Ud && req.msg_size > mtu {
            return Err(Error::invalid(
                "msg_size",
                format!("{} exceeds the {mtu} byte MTU of a datagram", req.msg_size),
            ));
        }
        Ok(())
    }

    /// Whether this node drives the send side of a one-directional test.
    fn sender(&self, sess: &Session) -> bool {
        let client = sess.role() == Role::Client;
        match self.kind {
            Kind::Bw => client != sess.req().flipped(),
            _ => client,
        }
    }

    fn channel(&mut self) -> Result<&mut Channel> {
        self.channel
            .as_mut()
            .ok_or_else(|| Error::Internal("queue pair used before it was opened".into()))
    }

    fn stream(ch: &mut Channel, sess: &mut Session, sender: bool, bidirectional: bool) -> Result<()> {
        let size = ch.msg_size;
        let mut outstanding = 0;
        let mut count = 0u64;

        loop {
            if sender || bidirectional {
                while outstanding < ch.depth && !sess.is_finished() {
                    ch.post_send()?;
                    outstanding += 1;
                }
            }
            if !ch.next_batch(sess)? {
                break;
            }
            let batch = std::mem::take(&mut ch.wcs);
            for wc in &batch {
                if sess.is_finished() {
                    break;
                }
                if wc.is_receive() {
                    if ch.settle(sess, wc, Direction::Received, size)? {
                        count += 1;
                        sess.limit_reached(count);
                    }
                    if !sess.is_finished() {
                        ch.post_recv()?;
                    }
                } else {
                    outstanding -= 1;
                    if ch.settle(sess, wc, Direction::Sent, size)? && !bidirectional {
                        count += 1;
                        sess.limit_reached(count);
                    }
                }
            }
            ch.wcs = batch;
        }
        Ok(())
    }

    /// Round trips of sends, or of writes with immediate data. The
    /// initiator posts first; both sides answer every receive. The
    /// responder answers before counting, so the last round trip completes
    /// on the initiator too.
    fn ping_pong(ch: &mut Channel, sess: &mut Session, opcode: Opcode) -> Result<()> {
        let size = ch.msg_size;
        let post = |ch: &mut Channel| match opcode {
            Opcode::Send => ch.post_send(),
            _ => ch.post_remote(opcode, size),
        };
        let responder = sess.role() == Role::Server;
        let mut count = 0u64;

        if !responder {
            post(ch)?;
        }
        while ch.next_batch(sess)? {
            let batch = std::mem::take(&mut ch.wcs);
            for wc in &batch {
                if sess.is_finished() {
                    break;
                }
                if !wc.is_receive() {
                    ch.settle(sess, wc, Direction::Sent, size)?;
                    continue;
                }
                let received = ch.settle(sess, wc, Direction::Received, size)?;
                ch.post_recv()?;
                if responder && !sess.is_finished() {
                    post(ch)?;
                }
                if received {
                    count += 1;
                    sess.limit_reached(count);
                }
                if !responder && !sess.is_finished() {
                    post(ch)?;
                }
            }
            ch.wcs = batch;
        }
        Ok(())
    }

    /// Round trips of plain writes. A message has arrived once the last
    /// byte of the receive slot carries the round's sequence number.
    fn poll_pong(ch: &mut Channel, sess: &mut Session) -> Result<()> {
        let size = ch.msg_size;
        let last = size - 1;
        let mut payload = vec![0u8; size];
        let mut seq = 1u8;
        let mut count = 0u64;
        let mut sending = sess.role() == Role::Client;

        while !sess.is_finished() {
            if sending {
                payload[last] = seq;
                ch.qp.write_local(ch.slot, &payload)?;
                ch.post_remote(Opcode::Write, size)?;
            } else {
                if !Self::await_byte(ch, sess, last, seq)? {
                    break;
                }
                sess.stat_mut().account(Direction::Received, size as u64);
                if sess.role() == Role::Client {
                    count += 1;
                    seq = seq.checked_add(1).unwrap_or(1);
                }
            }
            if sending && sess.role() == Role::Server {
                count += 1;
                seq = seq.checked_add(1).unwrap_or(1);
            }
            sending = !sending;
            if sess.limit_reached(count) {
                break;
            }
        }
        Ok(())
    }

    fn await_byte(ch: &mut Channel, sess: &mut Session, at: usize, seq: u8) -> Result<bool> {
        let mut byte = [0u8];
        let mut spins = 0u32;
        loop {
            ch.qp.read_local(at, &mut byte)?;
            if byte[0] == seq {
                return Ok(true);
            }
            if sess.is_finished() {
                return Ok(false);
            }

            ch.wcs.clear();
            let polled = ch.qp.poll(&mut ch.wcs, POLL_BATCH)?;
            if polled > 0 {
                sess.stat_mut().note_cqes(polled);
                let batch = std::mem::take(&mut ch.wcs);
                for wc in &batch {
                    ch.settle(sess, wc, Direction::Sent, ch.msg_size)?;
                }
                ch.wcs = batch;
            }

            spins = spins.wrapping_add(1);
            if spins % URGENT_CHECK_SPINS == 0 {
                sess.poll_urgent()?;
            }
        }
    }

    /// Reads from the peer's buffer. Every completed read is data the peer
    /// sent without taking part.
    fn read(ch: &mut Channel, sess: &mut Session) -> Result<()> {
        let size = ch.msg_size;
        Self::windowed(ch, sess, |ch| ch.post_remote(Opcode::Read, size), |sess| {
            sess.stat_mut().account(Direction::RemoteSent, size as u64);
        }, Direction::Received)
    }

    fn write(ch: &mut Channel, sess: &mut Session) -> Result<()> {
        let size = ch.msg_size;
        Self::windowed(ch, sess, |ch| ch.post_remote(Opcode::Write, size), |sess| {
            sess.stat_mut().account(Direction::RemoteReceived, size as u64);
        }, Direction::Sent)
    }

    fn atomic_rate(ch: &mut Channel, sess: &mut Session, atomic: Atomic) -> Result<()> {
        let opcode = match atomic {
            Atomic::CompareSwap => Opcode::CompareSwap {
                compare: 0,
                swap: 0,
            },
            Atomic::FetchAdd => Opcode::FetchAdd(1),
        };
        Self::windowed(
            ch,
            sess,
            |ch| ch.post_remote(opcode, ATOMIC_SIZE as usize),
            |sess| sess.stat_mut().account(Direction::RemoteSent, u64::from(ATOMIC_SIZE)),
            Direction::Received,
        )
    }

    /// Keeps `depth` one-sided operations in flight. `mirror` charges the
    /// passive peer's side of each completed operation.
    fn windowed(
        ch: &mut Channel,
        sess: &mut Session,
        post: impl Fn(&mut Channel) -> Result<()>,
        mirror: impl Fn(&mut Session),
        direction: Direction,
    ) -> Result<()> {
        let size = ch.msg_size;
        let mut outstanding = 0;
        let mut count = 0u64;

        loop {
            while outstanding < ch.depth && !sess.is_finished() {
                post(ch)?;
                outstanding += 1;
            }
            if !ch.next_batch(sess)? {
                break;
            }
            let batch = std::mem::take(&mut ch.wcs);
            for wc in &batch {
                if sess.is_finished() {
                    break;
                }
                outstanding -= 1;
                if ch.settle(sess, wc, direction, size)? {
                    mirror(sess);
                    count += 1;
                    sess.limit_reached(count);
                }
            }
            ch.wcs = batch;
        }
        Ok(())
    }

    /// Applies one atomic at a time to a counter in the peer's buffer and
    /// checks each returned value against what the previous ones imply.
    fn atomic_verify(ch: &mut Channel, sess: &mut Session, atomic: Atomic) -> Result<()> {
        let mut expected = 0u64;
        let mut count = 0u64;

        while !sess.is_finished() {
            let opcode = match atomic {
                Atomic::CompareSwap => Opcode::CompareSwap {
                    compare: expected,
                    swap: expected.wrapping_add(1),
                },
                Atomic::FetchAdd => Opcode::FetchAdd(1),
            };
            ch.post_remote(opcode, ATOMIC_SIZE as usize)?;
            if !ch.next_batch(sess)? {
                break;
            }
            let batch = std::mem::take(&mut ch.wcs);
            for wc in &batch {
                if !wc.is_success() {
                    ch.settle(sess, wc, Direction::Received, ATOMIC_SIZE as usize)?;
                    continue;
                }
                let old = ch.read_u64(ch.slot)?;
                if old == expected {
                    let stat = sess.stat_mut();
                    stat.account(Direction::Received, u64::from(ATOMIC_SIZE));
                    stat.account(Direction::RemoteSent, u64::from(ATOMIC_SIZE));
                    expected = expected.wrapping_add(1);
                    count += 1;
                    sess.limit_reached(count);
                } else {
                    warn!("atomic returned {old}, expected {expected}");
                    sess.stat_mut().account_error(Direction::Received);
                    expected = match atomic {
                        Atomic::CompareSwap => old,
                        Atomic::FetchAdd => old.wrapping_add(1),
                    };
                }
            }
            ch.wcs = batch;
        }
        Ok(())
    }
}

impl Backend for Rdma {
    fn configure(&self, params: &mut ParamTable) {
        use_common(params);
        params.set_default_pair(P::LMsgSize, P::RMsgSize, self.kind.default_size());
        params.set_default_pair(P::LPollMode, P::RPollMode, 1);
        if !self.kind.is_atomic() {
            params.mark_used_pair(P::LMsgSize, P::RMsgSize);
        }
        params.mark_used_pair(P::LId, P::RId);
        params.mark_used_pair(P::LPollMode, P::RPollMode);
        params.mark_used_pair(P::LMtuSize, P::RMtuSize);
        params.mark_used_pair(P::LServiceLevel, P::RServiceLevel);
        params.mark_used_pair(P::LSrcPathBits, P::RSrcPathBits);
        params.mark_used_pair(P::LStaticRate, P::RStaticRate);
        params.mark_used_pair(P::LUseCm, P::RUseCm);
        if self.kind.uses_rd_atomic() {
            params.set_default_pair(P::LRdAtomic, P::RRdAtomic, DEFAULT_RD_ATOMIC);
            params.mark_used_pair(P::LRdAtomic, P::RRdAtomic);
        }
        if self.kind == Kind::Bw {
            params.mark_used_pair(P::LFlip, P::RFlip);
        }
    }

    fn open_channel(&mut self, sess: &mut Session) -> Result<()> {
        let mut req = sess.req().clone();
        if self.kind.is_atomic() {
            req.msg_size = ATOMIC_SIZE;
        }

        let device = sess.context().rdma.clone().ok_or_else(|| {
            Error::Unsupported("RDMA workloads need an RDMA device on both nodes".into())
        })?;
        let depth = self.kind.depth(req.rd_atomic);
        let msg_size = req.msg_size as usize;
        let slot = (msg_size + self.qp_type.recv_overhead()).next_multiple_of(8);
        let config = Config::from_request(&req, self.qp_type, 2 * slot, depth as u32)?;
        self.check(&req, config.mtu)?;

        let qp = device.open(&config)?;
        let local = qp.local_info();
        let remote = match sess.role() {
            Role::Client => {
                sess.send_mesg(&local.encode(), "sending queue pair info")?;
                recv_qp_info(sess)?
            }
            Role::Server => {
                let remote = recv_qp_info(sess)?;
                sess.send_mesg(&local.encode(), "sending queue pair info")?;
                remote
            }
        };

        let mut ch = Channel {
            qp,
            qp_type: self.qp_type,
            remote,
            msg_size,
            slot,
            depth,
            busy_poll: req.poll_mode != 0,
            wcs: Vec::with_capacity(POLL_BATCH),
            idle: 0,
        };
        ch.qp.connect(&remote)?;
        debug!(
            "{} queue pair {} connected to {} on {}",
            self.qp_type.name(),
            local.qpn,
            remote.qpn,
            device.name()
        );

        if self.kind.receives(self.sender(sess)) {
            for _ in 0..depth {
                ch.post_recv()?;
            }
        }
        apply_affinity(sess)?;
        self.channel = Some(ch);
        Ok(())
    }

    fn run(&mut self, sess: &mut Session) -> Result<()> {
        let kind = self.kind;
        let sender = self.sender(sess);
        let ch = self.channel()?;

        match kind {
            Kind::Bw => Self::stream(ch, sess, sender, false),
            Kind::BiBw => Self::stream(ch, sess, true, true),
            Kind::Lat => Self::ping_pong(ch, sess, Opcode::Send),
            Kind::WriteLat => Self::ping_pong(ch, sess, Opcode::WriteImm(0)),
            Kind::WritePollLat => Self::poll_pong(ch, sess),
            // the target of a one-sided operation has nothing to drive
            _ if !sender => sess.wait_finished(),
            Kind::WriteBw => Self::write(ch, sess),
            Kind::ReadBw | Kind::ReadLat => Self::read(ch, sess),
            Kind::AtomicRate(atomic) => Self::atomic_rate(ch, sess, atomic),
            Kind::AtomicVerify(atomic) => Self::atomic_verify(ch, sess, atomic),
        }
    }
}

fn recv_qp_info(sess: &mut Session) -> Result<QpInfo> {
    let mut buf = [0u8; QP_INFO_SIZE];
    sess.recv_mesg(&mut buf, "receiving queue pair info")?;
    QpInfo::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workloads_map_onto_transport_types() {
        assert_eq!(Kind::of(Workload::UdLat), (Kind::Lat, QpType::Ud));
        assert_eq!(Kind::of(Workload::UcRdmaWriteBw), (Kind::WriteBw, QpType::Uc));
        assert_eq!(
            Kind::of(Workload::VerRcFetchAdd),
            (Kind::AtomicVerify(Atomic::FetchAdd), QpType::Rc)
        );
    }

    #[test]
    fn depth_follows_rd_atomic_for_reads() {
        assert_eq!(Kind::ReadBw.depth(16), 16);
        assert_eq!(Kind::ReadBw.depth(0), 1);
        assert_eq!(Kind::ReadLat.depth(16), 1);
        assert_eq!(Kind::Bw.depth(16), TWO_SIDED_DEPTH);
    }

    #[test]
    fn atomics_ignore_message_size() {
        let rdma = Rdma::new(Workload::RcFetchAddMr);
        let mut params = ParamTable::new().unwrap();
        params.begin_test();
        rdma.configure(&mut params);
        assert!(!params.is_in_use(P::LMsgSize));
        assert!(params.is_in_use(P::LRdAtomic));
        assert_eq!(params.num(P::LRdAtomic), DEFAULT_RD_ATOMIC);
    }

    #[test]
    fn only_streams_consult_flip() {
        for (workload, flips) in [(Workload::RcBw, true), (Workload::RcRdmaWriteBw, false)] {
            let mut params = ParamTable::new().unwrap();
            params.begin_test();
            Rdma::new(workload).configure(&mut params);
            assert_eq!(params.is_in_use(P::LFlip), flips, "{workload}");
        }
    }
}
