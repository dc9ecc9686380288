use bytemuck::{Pod, Zeroable};

use crate::{
    codec::{Decoder, Encoder, U32, U64},
    error::Result,
};

/// Number of CPU time buckets sampled at the start and end of a test.
pub const T_N: usize = 9;

pub const STAT_SIZE: usize = 3 * U32 + 2 * T_N * U64 + 4 * 3 * U64;

/// Index of each CPU time bucket. `Real` is wall-clock time expressed in
/// clock ticks so that every bucket shares one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Tick {
    User,
    Nice,
    Kernel,
    Idle,
    IoWait,
    Irq,
    SoftIrq,
    Steal,
    Real,
}

pub type Ticks = [u64; T_N];

/// Byte, message and error counters for one direction of traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Transfer {
    pub bytes: u64,
    pub msgs: u64,
    pub errs: u64,
}

impl Transfer {
    pub fn combine(self, other: Transfer) -> Transfer {
        Transfer {
            bytes: self.bytes + other.bytes,
            msgs: self.msgs + other.msgs,
            errs: self.errs + other.errs,
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.encode_uint(self.bytes, U64);
        enc.encode_uint(self.msgs, U64);
        enc.encode_uint(self.errs, U64);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            bytes: dec.decode_u64()?,
            msgs: dec.decode_u64()?,
            errs: dec.decode_u64()?,
        })
    }
}

/// Which counter a unit of work is charged to. The remote variants count
/// traffic this node drove on the peer's behalf, for transports where the
/// peer never observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
    RemoteSent,
    RemoteReceived,
}

/// Raw per-node counters, exchanged verbatim once the test window closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Zeroable)]
pub struct NodeStat {
    pub no_cpus: u32,
    pub no_ticks: u32,
    pub max_cqes: u32,
    pub start: Ticks,
    pub end: Ticks,
    pub sent: Transfer,
    pub received: Transfer,
    pub rem_sent: Transfer,
    pub rem_received: Transfer,
}

impl NodeStat {
    pub fn transfer_mut(&mut self, direction: Direction) -> &mut Transfer {
        match direction {
            Direction::Sent => &mut self.sent,
            Direction::Received => &mut self.received,
            Direction::RemoteSent => &mut self.rem_sent,
            Direction::RemoteReceived => &mut self.rem_received,
        }
    }

    /// Charges one successfully transferred unit of `bytes`.
    pub fn account(&mut self, direction: Direction, bytes: u64) {
        let transfer = self.transfer_mut(direction);
        transfer.bytes += bytes;
        transfer.msgs += 1;
    }

    pub fn account_error(&mut self, direction: Direction) {
        self.transfer_mut(direction).errs += 1;
    }

    pub fn note_cqes(&mut self, polled: usize) {
        self.max_cqes = self.max_cqes.max(polled as u32);
    }

    pub fn elapsed(&self, tick: Tick) -> u64 {
        self.end[tick as usize].saturating_sub(self.start[tick as usize])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(STAT_SIZE);
        enc.encode_uint(self.no_cpus.into(), U32);
        enc.encode_uint(self.no_ticks.into(), U32);
        enc.encode_uint(self.max_cqes.into(), U32);
        for tick in self.start.iter().chain(self.end.iter()) {
            enc.encode_uint(*tick, U64);
        }
        for transfer in [self.sent, self.received, self.rem_sent, self.rem_received] {
            transfer.encode(&mut enc);
        }
        debug_assert_eq!(enc.len(), STAT_SIZE);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let mut stat = NodeStat {
            no_cpus: dec.decode_u32()?,
            no_ticks: dec.decode_u32()?,
            max_cqes: dec.decode_u32()?,
            ..Zeroable::zeroed()
        };
        for tick in stat.start.iter_mut() {
            *tick = dec.decode_u64()?;
        }
        for tick in stat.end.iter_mut() {
            *tick = dec.decode_u64()?;
        }
        stat.sent = Transfer::decode(&mut dec)?;
        stat.received = Transfer::decode(&mut dec)?;
        stat.rem_sent = Transfer::decode(&mut dec)?;
        stat.rem_received = Transfer::decode(&mut dec)?;
        Ok(stat)
    }
}
