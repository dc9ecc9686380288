//! Registry of negotiable test parameters.
//!
//! Every setting exists twice, once for the local node and once for the
//! remote one. Command line options bind values into the table, workloads
//! mark the entries they consult, and the table is finally snapshotted into
//! the two [`Request`]s that describe the test from each side.

use std::fmt::{self, Display};

use tracing::warn;

use crate::{
    error::{Error, Result},
    message::Request,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ParamIndex {
    LAccessRecv,
    RAccessRecv,
    LAffinity,
    RAffinity,
    LAltPort,
    RAltPort,
    LFlip,
    RFlip,
    LId,
    RId,
    LMsgSize,
    RMsgSize,
    LMtuSize,
    RMtuSize,
    LNoMsgs,
    RNoMsgs,
    LPollMode,
    RPollMode,
    LPort,
    RPort,
    LRdAtomic,
    RRdAtomic,
    LServiceLevel,
    RServiceLevel,
    LSockBufSize,
    RSockBufSize,
    LSrcPathBits,
    RSrcPathBits,
    LStaticRate,
    RStaticRate,
    LTime,
    RTime,
    LTimeout,
    RTimeout,
    LUseCm,
    RUseCm,
}

pub const PARAM_COUNT: usize = ParamIndex::RUseCm as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Int,
    Size,
    Time,
    Str,
}

/// The request field a parameter is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    AccessRecv,
    Affinity,
    AltPort,
    Flip,
    Id,
    MsgSize,
    MtuSize,
    NoMsgs,
    PollMode,
    Port,
    RdAtomic,
    ServiceLevel,
    SockBufSize,
    SrcPathBits,
    StaticRate,
    Time,
    Timeout,
    UseCm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Num(u32),
    Str(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Num(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

struct Entry {
    index: ParamIndex,
    side: Side,
    kind: Kind,
    field: Field,
}

const fn entry(index: ParamIndex, side: Side, kind: Kind, field: Field) -> Entry {
    Entry {
        index,
        side,
        kind,
        field,
    }
}

use self::{Field as F, Kind as K, ParamIndex as P, Side::*};

static TABLE: [Entry; PARAM_COUNT] = [
    entry(P::LAccessRecv, Local, K::Int, F::AccessRecv),
    entry(P::RAccessRecv, Remote, K::Int, F::AccessRecv),
    entry(P::LAffinity, Local, K::Int, F::Affinity),
    entry(P::RAffinity, Remote, K::Int, F::Affinity),
    entry(P::LAltPort, Local, K::Int, F::AltPort),
    entry(P::RAltPort, Remote, K::Int, F::AltPort),
    entry(P::LFlip, Local, K::Int, F::Flip),
    entry(P::RFlip, Remote, K::Int, F::Flip),
    entry(P::LId, Local, K::Str, F::Id),
    entry(P::RId, Remote, K::Str, F::Id),
    entry(P::LMsgSize, Local, K::Size, F::MsgSize),
    entry(P::RMsgSize, Remote, K::Size, F::MsgSize),
    entry(P::LMtuSize, Local, K::Size, F::MtuSize),
    entry(P::RMtuSize, Remote, K::Size, F::MtuSize),
    entry(P::LNoMsgs, Local, K::Int, F::NoMsgs),
    entry(P::RNoMsgs, Remote, K::Int, F::NoMsgs),
    entry(P::LPollMode, Local, K::Int, F::PollMode),
    entry(P::RPollMode, Remote, K::Int, F::PollMode),
    entry(P::LPort, Local, K::Int, F::Port),
    entry(P::RPort, Remote, K::Int, F::Port),
    entry(P::LRdAtomic, Local, K::Int, F::RdAtomic),
    entry(P::RRdAtomic, Remote, K::Int, F::RdAtomic),
    entry(P::LServiceLevel, Local, K::Int, F::ServiceLevel),
    entry(P::RServiceLevel, Remote, K::Int, F::ServiceLevel),
    entry(P::LSockBufSize, Local, K::Size, F::SockBufSize),
    entry(P::RSockBufSize, Remote, K::Size, F::SockBufSize),
    entry(P::LSrcPathBits, Local, K::Int, F::SrcPathBits),
    entry(P::RSrcPathBits, Remote, K::Int, F::SrcPathBits),
    entry(P::LStaticRate, Local, K::Str, F::StaticRate),
    entry(P::RStaticRate, Remote, K::Str, F::StaticRate),
    entry(P::LTime, Local, K::Time, F::Time),
    entry(P::RTime, Remote, K::Time, F::Time),
    entry(P::LTimeout, Local, K::Time, F::Timeout),
    entry(P::RTimeout, Remote, K::Time, F::Timeout),
    entry(P::LUseCm, Local, K::Int, F::UseCm),
    entry(P::RUseCm, Remote, K::Int, F::UseCm),
];

#[derive(Debug, Clone, Default)]
struct State {
    value: Option<Value>,
    name: Option<&'static str>,
    set: bool,
    used: bool,
    in_use: bool,
    warned: bool,
}

#[derive(Debug, Clone)]
pub struct ParamTable {
    states: Vec<State>,
}

impl ParamTable {
    /// Builds the table, checking that every entry sits at its own index.
    pub fn new() -> Result<Self> {
        for (position, entry) in TABLE.iter().enumerate() {
            if entry.index as usize != position {
                return Err(Error::Internal(format!(
                    "parameter table out of order: {:?} found at position {position}",
                    entry.index
                )));
            }
        }

        Ok(Self {
            states: vec![State::default(); PARAM_COUNT],
        })
    }

    pub fn kind(index: ParamIndex) -> Kind {
        TABLE[index as usize].kind
    }

    /// Records that option `name` set `index` to `value`. A `None` index
    /// means the option does not apply and is ignored. Once a parameter has
    /// been bound, a later binding with a different value is rejected, so
    /// an option that names both halves of a local/remote pair cannot
    /// silently override a more specific one given first.
    pub fn bind(
        &mut self,
        name: &'static str,
        index: Option<ParamIndex>,
        value: impl Into<Value>,
    ) -> Result<()> {
        let Some(index) = index else {
            return Ok(());
        };
        let value = value.into();
        check_kind(name, index, &value)?;

        let state = &mut self.states[index as usize];
        if state.set {
            if state.value.as_ref() == Some(&value) {
                return Ok(());
            }
            return Err(Error::invalid(
                name,
                format!(
                    "conflicts with {} already set to {}",
                    state.name.unwrap_or("an earlier option"),
                    state.value.as_ref().map(|v| v.to_string()).unwrap_or_default()
                ),
            ));
        }

        state.value = Some(value);
        state.name = Some(name);
        state.set = true;
        Ok(())
    }

    /// Supplies a workload default; options the user bound take precedence.
    pub fn set_default(&mut self, index: ParamIndex, value: impl Into<Value>) {
        let state = &mut self.states[index as usize];
        if !state.set {
            state.value = Some(value.into());
        }
    }

    pub fn set_default_pair(&mut self, local: ParamIndex, remote: ParamIndex, value: u32) {
        self.set_default(local, value);
        self.set_default(remote, value);
    }

    pub fn mark_used(&mut self, index: ParamIndex) {
        let state = &mut self.states[index as usize];
        state.used = true;
        state.in_use = true;
    }

    pub fn mark_used_pair(&mut self, local: ParamIndex, remote: ParamIndex) {
        self.mark_used(local);
        self.mark_used(remote);
    }

    /// Clears the in-use flags before another workload is configured.
    pub fn begin_test(&mut self) {
        for state in &mut self.states {
            state.in_use = false;
        }
    }

    pub fn is_set(&self, index: ParamIndex) -> bool {
        self.states[index as usize].set
    }

    pub fn is_in_use(&self, index: ParamIndex) -> bool {
        self.states[index as usize].in_use
    }

    pub fn value(&self, index: ParamIndex) -> Option<&Value> {
        self.states[index as usize].value.as_ref()
    }

    pub fn num(&self, index: ParamIndex) -> u32 {
        match self.value(index) {
            Some(Value::Num(n)) => *n,
            _ => 0,
        }
    }

    /// Warns once per option for parameters that were set but that the
    /// workload being configured did not consult. An option no workload has
    /// consulted yet is only reported the first time. Returns the warnings
    /// emitted.
    pub fn check_unused(&mut self, test: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut reported: Vec<&'static str> = Vec::new();

        for state in &self.states {
            if !state.set || state.in_use || (state.warned && !state.used) {
                continue;
            }
            let Some(name) = state.name else {
                continue;
            };
            if reported.contains(&name) {
                continue;
            }
            reported.push(name);

            let warning = format!("{name} set but not used in test {test}");
            warn!("{warning}");
            warnings.push(warning);
        }

        for state in &mut self.states {
            if state.name.is_some_and(|name| reported.contains(&name)) {
                state.warned = true;
            }
        }
        warnings
    }

    /// Snapshots the values for one side into a request.
    pub fn request(&self, side: Side, req_index: u16) -> Request {
        let mut req = Request {
            req_index,
            ..Default::default()
        };

        for (entry, state) in TABLE.iter().zip(&self.states) {
            if entry.side != side {
                continue;
            }
            match &state.value {
                Some(Value::Num(n)) => store_num(&mut req, entry.field, *n),
                Some(Value::Str(s)) => store_str(&mut req, entry.field, s),
                None => {}
            }
        }

        req
    }
}

fn check_kind(name: &str, index: ParamIndex, value: &Value) -> Result<()> {
    let is_str = ParamTable::kind(index) == Kind::Str;
    match value {
        Value::Str(_) if !is_str => Err(Error::invalid(name, "expects a number")),
        Value::Num(_) if is_str => Err(Error::invalid(name, "expects a string")),
        _ => Ok(()),
    }
}

fn store_num(req: &mut Request, field: Field, n: u32) {
    let slot = match field {
        F::AccessRecv => &mut req.access_recv,
        F::Affinity => &mut req.affinity,
        F::AltPort => &mut req.alt_port,
        F::Flip => &mut req.flip,
        F::MsgSize => &mut req.msg_size,
        F::MtuSize => &mut req.mtu_size,
        F::NoMsgs => &mut req.no_msgs,
        F::PollMode => &mut req.poll_mode,
        F::Port => &mut req.port,
        F::RdAtomic => &mut req.rd_atomic,
        F::ServiceLevel => &mut req.service_level,
        F::SockBufSize => &mut req.sock_buf_size,
        F::SrcPathBits => &mut req.src_path_bits,
        F::Time => &mut req.time,
        F::Timeout => &mut req.timeout,
        F::UseCm => &mut req.use_cm,
        F::Id | F::StaticRate => return,
    };
    *slot = n;
}

fn store_str(req: &mut Request, field: Field, s: &str) {
    match field {
        F::Id => req.id = s.to_owned(),
        F::StaticRate => req.static_rate = s.to_owned(),
        _ => {}
    }
}

/// Parses a command line value according to the parameter's kind.
/// Sizes take `k`/`m`/`g` (decimal) or `kib`/`mib`/`gib` suffixes, times
/// take `s`/`m`/`h`.
pub fn parse_value(name: &str, index: ParamIndex, text: &str) -> Result<Value> {
    let kind = ParamTable::kind(index);
    if kind == Kind::Str {
        return Ok(Value::Str(text.to_owned()));
    }

    let lower = text.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, suffix) = lower.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::invalid(name, format!("bad value {text:?}")))?;

    let multiplier: u64 = match (kind, suffix) {
        (_, "") => 1,
        (Kind::Size, "k" | "kb") => 1_000,
        (Kind::Size, "m" | "mb") => 1_000_000,
        (Kind::Size, "g" | "gb") => 1_000_000_000,
        (Kind::Size, "kib") => 1 << 10,
        (Kind::Size, "mib") => 1 << 20,
        (Kind::Size, "gib") => 1 << 30,
        (Kind::Time, "s") => 1,
        (Kind::Time, "m") => 60,
        (Kind::Time, "h") => 3600,
        _ => return Err(Error::invalid(name, format!("bad suffix in {text:?}"))),
    };

    let value = number
        .checked_mul(multiplier)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| Error::invalid(name, format!("{text:?} is out of range")))?;

    Ok(Value::Num(value))
}
