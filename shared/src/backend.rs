//! The closed set of workloads and the contract each one implements.

use std::fmt::{self, Display};

use tracing::debug;

use crate::{
    error::{Error, Result},
    message::NodeStat,
    param::{ParamIndex as P, ParamTable},
    session::Session,
    stats::{combine_remote_attributed, reduce_results, Results},
};

pub use self::conf::NodeInfo;

pub mod conf;
pub mod rdma;
pub mod socket;

/// Which of the derived metrics a workload's numbers support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    Latency,
    MessageRate,
    Bandwidth,
    BandwidthSendReceive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub workload: Workload,
    pub measure: MeasureKind,
    pub msg_size: u32,
    pub local: NodeStat,
    pub remote: NodeStat,
    pub results: Results,
}

impl Report {
    /// Builds the report from the statistics both nodes exchanged.
    pub fn from_session(sess: &Session) -> Result<Self> {
        let workload = Workload::from_selector(sess.req().req_index)?;
        let measure = workload
            .measure()
            .ok_or_else(|| Error::Internal(format!("{workload} reports no measurements")))?;
        Ok(Self::new(
            workload,
            measure,
            sess.req().msg_size,
            *sess.local_stat(),
            *sess.remote_stat(),
        ))
    }

    pub fn new(
        workload: Workload,
        measure: MeasureKind,
        msg_size: u32,
        local: NodeStat,
        remote: NodeStat,
    ) -> Self {
        let mut l = local;
        let mut r = remote;
        combine_remote_attributed(&mut l, &remote);
        combine_remote_attributed(&mut r, &local);

        Self {
            workload,
            measure,
            msg_size,
            local: l,
            remote: r,
            results: reduce_results(&l, &r),
        }
    }
}

/// What a client run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Report(Report),
    Conf { local: NodeInfo, remote: NodeInfo },
    Quit,
}

/// What the server should do once a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Quit,
}

/// One workload. The client side runs after the request was sent, the server
/// side after it was received and accepted.
pub trait Backend {
    /// Supplies defaults and marks the parameters the workload consults.
    fn configure(&self, params: &mut ParamTable);

    /// Sets up the data channel for the negotiated request.
    fn open_channel(&mut self, sess: &mut Session) -> Result<()>;

    /// Moves data until the test window closes, charging every unit of
    /// work to the session's statistics.
    fn run(&mut self, sess: &mut Session) -> Result<()>;

    fn client(&mut self, sess: &mut Session) -> Result<Outcome> {
        self.exercise(sess)?;
        Ok(Outcome::Report(Report::from_session(sess)?))
    }

    fn server(&mut self, sess: &mut Session) -> Result<Disposition> {
        self.exercise(sess)?;
        Ok(Disposition::Continue)
    }

    fn exercise(&mut self, sess: &mut Session) -> Result<()> {
        self.open_channel(sess)?;
        sess.sync_test()?;
        self.run(sess)?;
        sess.finish()
    }
}

macro_rules! workloads {
    ($($variant:ident => $name:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Workload {
            $($variant,)*
        }

        impl Workload {
            pub const ALL: &'static [Workload] = &[$(Workload::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Workload::$variant => $name,)*
                }
            }
        }
    };
}

workloads! {
    Conf => "conf",
    Quit => "quit",
    TcpBw => "tcp_bw",
    TcpLat => "tcp_lat",
    UdpBw => "udp_bw",
    UdpLat => "udp_lat",
    RcBw => "rc_bw",
    RcBiBw => "rc_bi_bw",
    RcLat => "rc_lat",
    RcRdmaWriteBw => "rc_rdma_write_bw",
    RcRdmaWriteLat => "rc_rdma_write_lat",
    RcRdmaWritePollLat => "rc_rdma_write_poll_lat",
    RcRdmaReadBw => "rc_rdma_read_bw",
    RcRdmaReadLat => "rc_rdma_read_lat",
    RcCompareSwapMr => "rc_compare_swap_mr",
    RcFetchAddMr => "rc_fetch_add_mr",
    VerRcCompareSwap => "ver_rc_compare_swap",
    VerRcFetchAdd => "ver_rc_fetch_add",
    UcBw => "uc_bw",
    UcBiBw => "uc_bi_bw",
    UcLat => "uc_lat",
    UcRdmaWriteBw => "uc_rdma_write_bw",
    UcRdmaWriteLat => "uc_rdma_write_lat",
    UcRdmaWritePollLat => "uc_rdma_write_poll_lat",
    UdBw => "ud_bw",
    UdBiBw => "ud_bi_bw",
    UdLat => "ud_lat",
}

impl Workload {
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|w| w.name() == name)
            .ok_or_else(|| Error::UnknownTest(name.to_owned()))
    }

    /// The index carried in a request.
    pub fn selector(self) -> u16 {
        self as u16
    }

    pub fn from_selector(selector: u16) -> Result<Self> {
        Self::ALL
            .get(usize::from(selector))
            .copied()
            .ok_or(Error::UnknownSelector(selector))
    }

    pub fn measure(self) -> Option<MeasureKind> {
        use Workload::*;
        Some(match self {
            Conf | Quit => return None,
            TcpLat | UdpLat | RcLat | RcRdmaWriteLat | RcRdmaWritePollLat | RcRdmaReadLat
            | UcLat | UcRdmaWriteLat | UcRdmaWritePollLat | UdLat => MeasureKind::Latency,
            RcCompareSwapMr | RcFetchAddMr | VerRcCompareSwap | VerRcFetchAdd => {
                MeasureKind::MessageRate
            }
            RcBiBw | UcBiBw | UdBiBw => MeasureKind::BandwidthSendReceive,
            TcpBw | UdpBw | RcBw | RcRdmaWriteBw | RcRdmaReadBw | UcBw | UcRdmaWriteBw | UdBw => {
                MeasureKind::Bandwidth
            }
        })
    }

    pub fn backend(self) -> Box<dyn Backend> {
        use self::{rdma::Rdma, socket::Socket};
        match self {
            Workload::Conf => Box::new(conf::Conf),
            Workload::Quit => Box::new(conf::Quit),
            Workload::TcpBw | Workload::TcpLat | Workload::UdpBw | Workload::UdpLat => {
                Box::new(Socket::new(self))
            }
            _ => Box::new(Rdma::new(self)),
        }
    }
}

impl Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Marks the settings every measuring workload consults.
pub(crate) fn use_common(params: &mut ParamTable) {
    params.mark_used_pair(P::LTime, P::RTime);
    params.mark_used_pair(P::LTimeout, P::RTimeout);
    params.mark_used_pair(P::LNoMsgs, P::RNoMsgs);
    params.mark_used_pair(P::LAffinity, P::RAffinity);
}

/// Pins the calling thread when an affinity was negotiated. Processors are
/// numbered from 1; 0 leaves scheduling alone.
pub(crate) fn apply_affinity(sess: &Session) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let affinity = sess.req().affinity;
    if affinity == 0 {
        return Ok(());
    }
    let mut set = CpuSet::new();
    set.set(affinity as usize - 1)
        .map_err(|_| Error::invalid("affinity", format!("no processor {affinity}")))?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|e| Error::os("sched_setaffinity", e))?;
    debug!("pinned to processor {affinity}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, Tick};

    #[test]
    fn selectors_follow_table_order() {
        for (position, workload) in Workload::ALL.iter().enumerate() {
            assert_eq!(workload.selector() as usize, position);
            assert_eq!(Workload::from_selector(workload.selector()).unwrap(), *workload);
            assert_eq!(Workload::from_name(workload.name()).unwrap(), *workload);
        }
        assert!(matches!(
            Workload::from_name("tcp_bandwidth"),
            Err(Error::UnknownTest(_))
        ));
        assert!(matches!(
            Workload::from_selector(Workload::ALL.len() as u16),
            Err(Error::UnknownSelector(_))
        ));
    }

    #[test]
    fn only_conf_and_quit_have_no_measure() {
        let silent: Vec<_> = Workload::ALL
            .iter()
            .filter(|w| w.measure().is_none())
            .collect();
        assert_eq!(silent, vec![&Workload::Conf, &Workload::Quit]);
    }

    #[test]
    fn report_credits_passive_target() {
        let ticks = |stat: &mut NodeStat| {
            stat.no_ticks = 100;
            stat.end[Tick::Real as usize] = 1000;
        };
        let mut writer = NodeStat::default();
        ticks(&mut writer);
        writer.account(Direction::Sent, 4096);
        writer.account(Direction::RemoteReceived, 4096);

        let mut target = NodeStat::default();
        ticks(&mut target);

        let report = Report::new(
            Workload::RcRdmaWriteBw,
            MeasureKind::Bandwidth,
            4096,
            writer,
            target,
        );
        assert_eq!(report.remote.received.bytes, 4096);
        assert_eq!(report.local.sent.bytes, 4096);
        // 4096 bytes over 10 seconds on both sides
        assert_eq!(report.results.send_bw, 409.6);
        assert_eq!(report.results.recv_bw, 409.6);
    }
}
