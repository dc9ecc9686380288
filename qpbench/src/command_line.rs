use std::time::Duration;

use clap::{arg, command, ArgAction, Parser};
use qpbench_shared::{
    error::Result,
    param::{parse_value, ParamIndex as P, ParamTable, Value},
    server::DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(version, about = "Measures bandwidth and latency between two nodes", long_about = None)]
pub struct GlobalArgs {
    /// Server to test against; without one, run as the server.
    pub host: Option<String>,
    /// Tests to run, in order.
    pub tests: Vec<String>,

    /// Control connection port.
    #[arg(long, short = 'p', visible_alias = "listen_port", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Seconds to keep retrying the first connection.
    #[arg(long, default_value = "5")]
    pub wait: String,
    /// Log at debug level; RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long = "access_recv")]
    pub access_recv: Option<String>,
    #[arg(long = "loc_access_recv")]
    pub loc_access_recv: Option<String>,
    #[arg(long = "rem_access_recv")]
    pub rem_access_recv: Option<String>,

    #[arg(long)]
    pub affinity: Option<String>,
    #[arg(long = "loc_affinity")]
    pub loc_affinity: Option<String>,
    #[arg(long = "rem_affinity")]
    pub rem_affinity: Option<String>,

    /// Data port the server binds for socket tests; 0 picks one.
    #[arg(long = "alt_port")]
    pub alt_port: Option<String>,

    /// Reverse sender and receiver in one-directional tests.
    #[arg(long)]
    pub flip: Option<String>,

    /// RDMA device and port, as `device[:port]`.
    #[arg(long)]
    pub id: Option<String>,
    #[arg(long = "loc_id")]
    pub loc_id: Option<String>,
    #[arg(long = "rem_id")]
    pub rem_id: Option<String>,

    #[arg(long = "msg_size", short = 'm')]
    pub msg_size: Option<String>,
    #[arg(long = "loc_msg_size")]
    pub loc_msg_size: Option<String>,
    #[arg(long = "rem_msg_size")]
    pub rem_msg_size: Option<String>,

    #[arg(long = "mtu_size")]
    pub mtu_size: Option<String>,

    /// End each test after this many messages instead of after `time`.
    #[arg(long = "no_msgs", short = 'n')]
    pub no_msgs: Option<String>,

    /// 1 busy-polls for completions, 0 waits for events.
    #[arg(long = "poll_mode")]
    pub poll_mode: Option<String>,
    #[arg(long = "loc_poll_mode")]
    pub loc_poll_mode: Option<String>,
    #[arg(long = "rem_poll_mode")]
    pub rem_poll_mode: Option<String>,

    #[arg(long = "rd_atomic")]
    pub rd_atomic: Option<String>,
    #[arg(long = "loc_rd_atomic")]
    pub loc_rd_atomic: Option<String>,
    #[arg(long = "rem_rd_atomic")]
    pub rem_rd_atomic: Option<String>,

    #[arg(long = "service_level")]
    pub service_level: Option<String>,

    #[arg(long = "sock_buf_size")]
    pub sock_buf_size: Option<String>,
    #[arg(long = "loc_sock_buf_size")]
    pub loc_sock_buf_size: Option<String>,
    #[arg(long = "rem_sock_buf_size")]
    pub rem_sock_buf_size: Option<String>,

    #[arg(long = "src_path_bits")]
    pub src_path_bits: Option<String>,

    #[arg(long = "static_rate")]
    pub static_rate: Option<String>,

    #[arg(long, short = 't')]
    pub time: Option<String>,
    #[arg(long = "loc_time")]
    pub loc_time: Option<String>,
    #[arg(long = "rem_time")]
    pub rem_time: Option<String>,

    #[arg(long)]
    pub timeout: Option<String>,
    #[arg(long = "loc_timeout")]
    pub loc_timeout: Option<String>,
    #[arg(long = "rem_timeout")]
    pub rem_timeout: Option<String>,

    #[arg(long = "use_cm")]
    pub use_cm: Option<String>,
}

/// One option that may set a local/remote parameter pair.
struct Binding<'a> {
    name: &'static str,
    value: Option<&'a String>,
    local: Option<P>,
    remote: Option<P>,
}

impl<'a> Binding<'a> {
    fn both(name: &'static str, value: &'a Option<String>, local: P, remote: P) -> Self {
        Self {
            name,
            value: value.as_ref(),
            local: Some(local),
            remote: Some(remote),
        }
    }

    fn loc(name: &'static str, value: &'a Option<String>, local: P) -> Self {
        Self {
            name,
            value: value.as_ref(),
            local: Some(local),
            remote: None,
        }
    }

    fn rem(name: &'static str, value: &'a Option<String>, remote: P) -> Self {
        Self {
            name,
            value: value.as_ref(),
            local: None,
            remote: Some(remote),
        }
    }
}

impl GlobalArgs {
    pub fn wait(&self) -> Result<Duration> {
        let Value::Num(secs) = parse_value("wait", P::LTime, &self.wait)? else {
            return Ok(Duration::ZERO);
        };
        Ok(Duration::from_secs(secs.into()))
    }

    fn bindings(&self) -> Vec<Binding<'_>> {
        use Binding as B;

        // the side-specific options come first so they win over the
        // options naming both sides
        vec![
            B::loc("loc_access_recv", &self.loc_access_recv, P::LAccessRecv),
            B::rem("rem_access_recv", &self.rem_access_recv, P::RAccessRecv),
            B::loc("loc_affinity", &self.loc_affinity, P::LAffinity),
            B::rem("rem_affinity", &self.rem_affinity, P::RAffinity),
            B::loc("loc_id", &self.loc_id, P::LId),
            B::rem("rem_id", &self.rem_id, P::RId),
            B::loc("loc_msg_size", &self.loc_msg_size, P::LMsgSize),
            B::rem("rem_msg_size", &self.rem_msg_size, P::RMsgSize),
            B::loc("loc_poll_mode", &self.loc_poll_mode, P::LPollMode),
            B::rem("rem_poll_mode", &self.rem_poll_mode, P::RPollMode),
            B::loc("loc_rd_atomic", &self.loc_rd_atomic, P::LRdAtomic),
            B::rem("rem_rd_atomic", &self.rem_rd_atomic, P::RRdAtomic),
            B::loc("loc_sock_buf_size", &self.loc_sock_buf_size, P::LSockBufSize),
            B::rem("rem_sock_buf_size", &self.rem_sock_buf_size, P::RSockBufSize),
            B::loc("loc_time", &self.loc_time, P::LTime),
            B::rem("rem_time", &self.rem_time, P::RTime),
            B::loc("loc_timeout", &self.loc_timeout, P::LTimeout),
            B::rem("rem_timeout", &self.rem_timeout, P::RTimeout),
            B::both("access_recv", &self.access_recv, P::LAccessRecv, P::RAccessRecv),
            B::both("affinity", &self.affinity, P::LAffinity, P::RAffinity),
            B::both("alt_port", &self.alt_port, P::LAltPort, P::RAltPort),
            B::both("flip", &self.flip, P::LFlip, P::RFlip),
            B::both("id", &self.id, P::LId, P::RId),
            B::both("msg_size", &self.msg_size, P::LMsgSize, P::RMsgSize),
            B::both("mtu_size", &self.mtu_size, P::LMtuSize, P::RMtuSize),
            B::both("no_msgs", &self.no_msgs, P::LNoMsgs, P::RNoMsgs),
            B::both("poll_mode", &self.poll_mode, P::LPollMode, P::RPollMode),
            B::both("rd_atomic", &self.rd_atomic, P::LRdAtomic, P::RRdAtomic),
            B::both("service_level", &self.service_level, P::LServiceLevel, P::RServiceLevel),
            B::both("sock_buf_size", &self.sock_buf_size, P::LSockBufSize, P::RSockBufSize),
            B::both("src_path_bits", &self.src_path_bits, P::LSrcPathBits, P::RSrcPathBits),
            B::both("static_rate", &self.static_rate, P::LStaticRate, P::RStaticRate),
            B::both("time", &self.time, P::LTime, P::RTime),
            B::both("timeout", &self.timeout, P::LTimeout, P::RTimeout),
            B::both("use_cm", &self.use_cm, P::LUseCm, P::RUseCm),
        ]
    }

    /// Binds every option given on the command line into a fresh table.
    pub fn params(&self) -> Result<ParamTable> {
        let mut table = ParamTable::new()?;
        for binding in self.bindings() {
            let Some(text) = binding.value else {
                continue;
            };
            for index in [binding.local, binding.remote].into_iter().flatten() {
                if table.is_set(index) {
                    continue;
                }
                let value = parse_value(binding.name, index, text)?;
                table.bind(binding.name, Some(index), value)?;
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> GlobalArgs {
        GlobalArgs::try_parse_from(std::iter::once("qpbench").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn no_host_means_server() {
        let args = parse(&["--listen_port", "4000"]);
        assert!(args.host.is_none());
        assert_eq!(args.port, 4000);
    }

    #[test]
    fn side_specific_option_wins() {
        let args = parse(&[
            "node2",
            "tcp_bw",
            "--msg_size",
            "64k",
            "--rem_msg_size",
            "1KiB",
        ]);
        let table = args.params().unwrap();
        assert_eq!(table.num(P::LMsgSize), 64_000);
        assert_eq!(table.num(P::RMsgSize), 1024);
        assert_eq!(args.tests, vec!["tcp_bw"]);
    }

    #[test]
    fn times_take_units() {
        let args = parse(&["node2", "rc_lat", "-t", "1m", "--wait", "10"]);
        assert_eq!(args.params().unwrap().num(P::RTime), 60);
        assert_eq!(args.wait().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn bad_value_is_rejected() {
        let args = parse(&["node2", "tcp_bw", "--time", "fast"]);
        assert!(args.params().is_err());
    }
}
