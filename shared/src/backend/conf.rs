//! Workloads that move no data: node descriptions and server shutdown.

use std::fs;

use nix::{sys::utsname::uname, unistd::gethostname};
use tracing::info;

use crate::{
    codec::{Decoder, Encoder},
    error::Result,
    message::{STRING_SIZE, VERSION},
    param::ParamTable,
    session::Session,
};

use super::{Backend, Disposition, Outcome};

const NODE_INFO_SIZE: usize = 4 * STRING_SIZE;

/// Description of one node, as `conf` reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub host: String,
    pub cpu: String,
    pub os: String,
    pub version: String,
}

impl NodeInfo {
    pub fn local() -> Self {
        let host = gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let os = uname()
            .map(|u| {
                format!(
                    "{} {}",
                    u.sysname().to_string_lossy(),
                    u.release().to_string_lossy()
                )
            })
            .unwrap_or_default();
        let cpu = fs::read_to_string("/proc/cpuinfo")
            .map(|text| describe_cpu(&text))
            .unwrap_or_default();

        Self {
            host,
            cpu,
            os,
            version: VERSION.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(NODE_INFO_SIZE);
        for field in [&self.host, &self.cpu, &self.os, &self.version] {
            enc.encode_str(field, STRING_SIZE);
        }
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        Ok(Self {
            host: dec.decode_str(STRING_SIZE)?,
            cpu: dec.decode_str(STRING_SIZE)?,
            os: dec.decode_str(STRING_SIZE)?,
            version: dec.decode_str(STRING_SIZE)?,
        })
    }
}

fn describe_cpu(cpuinfo: &str) -> String {
    let cores = cpuinfo
        .lines()
        .filter(|line| line.starts_with("processor"))
        .count();
    let model = cpuinfo
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "model name").then(|| value.split_whitespace().collect::<Vec<_>>().join(" "))
        })
        .unwrap_or_else(|| "unknown".into());

    match cores {
        1 => model,
        2 => format!("Dual-Core {model}"),
        4 => format!("Quad-Core {model}"),
        n => format!("{n} Cores: {model}"),
    }
}

pub struct Conf;

impl Backend for Conf {
    fn configure(&self, _params: &mut ParamTable) {}

    fn open_channel(&mut self, _sess: &mut Session) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, _sess: &mut Session) -> Result<()> {
        Ok(())
    }

    fn client(&mut self, sess: &mut Session) -> Result<Outcome> {
        let mut buf = [0u8; NODE_INFO_SIZE];
        sess.recv_mesg(&mut buf, "receiving node description")?;
        Ok(Outcome::Conf {
            local: NodeInfo::local(),
            remote: NodeInfo::decode(&buf)?,
        })
    }

    fn server(&mut self, sess: &mut Session) -> Result<Disposition> {
        sess.send_mesg(&NodeInfo::local().encode(), "sending node description")?;
        Ok(Disposition::Continue)
    }
}

pub struct Quit;

impl Backend for Quit {
    fn configure(&self, _params: &mut ParamTable) {}

    fn open_channel(&mut self, _sess: &mut Session) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, _sess: &mut Session) -> Result<()> {
        Ok(())
    }

    fn client(&mut self, sess: &mut Session) -> Result<Outcome> {
        sess.synchronize("quit")?;
        Ok(Outcome::Quit)
    }

    fn server(&mut self, sess: &mut Session) -> Result<Disposition> {
        sess.synchronize("quit")?;
        info!("{} asked the server to quit", sess.peer_addr());
        Ok(Disposition::Quit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_description_counts_cores() {
        let cpuinfo = "\
processor\t: 0
model name\t: Intel(R) Xeon(R)   CPU E5-2680 v4 @ 2.40GHz
processor\t: 1
model name\t: Intel(R) Xeon(R)   CPU E5-2680 v4 @ 2.40GHz
";
        assert_eq!(
            describe_cpu(cpuinfo),
            "Dual-Core Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz"
        );
        assert_eq!(describe_cpu(""), "0 Cores: unknown");
    }

    #[test]
    fn node_info_fits_fixed_fields() {
        let info = NodeInfo {
            host: "node1".into(),
            cpu: "x".repeat(STRING_SIZE + 5),
            os: "Linux 6.1".into(),
            version: VERSION.to_string(),
        };
        let buf = info.encode();
        assert_eq!(buf.len(), NODE_INFO_SIZE);
        let decoded = NodeInfo::decode(&buf).unwrap();
        assert_eq!(decoded.host, "node1");
        assert_eq!(decoded.cpu.len(), STRING_SIZE);
        assert_eq!(decoded.version, "0.4.9");
    }
}
