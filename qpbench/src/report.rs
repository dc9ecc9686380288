//! Plain-text rendering of what a test produced.

use std::fmt::Write;

use qpbench_shared::{
    backend::{MeasureKind, NodeInfo, Outcome, Report},
    stats::NodeResult,
};

const RATE_UNITS: [&str; 5] = ["", "K", "M", "G", "T"];

/// Scales `value` by powers of 1000 and keeps three significant digits.
fn scaled(value: f64, unit: &str) -> String {
    let mut value = value;
    let mut prefix = 0;
    while value >= 1000.0 && prefix + 1 < RATE_UNITS.len() {
        value /= 1000.0;
        prefix += 1;
    }
    format!("{} {}{unit}", significant(value), RATE_UNITS[prefix])
}

fn seconds(value: f64) -> String {
    let (value, unit) = match value {
        v if v >= 1.0 => (v, "sec"),
        v if v >= 1e-3 => (v * 1e3, "ms"),
        v if v >= 1e-6 => (v * 1e6, "us"),
        v => (v * 1e9, "ns"),
    };
    format!("{} {unit}", significant(value))
}

fn significant(value: f64) -> String {
    match value {
        v if v >= 100.0 => format!("{v:.0}"),
        v if v >= 10.0 => format!("{v:.1}"),
        v => format!("{v:.2}"),
    }
}

fn field(out: &mut String, name: &str, value: String) {
    let _ = writeln!(out, "    {name:<14}=  {value}");
}

fn cpus(out: &mut String, side: &str, node: &NodeResult) {
    field(out, &format!("{side}_cpus_used"), format!("{:.0} % cpus", node.cpu_total * 100.0));
}

pub fn render(outcome: &Outcome, verbose: bool) -> String {
    match outcome {
        Outcome::Report(report) => render_report(report, verbose),
        Outcome::Conf { local, remote } => render_conf(local, remote),
        Outcome::Quit => "quit:\n    server asked to stop\n".to_owned(),
    }
}

fn render_report(report: &Report, verbose: bool) -> String {
    let results = &report.results;
    let mut out = format!("{}:\n", report.workload);

    match report.measure {
        MeasureKind::Latency => field(&mut out, "latency", seconds(results.latency)),
        MeasureKind::MessageRate => field(&mut out, "msg_rate", scaled(results.msg_rate, "/sec")),
        MeasureKind::Bandwidth => {
            field(&mut out, "bw", scaled(results.recv_bw, "B/sec"));
            if verbose {
                field(&mut out, "msg_rate", scaled(results.msg_rate, "/sec"));
            }
        }
        MeasureKind::BandwidthSendReceive => {
            field(&mut out, "send_bw", scaled(results.send_bw, "B/sec"));
            field(&mut out, "recv_bw", scaled(results.recv_bw, "B/sec"));
        }
    }

    if verbose {
        field(&mut out, "msg_size", scaled(f64::from(report.msg_size), "B"));
        field(&mut out, "time", seconds(results.local.time_real));
        cpus(&mut out, "loc", &results.local);
        cpus(&mut out, "rem", &results.remote);
        if results.send_cost > 0.0 {
            field(&mut out, "send_cost", format!("{:.3} sec/GB", results.send_cost));
        }
        if results.recv_cost > 0.0 {
            field(&mut out, "recv_cost", format!("{:.3} sec/GB", results.recv_cost));
        }
        for (side, stat) in [("loc", &report.local), ("rem", &report.remote)] {
            let errs = stat.sent.errs + stat.received.errs;
            if errs > 0 {
                field(&mut out, &format!("{side}_errors"), errs.to_string());
            }
        }
    }
    out
}

fn render_conf(local: &NodeInfo, remote: &NodeInfo) -> String {
    let mut out = String::from("conf:\n");
    for (side, info) in [("loc", local), ("rem", remote)] {
        field(&mut out, &format!("{side}_node"), info.host.clone());
        field(&mut out, &format!("{side}_cpu"), info.cpu.clone());
        field(&mut out, &format!("{side}_os"), info.os.clone());
        field(&mut out, &format!("{side}_qpbench"), info.version.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_by_thousands() {
        assert_eq!(scaled(117_000_000.0, "B/sec"), "117 MB/sec");
        assert_eq!(scaled(1_234.0, "/sec"), "1.23 K/sec");
        assert_eq!(scaled(12.0, "B"), "12.0 B");
    }

    #[test]
    fn picks_time_unit() {
        assert_eq!(seconds(0.0000301), "30.1 us");
        assert_eq!(seconds(2.0), "2.00 sec");
        assert_eq!(seconds(0.000_000_5), "500 ns");
    }

    #[test]
    fn conf_lists_both_nodes() {
        let node = |host: &str| NodeInfo {
            host: host.into(),
            cpu: "Quad-Core Xeon".into(),
            os: "Linux 6.1".into(),
            version: "0.4.9".into(),
        };
        let text = render(
            &Outcome::Conf {
                local: node("a"),
                remote: node("b"),
            },
            false,
        );
        assert!(text.contains("loc_node      =  a"));
        assert!(text.contains("rem_node      =  b"));
    }
}
