//! Reduction of the two nodes' raw counters into the reported metrics.

use crate::message::{NodeStat, Tick, Transfer};

const GB: f64 = 1e9;

/// CPU and time breakdown of one node. CPU figures are fractions of one
/// processor, so a busy multi-core node may exceed 1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeResult {
    pub time_real: f64,
    pub time_cpu: f64,
    pub cpu_user: f64,
    pub cpu_kernel: f64,
    pub cpu_intr: f64,
    pub cpu_io_wait: f64,
    pub cpu_idle: f64,
    pub cpu_total: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Results {
    pub local: NodeResult,
    pub remote: NodeResult,
    /// Seconds per message.
    pub latency: f64,
    /// Messages per second.
    pub msg_rate: f64,
    /// Bytes per second.
    pub send_bw: f64,
    pub recv_bw: f64,
    /// CPU seconds per gigabyte.
    pub send_cost: f64,
    pub recv_cost: f64,
}

/// Adds the counters `remote` kept on our behalf into our own.
pub fn combine_remote_attributed(local: &mut NodeStat, remote: &NodeStat) {
    local.sent = local.sent.combine(remote.rem_sent);
    local.received = local.received.combine(remote.rem_received);
}

pub fn reduce_node(stat: &NodeStat) -> NodeResult {
    let real = stat.elapsed(Tick::Real);
    if real == 0 {
        return NodeResult::default();
    }
    let real = real as f64;
    let delta = |tick: Tick| stat.elapsed(tick) as f64;

    let cpu_user = (delta(Tick::User) + delta(Tick::Nice)) / real;
    let cpu_kernel = (delta(Tick::Kernel) + delta(Tick::Steal)) / real;
    let cpu_intr = (delta(Tick::Irq) + delta(Tick::SoftIrq)) / real;
    let cpu_io_wait = delta(Tick::IoWait) / real;
    let cpu_idle = delta(Tick::Idle) / real;

    let busy = delta(Tick::User)
        + delta(Tick::Nice)
        + delta(Tick::Kernel)
        + delta(Tick::Steal)
        + delta(Tick::Irq)
        + delta(Tick::SoftIrq)
        + delta(Tick::IoWait);

    let ticks = stat.no_ticks as f64;
    NodeResult {
        time_real: ratio(real, ticks),
        time_cpu: ratio(busy, ticks),
        cpu_user,
        cpu_kernel,
        cpu_intr,
        cpu_io_wait,
        cpu_idle,
        cpu_total: cpu_user + cpu_kernel + cpu_intr + cpu_io_wait,
    }
}

/// Computes the final metrics from both nodes' counters. The counters must
/// already include the remotely attributed traffic.
pub fn reduce_results(local: &NodeStat, remote: &NodeStat) -> Results {
    let l = reduce_node(local);
    let r = reduce_node(remote);

    let loc_time = l.time_real;
    let rem_time = r.time_real;
    if loc_time == 0.0 || rem_time == 0.0 {
        return Results::default();
    }
    let mid_time = (loc_time + rem_time) / 2.0;

    let mut results = Results {
        local: l,
        remote: r,
        ..Default::default()
    };

    let no_msgs = local.received.msgs + remote.received.msgs;
    if no_msgs != 0 {
        results.latency = loc_time / no_msgs as f64;
    }

    let rate = |loc: u64, rem: u64| match (loc, rem) {
        (0, 0) => 0.0,
        (loc, 0) => loc as f64 / loc_time,
        (0, rem) => rem as f64 / rem_time,
        (loc, rem) => (loc + rem) as f64 / mid_time,
    };

    results.msg_rate = rate(local.received.msgs, remote.received.msgs);
    results.send_bw = rate(local.sent.bytes, remote.sent.bytes);
    results.recv_bw = rate(local.received.bytes, remote.received.bytes);

    results.send_cost = exclusive_cost(
        (&local.sent, &local.received, l.time_cpu),
        (&remote.sent, &remote.received, r.time_cpu),
    );
    results.recv_cost = exclusive_cost(
        (&local.received, &local.sent, l.time_cpu),
        (&remote.received, &remote.sent, r.time_cpu),
    );

    results
}

/// Cost of one role, attributable only when a single node performed it and
/// did nothing in the other direction.
fn exclusive_cost(
    (loc_role, loc_other, loc_cpu): (&Transfer, &Transfer, f64),
    (rem_role, rem_other, rem_cpu): (&Transfer, &Transfer, f64),
) -> f64 {
    if loc_role.bytes != 0 && loc_other.bytes == 0 && rem_role.bytes == 0 {
        ratio(loc_cpu * GB, loc_role.bytes as f64)
    } else if rem_role.bytes != 0 && rem_other.bytes == 0 && loc_role.bytes == 0 {
        ratio(rem_cpu * GB, rem_role.bytes as f64)
    } else {
        0.0
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, T_N};

    const HZ: u32 = 100;

    fn node(seconds: u64) -> NodeStat {
        let mut stat = NodeStat {
            no_cpus: 4,
            no_ticks: HZ,
            ..Default::default()
        };
        stat.start = [1_000; T_N];
        stat.end = [1_000; T_N];
        stat.end[Tick::Real as usize] += seconds * HZ as u64;
        stat
    }

    #[test]
    fn zero_elapsed_gives_zero_breakdown() {
        let mut stat = node(0);
        stat.end[Tick::User as usize] += 50;
        assert_eq!(reduce_node(&stat), NodeResult::default());
    }

    #[test]
    fn node_breakdown() {
        let mut stat = node(2);
        stat.end[Tick::User as usize] += 60;
        stat.end[Tick::Nice as usize] += 20;
        stat.end[Tick::Kernel as usize] += 30;
        stat.end[Tick::Steal as usize] += 10;
        stat.end[Tick::Irq as usize] += 4;
        stat.end[Tick::SoftIrq as usize] += 6;
        stat.end[Tick::IoWait as usize] += 20;
        stat.end[Tick::Idle as usize] += 600;

        let node = reduce_node(&stat);
        assert_eq!(node.time_real, 2.0);
        assert_eq!(node.time_cpu, 1.5);
        assert_eq!(node.cpu_user, 0.4);
        assert_eq!(node.cpu_kernel, 0.2);
        assert_eq!(node.cpu_intr, 0.05);
        assert_eq!(node.cpu_io_wait, 0.1);
        assert_eq!(node.cpu_idle, 3.0);
        assert!((node.cpu_total - 0.75).abs() < 1e-12);
    }

    #[test]
    fn one_sided_message_rate() {
        let mut local = node(10);
        let remote = node(10);
        local.received.msgs = 100;

        let results = reduce_results(&local, &remote);
        assert_eq!(results.msg_rate, 10.0);
        assert_eq!(results.latency, 0.1);
    }

    #[test]
    fn both_sides_use_average_time() {
        let mut local = node(10);
        let mut remote = node(30);
        local.received.msgs = 100;
        remote.received.msgs = 300;
        local.sent.bytes = 1000;
        remote.sent.bytes = 1000;

        let results = reduce_results(&local, &remote);
        assert_eq!(results.msg_rate, 20.0);
        assert_eq!(results.send_bw, 100.0);
        assert_eq!(results.recv_bw, 0.0);
        // both nodes sent, so neither owns the cost
        assert_eq!(results.send_cost, 0.0);
    }

    #[test]
    fn remote_only_rate_uses_remote_time() {
        let local = node(10);
        let mut remote = node(4);
        remote.received.bytes = 400;

        let results = reduce_results(&local, &remote);
        assert_eq!(results.recv_bw, 100.0);
    }

    #[test]
    fn exclusive_send_cost() {
        let mut local = node(10);
        let remote = node(10);
        local.sent.bytes = 1_000_000_000;
        local.end[Tick::User as usize] += 2 * HZ as u64;

        let results = reduce_results(&local, &remote);
        assert_eq!(results.send_cost, 2.0);
        assert_eq!(results.recv_cost, 0.0);
    }

    #[test]
    fn exclusive_receive_cost_on_remote() {
        let mut local = node(10);
        let mut remote = node(10);
        local.sent.bytes = 500_000_000;
        remote.received.bytes = 500_000_000;
        remote.end[Tick::Kernel as usize] += HZ as u64;

        let results = reduce_results(&local, &remote);
        assert_eq!(results.recv_cost, 2.0);
        assert_eq!(results.send_cost, 0.0);
    }

    #[test]
    fn zero_elapsed_side_zeroes_everything() {
        let mut local = node(10);
        let remote = node(0);
        local.received.msgs = 100;
        assert_eq!(reduce_results(&local, &remote), Results::default());
    }

    #[test]
    fn combine_with_zero_is_identity() {
        let x = Transfer {
            bytes: 10,
            msgs: 2,
            errs: 1,
        };
        assert_eq!(Transfer::default().combine(x), x);
        assert_eq!(x.combine(Transfer::default()), x);
    }

    #[test]
    fn combine_is_associative_and_commutative() {
        let a = Transfer { bytes: 1, msgs: 2, errs: 3 };
        let b = Transfer { bytes: 40, msgs: 50, errs: 60 };
        let c = Transfer { bytes: 700, msgs: 800, errs: 900 };
        assert_eq!(a.combine(b).combine(c), a.combine(b.combine(c)));
        assert_eq!(a.combine(b), b.combine(a));
    }

    #[test]
    fn passive_target_is_credited_from_peer_report() {
        let mut writer = node(10);
        let mut target = node(10);
        for _ in 0..4 {
            writer.account(Direction::Sent, 1024);
            writer.account(Direction::RemoteReceived, 1024);
        }

        let writer_copy = writer;
        combine_remote_attributed(&mut target, &writer_copy);
        combine_remote_attributed(&mut writer, &NodeStat::default());

        assert_eq!(target.received.bytes, 4096);
        assert_eq!(target.received.msgs, 4);
        assert_eq!(writer.received, Transfer::default());

        let results = reduce_results(&writer, &target);
        assert_eq!(results.send_bw, 409.6);
        assert_eq!(results.recv_bw, 409.6);
    }
}
