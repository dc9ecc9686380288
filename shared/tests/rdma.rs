//! RDMA workloads end to end over the in-process fabric.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use qpbench_shared::{
    backend::{MeasureKind, Outcome, Report, Workload},
    client::run_test,
    error::{Error, Result},
    param::{ParamIndex as P, ParamTable},
    rdma_controller::SoftFabric,
    server::Server,
    session::Context,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    port: u16,
    context: Context,
    server: Option<JoinHandle<Result<()>>>,
}

impl Harness {
    fn start() -> Self {
        let context = Context {
            rdma: Some(Arc::new(SoftFabric::new())),
        };
        let server = Server::bind(0, context.clone()).unwrap();
        let port = server.local_port().unwrap();
        Self {
            port,
            context,
            server: Some(thread::spawn(move || server.serve())),
        }
    }

    fn run(&self, workload: Workload, params: &mut ParamTable) -> Result<Outcome> {
        run_test("127.0.0.1", self.port, WAIT, params, workload, self.context.clone())
    }

    fn report(&self, workload: Workload, params: &mut ParamTable) -> Report {
        match self.run(workload, params).unwrap() {
            Outcome::Report(report) => report,
            other => panic!("expected a report, got {other:?}"),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let Ok(mut params) = ParamTable::new() else {
            return;
        };
        if self.run(Workload::Quit, &mut params).is_ok() {
            if let Some(server) = self.server.take() {
                let _ = server.join();
            }
        }
    }
}

fn limited(no_msgs: u32) -> ParamTable {
    let mut params = ParamTable::new().unwrap();
    params.bind("no_msgs", Some(P::LNoMsgs), no_msgs).unwrap();
    params.bind("no_msgs", Some(P::RNoMsgs), no_msgs).unwrap();
    params
}

fn timed(seconds: u32) -> ParamTable {
    let mut params = ParamTable::new().unwrap();
    params.bind("time", Some(P::LTime), seconds).unwrap();
    params.bind("time", Some(P::RTime), seconds).unwrap();
    params
}

fn with_size(mut params: ParamTable, msg_size: u32) -> ParamTable {
    params.bind("msg_size", Some(P::LMsgSize), msg_size).unwrap();
    params.bind("msg_size", Some(P::RMsgSize), msg_size).unwrap();
    params
}

#[test]
fn rc_bw_moves_every_message() {
    let harness = Harness::start();
    let mut params = with_size(limited(500), 1024);

    let report = harness.report(Workload::RcBw, &mut params);
    assert_eq!(report.measure, MeasureKind::Bandwidth);
    assert_eq!(report.local.sent.msgs, 500);
    assert_eq!(report.local.sent.bytes, 500 * 1024);
    assert!(report.remote.received.msgs > 0);
    assert_eq!(report.local.sent.errs, 0);
}

#[test]
fn flipped_rc_bw_receives_on_client() {
    let harness = Harness::start();
    let mut params = with_size(limited(100), 256);
    params.bind("flip", Some(P::LFlip), 1u32).unwrap();
    params.bind("flip", Some(P::RFlip), 1u32).unwrap();

    let report = harness.report(Workload::RcBw, &mut params);
    assert_eq!(report.local.received.msgs, 100);
    assert_eq!(report.local.sent.msgs, 0);
}

#[test]
fn rc_lat_round_trips() {
    let harness = Harness::start();
    let mut params = limited(100);

    let report = harness.report(Workload::RcLat, &mut params);
    assert_eq!(report.measure, MeasureKind::Latency);
    assert_eq!(report.local.received.msgs, 100);
    assert_eq!(report.remote.received.msgs, 100);
}

#[test]
fn ud_lat_reserves_routing_header() {
    let harness = Harness::start();
    let mut params = with_size(limited(50), 512);

    let report = harness.report(Workload::UdLat, &mut params);
    assert_eq!(report.local.received.msgs, 50);
    assert_eq!(report.local.received.bytes, 50 * 512);
}

#[test]
fn ud_rejects_messages_over_mtu() {
    let harness = Harness::start();
    let mut params = with_size(limited(10), 4096);
    params.bind("mtu_size", Some(P::LMtuSize), 1024u32).unwrap();
    params.bind("mtu_size", Some(P::RMtuSize), 1024u32).unwrap();

    let err = harness.run(Workload::UdBw, &mut params).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }), "{err}");
}

#[test]
fn write_bw_credits_the_passive_target() {
    let harness = Harness::start();
    let mut params = with_size(limited(300), 2048);

    let report = harness.report(Workload::RcRdmaWriteBw, &mut params);
    assert_eq!(report.local.sent.msgs, 300);
    // the target never polled; its receive side comes from the writer
    assert_eq!(report.remote.received.bytes, 300 * 2048);
    assert_eq!(report.remote.received.msgs, 300);
}

#[test]
fn write_lat_with_immediate() {
    let harness = Harness::start();
    let mut params = limited(40);

    let report = harness.report(Workload::UcRdmaWriteLat, &mut params);
    assert_eq!(report.local.received.msgs, 40);
}

#[test]
fn write_poll_lat_spins_on_last_byte() {
    let harness = Harness::start();
    let mut params = with_size(limited(300), 64);

    let report = harness.report(Workload::RcRdmaWritePollLat, &mut params);
    assert_eq!(report.local.received.msgs, 300);
    assert_eq!(report.remote.received.msgs, 300);
}

#[test]
fn read_bw_charges_remote_sender() {
    let harness = Harness::start();
    let mut params = with_size(limited(64), 4096);

    let report = harness.report(Workload::RcRdmaReadBw, &mut params);
    assert_eq!(report.local.received.msgs, 64);
    assert_eq!(report.remote.sent.bytes, 64 * 4096);
}

#[test]
fn verified_atomics_see_their_own_updates() {
    let harness = Harness::start();
    for workload in [Workload::VerRcFetchAdd, Workload::VerRcCompareSwap] {
        let mut params = limited(200);
        let report = harness.report(workload, &mut params);
        assert_eq!(report.measure, MeasureKind::MessageRate);
        assert_eq!(report.local.received.msgs, 200, "{workload}");
        assert_eq!(report.local.received.errs, 0, "{workload}");
    }
}

#[test]
fn bidirectional_bw_in_event_mode() {
    let harness = Harness::start();
    let mut params = with_size(timed(1), 512);
    params.bind("poll_mode", Some(P::LPollMode), 0u32).unwrap();
    params.bind("poll_mode", Some(P::RPollMode), 0u32).unwrap();

    let report = harness.report(Workload::RcBiBw, &mut params);
    assert_eq!(report.measure, MeasureKind::BandwidthSendReceive);
    assert!(report.local.received.msgs > 0);
    assert!(report.local.sent.msgs > 0);
    assert!(report.results.local.time_real >= 0.9);
    assert!(report.results.send_bw > 0.0);
    assert!(report.results.recv_bw > 0.0);
}

#[test]
fn timed_one_sided_windows_report_rates() {
    let harness = Harness::start();

    let mut params = with_size(timed(1), 2048);
    let report = harness.report(Workload::RcRdmaWriteBw, &mut params);
    assert!(report.local.sent.msgs > 0);
    assert_eq!(report.remote.received.bytes, report.local.sent.bytes);
    assert!(report.results.recv_bw > 0.0);

    let mut params = timed(1);
    let report = harness.report(Workload::RcFetchAddMr, &mut params);
    assert_eq!(report.measure, MeasureKind::MessageRate);
    assert!(report.local.received.msgs > 0);
    assert!(report.results.msg_rate > 0.0);
}

#[test]
fn connection_manager_is_refused() {
    let harness = Harness::start();
    let mut params = limited(10);
    params.bind("use_cm", Some(P::LUseCm), 1u32).unwrap();

    let err = harness.run(Workload::RcBw, &mut params).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)), "{err}");
}
