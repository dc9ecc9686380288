use std::{
    net::TcpStream,
    thread::{self, JoinHandle},
    time::Duration,
};

use qpbench_shared::{
    backend::{MeasureKind, Outcome, Report, Workload},
    client::run_test,
    codec::Encoder,
    error::{Error, Result},
    message::{Version, VERSION},
    param::{ParamIndex as P, ParamTable},
    server::Server,
    session::Context,
};

const WAIT: Duration = Duration::from_secs(5);

fn start_server() -> (u16, JoinHandle<Result<()>>) {
    let server = Server::bind(0, Context::default()).unwrap();
    let port = server.local_port().unwrap();
    (port, thread::spawn(move || server.serve()))
}

fn stop_server(port: u16, handle: JoinHandle<Result<()>>) {
    let mut params = ParamTable::new().unwrap();
    let outcome = run_test("127.0.0.1", port, WAIT, &mut params, Workload::Quit, Context::default())
        .unwrap();
    assert_eq!(outcome, Outcome::Quit);
    handle.join().unwrap().unwrap();
}

fn limited(no_msgs: u32, msg_size: u32) -> ParamTable {
    let mut params = ParamTable::new().unwrap();
    params.bind("no_msgs", Some(P::LNoMsgs), no_msgs).unwrap();
    params.bind("no_msgs", Some(P::RNoMsgs), no_msgs).unwrap();
    params.bind("msg_size", Some(P::LMsgSize), msg_size).unwrap();
    params.bind("msg_size", Some(P::RMsgSize), msg_size).unwrap();
    params
}

fn report(outcome: Outcome) -> Report {
    match outcome {
        Outcome::Report(report) => report,
        other => panic!("expected a report, got {other:?}"),
    }
}

#[test]
fn tcp_bw_streams_until_message_limit() {
    let (port, server) = start_server();
    let mut params = limited(200, 4096);

    let report = report(
        run_test("127.0.0.1", port, WAIT, &mut params, Workload::TcpBw, Context::default())
            .unwrap(),
    );
    assert_eq!(report.measure, MeasureKind::Bandwidth);
    assert_eq!(report.local.sent.msgs, 200);
    assert_eq!(report.local.sent.bytes, 200 * 4096);
    // the receiver stops when the sender says so, after taking in what
    // was sent before the window closed
    assert!(report.remote.received.bytes <= report.local.sent.bytes);

    stop_server(port, server);
}

#[test]
fn tcp_lat_counts_round_trips() {
    let (port, server) = start_server();
    let mut params = limited(50, 1);

    let report = report(
        run_test("127.0.0.1", port, WAIT, &mut params, Workload::TcpLat, Context::default())
            .unwrap(),
    );
    assert_eq!(report.measure, MeasureKind::Latency);
    assert_eq!(report.local.sent.msgs, 50);
    assert_eq!(report.local.received.msgs, 50);
    assert_eq!(report.remote.sent.msgs, 50);

    stop_server(port, server);
}

#[test]
fn message_limit_outlasts_default_time() {
    let (port, server) = start_server();
    let mut params = limited(250_000, 1);

    let report = report(
        run_test("127.0.0.1", port, WAIT, &mut params, Workload::TcpLat, Context::default())
            .unwrap(),
    );
    assert_eq!(report.local.sent.msgs, 250_000);
    assert_eq!(report.local.received.msgs, 250_000);
    assert!(report.results.latency > 0.0);

    stop_server(port, server);
}

#[test]
fn udp_lat_over_loopback() {
    let (port, server) = start_server();
    let mut params = limited(20, 32);

    let report = report(
        run_test("127.0.0.1", port, WAIT, &mut params, Workload::UdpLat, Context::default())
            .unwrap(),
    );
    assert_eq!(report.local.received.msgs, 20);
    assert_eq!(report.local.received.errs, 0);

    stop_server(port, server);
}

#[test]
fn timed_test_runs_for_the_window() {
    let (port, server) = start_server();
    let mut params = ParamTable::new().unwrap();
    params.bind("time", Some(P::LTime), 1u32).unwrap();
    params.bind("time", Some(P::RTime), 1u32).unwrap();

    let report = report(
        run_test("127.0.0.1", port, WAIT, &mut params, Workload::TcpLat, Context::default())
            .unwrap(),
    );
    assert!(report.results.local.time_real >= 0.9);
    assert!(report.local.received.msgs > 0);

    stop_server(port, server);
}

#[test]
fn conf_describes_both_nodes() {
    let (port, server) = start_server();
    let mut params = ParamTable::new().unwrap();

    match run_test("127.0.0.1", port, WAIT, &mut params, Workload::Conf, Context::default())
        .unwrap()
    {
        Outcome::Conf { local, remote } => {
            assert_eq!(local.host, remote.host);
            assert_eq!(remote.version, VERSION.to_string());
        }
        other => panic!("expected node descriptions, got {other:?}"),
    }

    stop_server(port, server);
}

#[test]
fn invalid_request_is_reported_by_server() {
    let (port, server) = start_server();
    let mut params = ParamTable::new().unwrap();
    params.bind("rem_msg_size", Some(P::RMsgSize), 70_000u32).unwrap();
    params.bind("no_msgs", Some(P::LNoMsgs), 1u32).unwrap();

    let err = run_test("127.0.0.1", port, WAIT, &mut params, Workload::UdpBw, Context::default())
        .unwrap_err();
    match err {
        Error::PeerFailed { peer, message } => {
            assert_eq!(peer, "server");
            assert!(message.starts_with("msg_size:"), "{message}");
        }
        other => panic!("unexpected {other}"),
    }

    stop_server(port, server);
}

#[test]
fn rdma_workload_without_device_fails_cleanly() {
    let (port, server) = start_server();
    let mut params = limited(10, 64);

    let err = run_test("127.0.0.1", port, WAIT, &mut params, Workload::RcBw, Context::default())
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)), "{err}");

    stop_server(port, server);
}

#[test]
fn newer_client_is_told_to_upgrade_server() {
    let (port, server) = start_server();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let newer = Version::new(VERSION.major, VERSION.minor + 1, 0);
    let mut enc = Encoder::with_capacity(6);
    newer.encode(&mut enc);
    std::io::Write::write_all(&mut stream, &enc.finish()).unwrap();

    // the server answers with the urgent byte followed by the text
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut reply = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut reply).unwrap();
    let text = String::from_utf8_lossy(&reply);
    assert!(
        text.contains(&format!("upgrade qpbench on server from {VERSION} to {newer}")),
        "{text}"
    );

    stop_server(port, server);
}
