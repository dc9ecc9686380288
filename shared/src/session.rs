//! One client/server conversation: connection setup, request negotiation,
//! the start/stop barrier around the test window, and the final exchange
//! of statistics.

use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    os::fd::{AsFd, BorrowedFd},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use derivative::Derivative;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use quanta::Clock;
use tracing::{debug, info, warn};

use crate::{
    codec::{Decoder, Encoder, U32},
    cpu::TickSource,
    error::{Error, Result},
    message::{NodeStat, Request, Version, REQUEST_SIZE, STAT_SIZE, VERSION, VERSION_SIZE},
    rdma_controller::Device,
};

use self::{
    timer::{Latch, TestTimer},
    urgent::{ERROR_TAG, FAILED, FINISHED},
};

pub mod timer;
pub mod urgent;

/// Rendezvous token exchanged in both directions at each barrier.
pub const SYNC_MARKER: &[u8] = b"SyN";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECT_RETRY: Duration = Duration::from_secs(1);
const ERROR_GRACE: Duration = Duration::from_secs(1);
const ERROR_TEXT_LIMIT: usize = 256;
pub(crate) const IDLE_SLICE_MS: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(self) -> &'static str {
        match self {
            Role::Client => "server",
            Role::Server => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Accepted,
    VersionPending,
    Negotiated,
    Synchronized,
    Running,
    StopPending,
    Exchanged,
    Closed,
}

/// What a ready descriptor should be checked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Interest::Read => PollFlags::POLLIN,
            Interest::Write => PollFlags::POLLOUT,
        }
    }
}

/// Transport providers available to every session of a process.
#[derive(Clone, Default)]
pub struct Context {
    pub rdma: Option<Arc<dyn Device>>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Session {
    role: Role,
    state: State,
    control: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
    req: Request,
    latch: Arc<Latch>,
    timer: TestTimer,
    ticks: TickSource,
    lstat: NodeStat,
    rstat: NodeStat,
    #[derivative(Debug = "ignore")]
    context: Context,
}

impl Session {
    fn new(role: Role, state: State, control: TcpStream, context: Context) -> Result<Self> {
        let peer = control
            .peer_addr()
            .map_err(|e| Error::io("reading peer address", e))?;
        control
            .set_nonblocking(true)
            .map_err(|e| Error::io("setting control socket non-blocking", e))?;
        control
            .set_nodelay(true)
            .map_err(|e| Error::io("setting TCP_NODELAY", e))?;

        let clock = Clock::new();
        let latch = Latch::new(clock.clone())?;

        Ok(Self {
            role,
            state,
            control,
            peer,
            timeout: DEFAULT_TIMEOUT,
            req: Request::default(),
            timer: TestTimer::new(latch.clone()),
            latch,
            ticks: TickSource::new(clock)?,
            lstat: NodeStat::default(),
            rstat: NodeStat::default(),
            context,
        })
    }

    /// Connects to a server, retrying once a second until `wait` elapses.
    pub fn connect(host: &str, port: u16, wait: Duration, context: Context) -> Result<Self> {
        let started = Instant::now();
        let mut attempt = 0u32;

        let stream = loop {
            attempt += 1;
            let result = (host, port)
                .to_socket_addrs()
                .and_then(|mut addrs| {
                    addrs.next().ok_or_else(|| {
                        std::io::Error::new(ErrorKind::NotFound, "host has no addresses")
                    })
                })
                .and_then(|addr| TcpStream::connect_timeout(&addr, CONNECT_RETRY));

            match result {
                Ok(stream) => break stream,
                Err(e) if started.elapsed() + CONNECT_RETRY > wait => {
                    return Err(Error::ConnectTimeout {
                        host: host.to_owned(),
                        port,
                        wait,
                        source: e,
                    });
                }
                Err(e) => {
                    debug!("connect attempt {attempt} to {host}:{port} failed: {e}");
                    thread::sleep(CONNECT_RETRY);
                }
            }
        };

        let session = Self::new(Role::Client, State::Connecting, stream, context)?;
        debug!("connected to {}", session.peer);
        Ok(session)
    }

    pub fn accept(stream: TcpStream, context: Context) -> Result<Self> {
        let session = Self::new(Role::Server, State::Accepted, stream, context)?;
        debug!("accepted connection from {}", session.peer);
        Ok(session)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The negotiated request from this node's point of view.
    pub fn req(&self) -> &Request {
        &self.req
    }

    pub fn latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    pub fn is_finished(&self) -> bool {
        self.latch.is_finished()
    }

    pub fn stat_mut(&mut self) -> &mut NodeStat {
        &mut self.lstat
    }

    pub fn local_stat(&self) -> &NodeStat {
        &self.lstat
    }

    pub fn remote_stat(&self) -> &NodeStat {
        &self.rstat
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn enter(&mut self, state: State) {
        debug!("session {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn apply_timeout(&mut self) {
        if self.req.timeout != 0 {
            self.timeout = Duration::from_secs(self.req.timeout.into());
        }
    }

    /// Client side: adopts `local` and sends `remote` to the server.
    pub fn send_request(&mut self, local: Request, remote: &Request) -> Result<()> {
        self.req = local;
        self.apply_timeout();
        self.send_mesg(&remote.encode(), "sending request")?;
        self.enter(State::Negotiated);
        Ok(())
    }

    /// Server side: reads the version prefix, rejects a mismatch, and only
    /// then reads and decodes the rest of the request.
    pub fn recv_request(&mut self) -> Result<&Request> {
        self.enter(State::VersionPending);

        let mut prefix = [0u8; VERSION_SIZE];
        self.recv_mesg(&mut prefix, "receiving request version")?;
        let version = Version::decode(&mut Decoder::new(&prefix))?;
        Version::check(version, VERSION)?;

        let mut body = [0u8; REQUEST_SIZE - VERSION_SIZE];
        self.recv_mesg(&mut body, "receiving request")?;
        self.req = Request::decode_body(version, &body)?;
        self.apply_timeout();

        self.enter(State::Negotiated);
        Ok(&self.req)
    }

    /// Sends all of `buf` before the message deadline.
    pub fn send_mesg(&mut self, buf: &[u8], what: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut sent = 0;

        while sent < buf.len() {
            self.wait_control(Interest::Write, deadline, what)?;
            match (&self.control).write(&buf[sent..]) {
                Ok(0) => return Err(self.closed(what)),
                Ok(n) => sent += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => return Err(self.closed(what)),
                Err(e) => return Err(Error::io(what, e)),
            }
        }
        Ok(())
    }

    /// Fills `buf` before the message deadline.
    pub fn recv_mesg(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut received = 0;

        while received < buf.len() {
            self.wait_control(Interest::Read, deadline, what)?;
            match (&self.control).read(&mut buf[received..]) {
                Ok(0) => {
                    self.check_urgent()?;
                    return Err(self.closed(what));
                }
                Ok(n) => received += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    return Err(self.closed(what))
                }
                Err(e) => return Err(Error::io(what, e)),
            }
        }
        Ok(())
    }

    pub fn send_u32(&mut self, value: u32, what: &str) -> Result<()> {
        let mut enc = Encoder::with_capacity(U32);
        enc.encode_uint(value.into(), U32);
        self.send_mesg(&enc.finish(), what)
    }

    pub fn recv_u32(&mut self, what: &str) -> Result<u32> {
        let mut buf = [0u8; U32];
        self.recv_mesg(&mut buf, what)?;
        Decoder::new(&buf).decode_u32()
    }

    fn closed(&self, what: &str) -> Error {
        Error::PeerClosed {
            what: what.to_owned(),
        }
    }

    fn wait_control(&mut self, interest: Interest, deadline: Instant, what: &str) -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    what: what.to_owned(),
                });
            }

            let events = interest.flags() | PollFlags::POLLPRI;
            let revents = {
                let mut fds = [PollFd::new(self.control.as_fd(), events)];
                match poll(&mut fds, poll_timeout(remaining)) {
                    Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                    Err(Errno::EINTR) => PollFlags::empty(),
                    Err(e) => return Err(Error::os("poll", e)),
                }
            };

            if revents.contains(PollFlags::POLLPRI) {
                self.check_urgent()?;
            }
            let ready = interest.flags() | PollFlags::POLLERR | PollFlags::POLLHUP;
            if revents.intersects(ready) {
                return Ok(());
            }
        }
    }

    /// Waits for `fd` to become ready during the test window. Returns
    /// `false` once the window has closed; an interrupted wait counts as a
    /// failure unless the window was closed by it.
    pub fn wait_ready(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> Result<bool> {
        loop {
            if self.latch.is_finished() {
                return Ok(false);
            }

            let (ready, urgent) = {
                let mut fds = [
                    PollFd::new(fd, interest.flags()),
                    PollFd::new(self.control.as_fd(), PollFlags::POLLPRI),
                    PollFd::new(self.latch.wake_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::from(IDLE_SLICE_MS)) {
                    Ok(_) => {}
                    Err(Errno::EINTR) if self.latch.is_finished() => return Ok(false),
                    Err(e) => return Err(Error::os("poll", e)),
                }
                let data = fds[0].revents().unwrap_or(PollFlags::empty());
                let control = fds[1].revents().unwrap_or(PollFlags::empty());
                (
                    data.intersects(interest.flags() | PollFlags::POLLERR | PollFlags::POLLHUP),
                    control.contains(PollFlags::POLLPRI),
                )
            };

            if urgent {
                self.check_urgent()?;
            }
            if ready {
                return Ok(true);
            }
        }
    }

    /// Cheap check for a peer notification, for loops that never block in
    /// [`Session::wait_ready`].
    pub fn poll_urgent(&mut self) -> Result<()> {
        let urgent = {
            let mut fds = [PollFd::new(self.control.as_fd(), PollFlags::POLLPRI)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => return Err(Error::os("poll", e)),
            }
        };
        if urgent {
            self.check_urgent()?;
        }
        Ok(())
    }

    /// Blocks until the test window closes, for nodes with nothing to drive.
    pub fn wait_finished(&mut self) -> Result<()> {
        while !self.latch.is_finished() {
            let urgent = {
                let mut fds = [
                    PollFd::new(self.control.as_fd(), PollFlags::POLLPRI),
                    PollFd::new(self.latch.wake_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::from(IDLE_SLICE_MS)) {
                    Ok(_) => fds[0]
                        .revents()
                        .is_some_and(|r| r.contains(PollFlags::POLLPRI)),
                    Err(Errno::EINTR) => false,
                    Err(e) => return Err(Error::os("poll", e)),
                }
            };
            if urgent {
                self.check_urgent()?;
            }
        }
        Ok(())
    }

    fn check_urgent(&mut self) -> Result<()> {
        match urgent::recv_urgent(&self.control)? {
            None => Ok(()),
            Some(FINISHED) => {
                if self.latch.fire() {
                    debug!("{} finished its test window", self.role.peer());
                }
                Ok(())
            }
            Some(_) => {
                let message = self.drain_error_text();
                Err(Error::PeerFailed {
                    peer: self.role.peer().to_owned(),
                    message,
                })
            }
        }
    }

    fn drain_error_text(&mut self) -> String {
        let deadline = Instant::now() + ERROR_GRACE;
        let mut drained = Vec::new();
        let mut buf = [0u8; 512];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let readable = {
                let mut fds = [PollFd::new(self.control.as_fd(), PollFlags::POLLIN)];
                matches!(poll(&mut fds, poll_timeout(remaining)), Ok(n) if n > 0)
            };
            if !readable {
                break;
            }
            match (&self.control).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => drained.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(_) => break,
            }
        }

        self.enter(State::Closed);
        urgent::extract_error_text(&drained)
    }

    /// Rendezvous with the peer. Nothing measured crosses the barrier.
    pub fn synchronize(&mut self, label: &str) -> Result<()> {
        self.send_mesg(SYNC_MARKER, label)?;
        let mut marker = [0u8; SYNC_MARKER.len()];
        self.recv_mesg(&mut marker, label)?;
        if marker != SYNC_MARKER {
            return Err(Error::Protocol {
                what: "synchronization marker",
                expected: String::from_utf8_lossy(SYNC_MARKER).into_owned(),
                got: String::from_utf8_lossy(&marker).into_owned(),
            });
        }
        debug!("synchronization {label} complete");
        Ok(())
    }

    /// Opens the test window once both nodes are ready.
    pub fn sync_test(&mut self) -> Result<()> {
        // a peer may report finishing while the barrier is still draining
        self.timer.reset();
        self.synchronize("before test")?;
        self.enter(State::Synchronized);
        self.start_test()
    }

    fn start_test(&mut self) -> Result<()> {
        self.lstat = NodeStat {
            no_cpus: self.ticks.no_cpus(),
            no_ticks: self.ticks.no_ticks(),
            ..Default::default()
        };
        self.timer.start(self.req.time)?;
        self.lstat.start = self.ticks.sample()?;
        self.enter(State::Running);
        Ok(())
    }

    /// Closes the window after `count` messages when a message limit was
    /// negotiated. Returns whether the window is now closed.
    pub fn limit_reached(&mut self, count: u64) -> bool {
        if self.req.no_msgs != 0 && count >= u64::from(self.req.no_msgs) && self.latch.fire() {
            debug!("message limit of {} reached", self.req.no_msgs);
        }
        self.latch.is_finished()
    }

    fn stop_test(&mut self) -> Result<()> {
        self.enter(State::StopPending);
        self.timer.stop();
        let at = self
            .latch
            .stop_time()
            .unwrap_or_else(|| self.latch.clock().now());
        self.lstat.end = self.ticks.sample_at(at)?;
        Ok(())
    }

    /// Closes the window, tells the peer, and swaps statistics with it.
    pub fn finish(&mut self) -> Result<()> {
        self.stop_test()?;
        urgent::send_urgent(&self.control, FINISHED)?;
        self.synchronize("after test")?;

        self.send_mesg(&self.lstat.encode(), "sending statistics")?;
        let mut buf = [0u8; STAT_SIZE];
        self.recv_mesg(&mut buf, "receiving statistics")?;
        self.rstat = NodeStat::decode(&buf)?;
        self.synchronize("after exchange")?;

        self.enter(State::Exchanged);
        Ok(())
    }

    /// Tells the peer about a fatal error and gives it a moment to read
    /// the text before the connection goes away.
    pub fn notify_failure(&mut self, err: &Error) {
        if self.state == State::Closed || err.came_from_peer() {
            return;
        }
        self.enter(State::Closed);

        if let Err(e) = urgent::send_urgent(&self.control, FAILED) {
            warn!("could not notify {} of failure: {e}", self.role.peer());
            return;
        }

        let mut text = ERROR_TAG.to_vec();
        let message = err.to_string();
        text.extend_from_slice(&message.as_bytes()[..message.len().min(ERROR_TEXT_LIMIT)]);
        text.push(b'\n');

        let deadline = Instant::now() + ERROR_GRACE;
        let mut sent = 0;
        while sent < text.len() && Instant::now() < deadline {
            match (&self.control).write(&text[sent..]) {
                Ok(n) => sent += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break,
            }
        }
        let _ = self.control.shutdown(Shutdown::Write);

        // wait for the peer to read the text and hang up
        let mut sink = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let readable = {
                let mut fds = [PollFd::new(self.control.as_fd(), PollFlags::POLLIN)];
                matches!(poll(&mut fds, poll_timeout(remaining)), Ok(n) if n > 0)
            };
            if !readable {
                break;
            }
            match (&self.control).read(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(_) => break,
            }
        }
    }

    pub fn close(&mut self) {
        if self.state != State::Closed {
            let _ = self.control.shutdown(Shutdown::Both);
            self.enter(State::Closed);
            info!("session with {} closed", self.peer);
        }
    }
}

pub(crate) fn poll_timeout(remaining: Duration) -> PollTimeout {
    let ms = remaining.as_millis().clamp(1, u128::from(u16::MAX)) as u16;
    PollTimeout::from(ms)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::message::Tick;

    fn pair() -> (Session, Session) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = thread::spawn(move || {
            Session::connect("127.0.0.1", port, Duration::from_secs(5), Context::default())
                .unwrap()
        });
        let (stream, _) = listener.accept().unwrap();
        let server = Session::accept(stream, Context::default()).unwrap();
        (client.join().unwrap(), server)
    }

    #[test]
    fn request_negotiation() {
        let (mut client, mut server) = pair();
        let local = Request {
            msg_size: 100,
            ..Default::default()
        };
        let remote = Request {
            msg_size: 200,
            req_index: 7,
            time: 1,
            ..Default::default()
        };
        client.send_request(local, &remote).unwrap();
        let req = server.recv_request().unwrap();
        assert_eq!(req, &remote);
        assert_eq!(client.req().msg_size, 100);
        assert_eq!(server.state(), State::Negotiated);
    }

    #[test]
    fn version_prefix_checked_first() {
        let (mut client, mut server) = pair();
        let old = Request {
            version: Version::new(VERSION.major, VERSION.minor, VERSION.inc + 1),
            ..Default::default()
        };
        // only the prefix is sent, the server must not wait for the rest
        client
            .send_mesg(&old.encode()[..VERSION_SIZE], "sending prefix")
            .unwrap();
        match server.recv_request().unwrap_err() {
            Error::VersionMismatch { side, .. } => assert_eq!(side, "server"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn failure_text_reaches_peer() {
        let (mut client, mut server) = pair();
        let notifier = thread::spawn(move || {
            server.notify_failure(&Error::invalid("msg_size", "must be nonzero"));
        });

        let mut buf = [0u8; 8];
        let err = client.recv_mesg(&mut buf, "waiting").unwrap_err();
        notifier.join().unwrap();
        match err {
            Error::PeerFailed { peer, message } => {
                assert_eq!(peer, "server");
                assert_eq!(message, "msg_size: must be nonzero");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn recv_times_out() {
        let (mut client, _server) = pair();
        client.timeout = Duration::from_millis(200);
        let mut buf = [0u8; 1];
        assert!(matches!(
            client.recv_mesg(&mut buf, "waiting").unwrap_err(),
            Error::Timeout { .. }
        ));
    }

    #[test]
    fn peer_finish_closes_window() {
        let (mut client, mut server) = pair();
        client.req.no_msgs = 3;
        let server = thread::spawn(move || {
            server.sync_test().unwrap();
            server.wait_finished().unwrap();
            server.finish().unwrap();
            server
        });

        client.sync_test().unwrap();
        assert!(!client.limit_reached(2));
        assert!(client.limit_reached(3));
        client.stat_mut().account(crate::message::Direction::Sent, 10);
        client.finish().unwrap();

        let server = server.join().unwrap();
        assert_eq!(client.remote_stat(), server.local_stat());
        assert_eq!(server.remote_stat().sent.bytes, 10);
        assert_eq!(client.state(), State::Exchanged);
        assert!(client.local_stat().end[Tick::Real as usize] >= client.local_stat().start[Tick::Real as usize]);
    }

    #[test]
    fn connect_gives_up_after_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = Session::connect("127.0.0.1", port, Duration::from_millis(100), Context::default())
            .unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout { .. }));
    }
}
