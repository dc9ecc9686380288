//! Stream and datagram socket workloads.

use std::{
    hint::black_box,
    io::{ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    os::fd::AsFd,
    time::Instant,
};

use nix::{
    poll::{poll, PollFd, PollFlags},
    sys::socket::{setsockopt, sockopt},
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    message::{Direction, Request},
    param::{ParamIndex as P, ParamTable},
    session::{poll_timeout, Interest, Role, Session},
};

use super::{apply_affinity, use_common, Backend, Workload};

const TCP_BW_SIZE: u32 = 64 * 1024;
const UDP_BW_SIZE: u32 = 32 * 1024;
const LAT_SIZE: u32 = 1;
const MAX_DATAGRAM: u32 = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    /// One node sends, the other receives.
    Stream,
    /// One message each way per round trip.
    PingPong,
}

enum Channel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// How one attempt to move a message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Complete,
    /// The window closed after this many bytes had moved.
    Partial(usize),
    /// A datagram was lost, cut short or refused.
    Failed,
}

pub struct Socket {
    proto: Proto,
    pattern: Pattern,
    channel: Option<Channel>,
}

impl Socket {
    pub fn new(workload: Workload) -> Self {
        let (proto, pattern) = match workload {
            Workload::TcpBw => (Proto::Tcp, Pattern::Stream),
            Workload::TcpLat => (Proto::Tcp, Pattern::PingPong),
            Workload::UdpBw => (Proto::Udp, Pattern::Stream),
            _ => (Proto::Udp, Pattern::PingPong),
        };
        Self {
            proto,
            pattern,
            channel: None,
        }
    }

    fn default_size(&self) -> u32 {
        match (self.proto, self.pattern) {
            (_, Pattern::PingPong) => LAT_SIZE,
            (Proto::Tcp, Pattern::Stream) => TCP_BW_SIZE,
            (Proto::Udp, Pattern::Stream) => UDP_BW_SIZE,
        }
    }

    fn check(&self, req: &Request) -> Result<()> {
        if req.msg_size == 0 {
            return Err(Error::invalid("msg_size", "must be nonzero"));
        }
        if self.proto == Proto::Udp && req.msg_size > MAX_DATAGRAM {
            return Err(Error::invalid(
                "msg_size",
                format!("{} exceeds the {MAX_DATAGRAM} byte datagram limit", req.msg_size),
            ));
        }
        if req.alt_port > u32::from(u16::MAX) {
            return Err(Error::invalid("alt_port", format!("{} is not a port", req.alt_port)));
        }
        Ok(())
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| Error::Internal("data channel used before it was opened".into()))
    }

    fn send_unit(&self, sess: &mut Session, buf: &[u8]) -> Result<Unit> {
        match self.channel()? {
            Channel::Tcp(stream) => {
                let mut sent = 0;
                while sent < buf.len() {
                    match (&*stream).write(&buf[sent..]) {
                        Ok(n) => sent += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            if !sess.wait_ready(stream.as_fd(), Interest::Write)? {
                                return Ok(Unit::Partial(sent));
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(_) if sess.is_finished() => return Ok(Unit::Partial(sent)),
                        Err(e) => return Err(Error::io("sending data", e)),
                    }
                }
                Ok(Unit::Complete)
            }
            Channel::Udp(socket) => loop {
                match socket.send(buf) {
                    Ok(n) if n == buf.len() => return Ok(Unit::Complete),
                    Ok(_) => return Ok(Unit::Failed),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if !sess.wait_ready(socket.as_fd(), Interest::Write)? {
                            return Ok(Unit::Partial(0));
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("datagram send failed: {e}");
                        return Ok(Unit::Failed);
                    }
                }
            },
        }
    }

    fn recv_unit(&self, sess: &mut Session, buf: &mut [u8]) -> Result<Unit> {
        match self.channel()? {
            Channel::Tcp(stream) => {
                let mut got = 0;
                while got < buf.len() {
                    match (&*stream).read(&mut buf[got..]) {
                        Ok(0) if sess.is_finished() => return Ok(Unit::Partial(got)),
                        Ok(0) => {
                            return Err(Error::PeerClosed {
                                what: "receiving data".into(),
                            })
                        }
                        Ok(n) => got += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            if !sess.wait_ready(stream.as_fd(), Interest::Read)? {
                                return Ok(Unit::Partial(got));
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(_) if sess.is_finished() => return Ok(Unit::Partial(got)),
                        Err(e) => return Err(Error::io("receiving data", e)),
                    }
                }
                Ok(Unit::Complete)
            }
            Channel::Udp(socket) => loop {
                match socket.recv(buf) {
                    Ok(n) if n == buf.len() => return Ok(Unit::Complete),
                    Ok(_) => return Ok(Unit::Failed),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if !sess.wait_ready(socket.as_fd(), Interest::Read)? {
                            return Ok(Unit::Partial(0));
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("datagram receive failed: {e}");
                        return Ok(Unit::Failed);
                    }
                }
            },
        }
    }

    /// Charges one attempt. Returns whether the loop should go on.
    fn settle(sess: &mut Session, unit: Unit, direction: Direction, size: usize) -> bool {
        let stat = sess.stat_mut();
        match unit {
            Unit::Complete => {
                stat.account(direction, size as u64);
                true
            }
            Unit::Partial(bytes) => {
                stat.transfer_mut(direction).bytes += bytes as u64;
                false
            }
            Unit::Failed => {
                stat.account_error(direction);
                true
            }
        }
    }

    fn stream(&self, sess: &mut Session, sender: bool) -> Result<()> {
        let size = sess.req().msg_size as usize;
        let access = sess.req().access_recv != 0;
        let mut buf = vec![0u8; size];
        let mut count = 0u64;

        while !sess.is_finished() {
            let (unit, direction) = if sender {
                (self.send_unit(sess, &buf)?, Direction::Sent)
            } else {
                (self.recv_unit(sess, &mut buf)?, Direction::Received)
            };
            if unit == Unit::Complete {
                count += 1;
                if access {
                    touch(&buf);
                }
            }
            if !Self::settle(sess, unit, direction, size) || sess.limit_reached(count) {
                break;
            }
        }
        Ok(())
    }

    fn ping_pong(&self, sess: &mut Session) -> Result<()> {
        let size = sess.req().msg_size as usize;
        let access = sess.req().access_recv != 0;
        let client = sess.role() == Role::Client;
        let mut buf = vec![0u8; size];
        let mut count = 0u64;

        while !sess.is_finished() {
            for step in 0..2 {
                let sending = (step == 0) == client;
                let (unit, direction) = if sending {
                    (self.send_unit(sess, &buf)?, Direction::Sent)
                } else {
                    (self.recv_unit(sess, &mut buf)?, Direction::Received)
                };
                if unit == Unit::Complete && !sending && access {
                    touch(&buf);
                }
                if !Self::settle(sess, unit, direction, size) {
                    return Ok(());
                }
            }
            count += 1;
            if sess.limit_reached(count) {
                break;
            }
        }
        Ok(())
    }
}

impl Backend for Socket {
    fn configure(&self, params: &mut ParamTable) {
        use_common(params);
        params.set_default_pair(P::LMsgSize, P::RMsgSize, self.default_size());
        params.mark_used_pair(P::LMsgSize, P::RMsgSize);
        params.mark_used_pair(P::LSockBufSize, P::RSockBufSize);
        params.mark_used_pair(P::LAccessRecv, P::RAccessRecv);
        params.mark_used(P::RAltPort);
        if self.pattern == Pattern::Stream {
            params.mark_used_pair(P::LFlip, P::RFlip);
        }
    }

    fn open_channel(&mut self, sess: &mut Session) -> Result<()> {
        let req = sess.req().clone();
        self.check(&req)?;
        apply_affinity(sess)?;

        let peer = sess.peer_addr().ip();
        let any = unspecified(peer);
        let buf_size = req.sock_buf_size as usize;

        let channel = match (sess.role(), self.proto) {
            (Role::Server, Proto::Tcp) => {
                let listener = TcpListener::bind(SocketAddr::new(any, req.alt_port as u16))
                    .map_err(|e| Error::io("binding data port", e))?;
                set_buffers(&listener, buf_size)?;
                let port = local_port(listener.local_addr())?;
                sess.send_u32(port.into(), "sending data port")?;
                let stream = accept_within(&listener, sess)?;
                Channel::Tcp(stream)
            }
            (Role::Client, Proto::Tcp) => {
                let port = data_port(sess.recv_u32("receiving data port")?)?;
                let addr = SocketAddr::new(peer, port);
                let stream = TcpStream::connect_timeout(&addr, sess.timeout())
                    .map_err(|e| Error::io(format!("connecting data channel to {addr}"), e))?;
                set_buffers(&stream, buf_size)?;
                Channel::Tcp(stream)
            }
            (Role::Server, Proto::Udp) => {
                let socket = UdpSocket::bind(SocketAddr::new(any, req.alt_port as u16))
                    .map_err(|e| Error::io("binding data port", e))?;
                set_buffers(&socket, buf_size)?;
                let port = local_port(socket.local_addr())?;
                sess.send_u32(port.into(), "sending data port")?;
                let client_port = data_port(sess.recv_u32("receiving client data port")?)?;
                socket
                    .connect(SocketAddr::new(peer, client_port))
                    .map_err(|e| Error::io("connecting datagram socket", e))?;
                Channel::Udp(socket)
            }
            (Role::Client, Proto::Udp) => {
                let port = data_port(sess.recv_u32("receiving data port")?)?;
                let socket = UdpSocket::bind(SocketAddr::new(any, 0))
                    .map_err(|e| Error::io("binding datagram socket", e))?;
                set_buffers(&socket, buf_size)?;
                let local = local_port(socket.local_addr())?;
                sess.send_u32(local.into(), "sending client data port")?;
                socket
                    .connect(SocketAddr::new(peer, port))
                    .map_err(|e| Error::io("connecting datagram socket", e))?;
                Channel::Udp(socket)
            }
        };

        match &channel {
            Channel::Tcp(stream) => {
                stream
                    .set_nodelay(true)
                    .and_then(|_| stream.set_nonblocking(true))
                    .map_err(|e| Error::io("configuring data channel", e))?;
            }
            Channel::Udp(socket) => socket
                .set_nonblocking(true)
                .map_err(|e| Error::io("configuring data channel", e))?,
        }
        debug!("data channel open with {peer}");
        self.channel = Some(channel);
        Ok(())
    }

    fn run(&mut self, sess: &mut Session) -> Result<()> {
        match self.pattern {
            Pattern::Stream => {
                let sender = (sess.role() == Role::Client) != sess.req().flipped();
                self.stream(sess, sender)
            }
            Pattern::PingPong => self.ping_pong(sess),
        }
    }
}

fn unspecified(like: IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn local_port(addr: std::io::Result<SocketAddr>) -> Result<u16> {
    addr.map(|a| a.port())
        .map_err(|e| Error::io("reading data port", e))
}

fn data_port(value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::Protocol {
        what: "data port",
        expected: "a 16 bit port".into(),
        got: value.to_string(),
    })
}

fn set_buffers<F: AsFd>(socket: &F, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    setsockopt(socket, sockopt::SndBuf, &size).map_err(|e| Error::os("setsockopt(SO_SNDBUF)", e))?;
    setsockopt(socket, sockopt::RcvBuf, &size).map_err(|e| Error::os("setsockopt(SO_RCVBUF)", e))?;
    Ok(())
}

fn accept_within(listener: &TcpListener, sess: &Session) -> Result<TcpStream> {
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::io("configuring data listener", e))?;
    let deadline = Instant::now() + sess.timeout();

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|e| Error::io("configuring data channel", e))?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("accepting data connection", e)),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("{} never opened the data connection", sess.peer_addr());
            return Err(Error::Timeout {
                what: "accepting data connection".into(),
            });
        }
        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(remaining)) {
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(Error::os("poll", e)),
        }
    }
}

/// Reads every received byte so the data is actually pulled into cache.
fn touch(buf: &[u8]) {
    black_box(buf.iter().fold(0u8, |acc, &b| acc ^ b));
}
