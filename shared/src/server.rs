//! Listener side. Every accepted connection gets a session thread that
//! reads one request and runs the workload it names.

use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    os::fd::AsFd,
    thread::{self, ScopedJoinHandle},
};

use crossbeam::channel::{unbounded, Sender};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{Disposition, Workload},
    error::{Error, Result},
    session::{Context, Session, IDLE_SLICE_MS},
};

/// Port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 19765;

pub struct Server {
    listener: TcpListener,
    context: Context,
}

impl Server {
    pub fn bind(port: u16, context: Context) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener =
            TcpListener::bind(addr).map_err(|e| Error::io(format!("binding port {port}"), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::io("configuring listener", e))?;
        Ok(Self { listener, context })
    }

    pub fn local_port(&self) -> Result<u16> {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|e| Error::io("reading listener address", e))
    }

    /// Accepts sessions until a client runs `quit`, then waits for the
    /// sessions still in progress.
    pub fn serve(&self) -> Result<()> {
        info!("listening on port {}", self.local_port()?);
        let (quit, quit_requested) = unbounded();

        thread::scope(|s| {
            let mut sessions: Vec<ScopedJoinHandle<'_, ()>> = Vec::new();

            while quit_requested.try_recv().is_err() {
                if let Some(stream) = self.accept_within()? {
                    let context = self.context.clone();
                    let quit = quit.clone();
                    let handle = thread::Builder::new()
                        .name("session".into())
                        .spawn_scoped(s, move || serve_session(stream, context, quit))
                        .map_err(|e| Error::io("spawning session thread", e))?;
                    sessions.push(handle);
                }
                sessions.retain(|handle| !handle.is_finished());
            }

            info!("quit requested, waiting for {} session(s)", sessions.len());
            Ok(())
        })
    }

    /// Waits up to one idle slice for a connection, so the quit request is
    /// observed even when no client shows up.
    fn accept_within(&self) -> Result<Option<TcpStream>> {
        let ready = {
            let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(IDLE_SLICE_MS)) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => return Err(Error::os("poll", e)),
            }
        };
        if !ready {
            return Ok(None);
        }

        match self.listener.accept() {
            Ok((stream, addr)) => {
                debug!("connection from {addr}");
                Ok(Some(stream))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => {
                // a connection reset before accept is the client's problem
                warn!("accept failed: {e}");
                Ok(None)
            }
        }
    }
}

fn serve_session(stream: TcpStream, context: Context, quit: Sender<()>) {
    let mut sess = match Session::accept(stream, context) {
        Ok(sess) => sess,
        Err(e) => {
            warn!("could not set up session: {e}");
            return;
        }
    };

    match run_session(&mut sess) {
        Ok(Disposition::Continue) => {}
        Ok(Disposition::Quit) => {
            // the receiver outlives every session thread
            let _ = quit.send(());
        }
        Err(e) => {
            warn!("session with {} failed: {e}", sess.peer_addr());
            sess.notify_failure(&e);
        }
    }
    sess.close();
}

fn run_session(sess: &mut Session) -> Result<Disposition> {
    let selector = sess.recv_request()?.req_index;
    let workload = Workload::from_selector(selector)?;
    info!("{} requested {workload}", sess.peer_addr());
    workload.backend().server(sess)
}
