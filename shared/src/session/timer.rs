use std::{
    io::{ErrorKind, Read, Write},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::net::UnixStream,
    },
    sync::{atomic::AtomicU64, atomic::AtomicU8, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::{
    channel::{after, bounded, select, Sender},
    utils::CachePadded,
};
use quanta::{Clock, Instant};
use tracing::debug;

use crate::{
    atomic_extension::AtomicExtension,
    error::{Error, Result},
};

const CLEAR: u8 = 0;
const FIRING: u8 = 1;
const FIRED: u8 = 2;

/// Fire-once "test window closed" flag shared by the timer thread, the
/// urgent-byte handler and the workload loop of one session.
///
/// Firing records the stop time and pokes a wake-up socket so that a loop
/// blocked waiting for I/O returns promptly. Firing again before
/// [`Latch::clear`] changes nothing.
#[derive(Debug)]
pub struct Latch {
    state: CachePadded<AtomicU8>,
    stop_nanos: AtomicU64,
    clock: Clock,
    epoch: Instant,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
}

impl Latch {
    pub fn new(clock: Clock) -> Result<Arc<Self>> {
        let (wake_tx, wake_rx) =
            UnixStream::pair().map_err(|e| Error::io("creating wake-up socket", e))?;
        for end in [&wake_tx, &wake_rx] {
            end.set_nonblocking(true)
                .map_err(|e| Error::io("creating wake-up socket", e))?;
        }

        let epoch = clock.now();
        Ok(Arc::new(Self {
            state: CachePadded::new(AtomicU8::new(CLEAR)),
            stop_nanos: AtomicU64::new(0),
            clock,
            epoch,
            wake_tx,
            wake_rx,
        }))
    }

    /// Closes the test window. Returns `false` if it was already closed.
    pub fn fire(&self) -> bool {
        if !self.state.transition(CLEAR, FIRING) {
            return false;
        }

        let now = self.clock.now();
        self.stop_nanos
            .store_release(now.saturating_duration_since(self.epoch).as_nanos() as u64);
        self.state.store_release(FIRED);

        // a full socket already holds a pending wake-up
        let _ = (&self.wake_tx).write(&[1]);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.load_acquire() != CLEAR
    }

    /// When the window closed, once the firing call has finished recording it.
    pub fn stop_time(&self) -> Option<Instant> {
        if self.state.load_acquire() != FIRED {
            return None;
        }
        Some(self.epoch + Duration::from_nanos(self.stop_nanos.load_acquire()))
    }

    /// Reopens the window for the next test.
    pub fn clear(&self) {
        let mut sink = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.state.store_release(CLEAR);
    }

    /// Readable whenever the latch has fired since the last clear.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_rx.as_fd()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

/// Arms the latch after a fixed duration.
#[derive(Debug)]
pub struct TestTimer {
    latch: Arc<Latch>,
    disarm: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestTimer {
    pub fn new(latch: Arc<Latch>) -> Self {
        Self {
            latch,
            disarm: None,
            thread: None,
        }
    }

    /// Disarms any earlier timer and reopens the window.
    pub fn reset(&mut self) {
        self.disarm();
        self.latch.clear();
    }

    /// Unless `seconds` is zero, schedules the latch to fire. A zero duration
    /// runs until something else fires the latch. A latch that already fired
    /// since [`TestTimer::reset`] stays fired.
    pub fn start(&mut self, seconds: u32) -> Result<()> {
        self.disarm();

        if seconds == 0 {
            return Ok(());
        }

        let (disarm_tx, disarm_rx) = bounded::<()>(0);
        let deadline = after(Duration::from_secs(seconds.into()));
        let latch = self.latch.clone();

        let thread = thread::Builder::new()
            .name("test-timer".into())
            .spawn(move || {
                select! {
                    recv(deadline) -> _ => {
                        if latch.fire() {
                            debug!("test timer expired");
                        }
                    }
                    recv(disarm_rx) -> _ => {}
                }
            })
            .map_err(|e| Error::io("starting test timer", e))?;

        self.disarm = Some(disarm_tx);
        self.thread = Some(thread);
        Ok(())
    }

    /// Closes the window if it is still open and disarms the timer. Only
    /// the first call records a stop time.
    pub fn stop(&mut self) -> bool {
        let fired = self.latch.fire();
        self.disarm();
        fired
    }

    pub fn latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    fn disarm(&mut self) {
        // dropping the sender wakes the timer thread
        self.disarm.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TestTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    fn latch() -> Arc<Latch> {
        Latch::new(Clock::new()).unwrap()
    }

    fn wake_pending(latch: &Latch) -> bool {
        let mut fds = [PollFd::new(latch.wake_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO).unwrap() == 1
    }

    #[test]
    fn second_fire_keeps_first_stop_time() {
        let latch = latch();
        let mut timer = TestTimer::new(latch.clone());
        timer.start(60).unwrap();
        assert!(!latch.is_finished());

        assert!(latch.fire());
        let first = latch.stop_time().unwrap();
        thread::sleep(Duration::from_millis(5));
        assert!(!latch.fire());
        assert_eq!(latch.stop_time().unwrap(), first);

        assert!(!timer.stop());
        assert_eq!(latch.stop_time().unwrap(), first);
    }

    #[test]
    fn timer_fires_after_duration() {
        let latch = latch();
        let mut timer = TestTimer::new(latch.clone());
        timer.start(1).unwrap();
        thread::sleep(Duration::from_millis(1500));
        assert!(latch.is_finished());
        assert!(wake_pending(&latch));
        assert!(!timer.stop());
    }

    #[test]
    fn zero_duration_waits_for_stop() {
        let latch = latch();
        let mut timer = TestTimer::new(latch.clone());
        timer.start(0).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!latch.is_finished());
        assert!(timer.stop());
        assert!(latch.stop_time().is_some());
    }

    #[test]
    fn restart_reopens_window() {
        let latch = latch();
        let mut timer = TestTimer::new(latch.clone());
        timer.start(0).unwrap();
        timer.stop();
        assert!(wake_pending(&latch));

        timer.reset();
        timer.start(60).unwrap();
        assert!(!latch.is_finished());
        assert!(latch.stop_time().is_none());
        assert!(!wake_pending(&latch));
    }

    #[test]
    fn fire_before_start_survives_arming() {
        let latch = latch();
        let mut timer = TestTimer::new(latch.clone());
        timer.start(0).unwrap();
        timer.stop();

        timer.reset();
        assert!(latch.fire());
        let stopped = latch.stop_time().unwrap();
        timer.start(60).unwrap();
        assert!(latch.is_finished());
        assert_eq!(latch.stop_time().unwrap(), stopped);
        assert!(!timer.stop());
    }
}
