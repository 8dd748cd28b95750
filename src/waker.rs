use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sys::eventfd::EventFd;
use crate::{PollOpt, Poller, Ready, Source, Token};

/// Cross-thread wake-up primitive. A `Pump` blocks in `Poller::wait`
/// across every fd it owns; `Waker` is the one fd that lets another
/// thread (another pump handing it an inherited dev, `Core` asking it to
/// stop, a worker pushing a result back) interrupt that wait on demand.
///
/// `set()` is idempotent while already armed: repeated calls collapse to
/// a single wake-up, matching the at-least-once semantics the dispatch
/// loop needs (it always drains and re-checks its queues after waking).
#[derive(Debug)]
pub struct Waker {
    fd: EventFd,
    armed: AtomicBool,
}

impl Waker {
    pub fn new(poller: &Poller, token: Token) -> io::Result<Waker> {
        let fd = EventFd::new(0)?;
        poller.add(&fd, token, Ready::readable(), PollOpt::edge())?;
        Ok(Waker {
            fd,
            armed: AtomicBool::new(false),
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        if !self.armed.swap(true, Ordering::AcqRel) {
            self.fd.write(1)?;
        }
        Ok(())
    }

    /// Clears the woken state. Called once per loop iteration after
    /// `Poller::wait` returns, regardless of which token fired, so a
    /// spurious wake never masks a real one queued right behind it.
    pub fn reset(&self) -> io::Result<()> {
        self.armed.store(false, Ordering::Release);
        self.fd.read()?;
        Ok(())
    }
}
