use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sys::epoll::{self, Events};
use crate::{PollOpt, Ready, Source, Token};

static NEXT_POLLER_ID: AtomicUsize = AtomicUsize::new(1);

/// Thin, OS-agnostic facade over the platform readiness mechanism.
///
/// `epump` names four operations on the underlying multiplexer: create,
/// destroy, add/modify/delete a watch, and wait for readiness. `Poller`
/// is exactly that facade; everything above it (`Pump`, `Dev`, ...) talks
/// to fds only through `add`/`modify`/`delete`/`wait`, never through raw
/// `epoll_ctl` calls.
#[derive(Debug)]
pub struct Poller {
    id: usize,
    epoll: epoll::Epoll,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            id: NEXT_POLLER_ID.fetch_add(1, Ordering::Relaxed),
            epoll: epoll::Epoll::new()?,
        })
    }

    /// Identity of this poller, used by a [`Source`] implementor to detect
    /// that it is being re-registered with a different poller than the one
    /// it was originally added to.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn add<S: Source + ?Sized>(
        &self,
        source: &S,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        source.add(self, token, interest, opts)
    }

    pub fn modify<S: Source + ?Sized>(
        &self,
        source: &S,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        source.modify(self, token, interest, opts)
    }

    pub fn delete<S: Source + ?Sized>(&self, source: &S) -> io::Result<()> {
        source.delete(self)
    }

    /// Blocks until at least one registered fd is ready, `timeout_ms`
    /// elapses, or `None` to block indefinitely. Timeouts larger than the
    /// kernel's 35-minute `epoll_wait` ceiling are silently clamped by the
    /// `sys` layer; callers relying on long waits must re-call after each
    /// return.
    pub fn wait(&self, events: &mut Events, timeout_ms: Option<i32>) -> io::Result<usize> {
        self.epoll.wait(events, timeout_ms)
    }

    pub fn events(capacity: usize) -> Events {
        Events::with_capacity(capacity)
    }

    pub(crate) fn raw_add(
        &self,
        fd: RawFd,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.epoll.add(fd, token, interest, opts)
    }

    pub(crate) fn raw_modify(
        &self,
        fd: RawFd,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.epoll.modify(fd, token, interest, opts)
    }

    pub(crate) fn raw_delete(&self, fd: RawFd) -> io::Result<()> {
        self.epoll.delete(fd)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
