use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::{PollOpt, Ready, Token};

/// The real 35-minute cap epoll_wait silently truncates timeouts to; the
/// `Poller` above us never passes anything larger than this.
pub const MAX_EPOLL_TIMEOUT_MSEC: i32 = 35 * 60 * 1000;

#[derive(Debug)]
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn wait(&self, events: &mut Events, timeout_ms: Option<i32>) -> io::Result<usize> {
        let timeout = match timeout_ms {
            Some(ms) => ms.min(MAX_EPOLL_TIMEOUT_MSEC),
            None => -1,
        };

        events.events.clear();
        let cap = events.events.capacity();

        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.events.as_mut_ptr(),
                    cap as i32,
                    timeout,
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            unsafe { events.events.set_len(n as usize) };
            return Ok(n as usize);
        }
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: ioevent_to_epoll(interest, opts),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event))?;
        Ok(())
    }

    pub fn modify(
        &self,
        fd: RawFd,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: ioevent_to_epoll(interest, opts),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // Kernels before 2.6.9 require a non-null event pointer even though
        // EPOLL_CTL_DEL ignores its contents.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        match syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event)) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBADF) || e.raw_os_error() == Some(libc::ENOENT) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.epfd) };
    }
}

fn ioevent_to_epoll(interest: Ready, opts: PollOpt) -> u32 {
    let mut bits = 0u32;

    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    if interest.is_hup() {
        bits |= libc::EPOLLRDHUP as u32;
    }
    if opts.is_edge() {
        bits |= libc::EPOLLET as u32;
    }
    if opts.is_oneshot() {
        bits |= libc::EPOLLONESHOT as u32;
    }

    bits
}

fn epoll_to_ioevent(bits: u32) -> Ready {
    let mut ready = Ready::empty();

    if bits & (libc::EPOLLIN as u32) != 0 || bits & (libc::EPOLLPRI as u32) != 0 {
        ready.insert(Ready::readable());
    }
    if bits & (libc::EPOLLOUT as u32) != 0 {
        ready.insert(Ready::writable());
    }
    if bits & (libc::EPOLLERR as u32) != 0 {
        ready.insert(Ready::error());
    }
    if bits & (libc::EPOLLRDHUP as u32) != 0 || bits & (libc::EPOLLHUP as u32) != 0 {
        ready.insert(Ready::hup());
    }

    ready
}

#[derive(Debug)]
pub struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    pub fn new(kind: Ready, token: Token) -> Event {
        Event { kind, token }
    }

    pub fn kind(&self) -> Ready {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

/// A fixed-capacity buffer of raw readiness events, reused across calls to
/// `Epoll::wait` to avoid per-iteration allocation.
#[derive(Debug)]
pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|raw| {
            Event::new(epoll_to_ioevent(raw.events), Token(raw.u64))
        })
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
