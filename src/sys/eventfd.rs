use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::fd::FileDesc;
use crate::{PollOpt, Poller, Ready, Source, Token};

/// A Linux `eventfd(2)` counter, used as the wake-up primitive behind
/// [`crate::waker::Waker`] and [`crate::queue::Queue`]: writing any nonzero
/// value makes the fd readable, and a read drains it back to zero.
#[derive(Debug)]
pub struct EventFd(FileDesc);

impl EventFd {
    pub fn new(init: u32) -> io::Result<EventFd> {
        let fd = syscall!(eventfd(init as libc::c_uint, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(EventFd(unsafe { FileDesc::new(fd) }))
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.0).read_exact_or_zero(&mut buf) {
            Ok(()) => Ok(u64::from_ne_bytes(buf)),
            Err(e) => Err(e),
        }
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        use std::io::Write;
        let buf = val.to_ne_bytes();
        (&self.0).write_all_or_ignore(&buf)
    }
}

impl FileDesc {
    fn read_exact_or_zero(&self, buf: &mut [u8; 8]) -> io::Result<()> {
        use std::io::Read;
        match (&mut &*self).read(buf) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                buf.fill(0);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn write_all_or_ignore(&self, buf: &[u8; 8]) -> io::Result<()> {
        use std::io::Write;
        match (&mut &*self).write(buf) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Source for EventFd {
    fn add(&self, poller: &Poller, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.as_raw_fd().add(poller, token, interest, opts)
    }

    fn modify(
        &self,
        poller: &Poller,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.as_raw_fd().modify(poller, token, interest, opts)
    }

    fn delete(&self, poller: &Poller) -> io::Result<()> {
        self.as_raw_fd().delete(poller)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_and_read() {
        let efd = EventFd::new(0).unwrap();
        efd.write(1).unwrap();
        efd.write(1).unwrap();
        assert_eq!(efd.read().unwrap(), 2);
    }

    #[test]
    fn read_without_write_does_not_block() {
        let efd = EventFd::new(0).unwrap();
        assert_eq!(efd.read().unwrap(), 0);
    }
}
