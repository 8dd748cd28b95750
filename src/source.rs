use std::io;
use std::os::unix::io::RawFd;

use crate::{PollOpt, Poller, Ready, Token};

/// A value that can be registered with a [`Poller`].
///
/// Implementors delegate to their underlying raw fd (the common case for
/// system handles) or, for user-space signalled values such as a
/// [`crate::queue::Queue`], to the [`crate::waker::Waker`] that backs them.
pub trait Source {
    fn add(&self, poller: &Poller, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()>;

    fn modify(&self, poller: &Poller, token: Token, interest: Ready, opts: PollOpt)
        -> io::Result<()>;

    fn delete(&self, poller: &Poller) -> io::Result<()>;
}

impl Source for RawFd {
    fn add(&self, poller: &Poller, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        poller.raw_add(*self, token, interest, opts)
    }

    fn modify(
        &self,
        poller: &Poller,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        poller.raw_modify(*self, token, interest, opts)
    }

    fn delete(&self, poller: &Poller) -> io::Result<()> {
        poller.raw_delete(*self)
    }
}
