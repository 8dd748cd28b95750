/// Opaque identifier the `Poller` hands back in each readiness event.
///
/// The dispatch engine stuffs a `dev_id` or `timer_id` into a `Token` when
/// it registers the corresponding fd, and reads it back out of the
/// `Event` the kernel readiness mechanism produces. `Token` carries no
/// meaning of its own; `Core` re-validates whatever id it wraps against
/// the registry before running a callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u64);

impl From<u64> for Token {
    #[inline]
    fn from(val: u64) -> Token {
        Token(val)
    }
}

impl From<Token> for u64 {
    #[inline]
    fn from(val: Token) -> u64 {
        val.0
    }
}
