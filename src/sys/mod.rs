//! Platform backend: raw epoll syscalls behind small safe wrappers.
//!
//! Everything above this module (`Poller`, `Dev`, `Pump`, ...) is written
//! against the `Source` trait and the `Ready`/`Token`/`PollOpt` newtypes;
//! only this module and its children know that the concrete mechanism is
//! epoll.

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod fd;
pub mod epoll;
pub mod eventfd;
pub mod socket;

pub use fd::FileDesc;
