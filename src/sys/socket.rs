use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// Tri-state knob mirroring the dispatch engine's view of a stream socket
/// option: left alone, forced on, or forced off. `Dev::tcp_nodelay` and
/// `Dev::tcp_nopush` are both expressed in these terms rather than `bool`
/// so "never touched this option" stays distinguishable from "explicitly
/// cleared it".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tristate {
    Unset,
    On,
    Off,
}

impl Tristate {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Tristate::Unset => None,
            Tristate::On => Some(true),
            Tristate::Off => Some(false),
        }
    }
}

pub fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
}

pub fn set_reuseport(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
}

pub fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
}

#[cfg(target_os = "linux")]
pub fn set_tcp_nopush(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_CORK, on as libc::c_int)
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: T) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const T as *const libc::c_void,
        mem::size_of::<T>() as libc::socklen_t,
    ))?;
    Ok(())
}

pub fn socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;

    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}
