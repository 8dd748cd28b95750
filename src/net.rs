use std::io;
use std::net::{self, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use crate::dev::{BindType, Dev, FdKind, IoState};
use crate::event::IoHandler;
use crate::registry::Core;
use crate::sys::socket;

/// Socket construction is deliberately thin here (spec §1: "ultimately
/// call `iodev_bind_epump` and nothing more interesting"): every
/// constructor below does exactly three things — open/accept/connect a
/// standard library socket, hand its raw fd to [`Core::iodev_new_from_fd`],
/// and bind it per the caller's [`BindType`].
impl Core {
    // -- TCP --------------------------------------------------------

    /// `eptcp_listen`.
    pub fn eptcp_listen<A: ToSocketAddrs>(
        self: &Arc<Core>,
        addr: A,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let fd = listener.into_raw_fd();
        let (reuseaddr, reuseport) = apply_reuse_opts(fd);

        let dev = self.iodev_new_from_fd_with_sockopts(
            fd, FdKind::Listen, handler, reuseaddr, reuseport, false,
        );
        dev_set_local(&dev, local_addr);
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    /// `eptcp_accept`: accepts one pending connection off a listening dev
    /// (called from the user's ACCEPT callback), wraps it, and binds it
    /// per `bind_type` (E1: "ACCEPT handler creates accepted dev bound
    /// ONE_EPUMP").
    pub fn eptcp_accept(
        self: &Arc<Core>,
        listen_dev: &Arc<Dev>,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let listener = borrow_as::<net::TcpListener>(listen_dev.fd());
        let (stream, peer) = listener.accept()?;
        stream.set_nonblocking(true)?;
        let local = stream.local_addr()?;
        let fd = stream.into_raw_fd();
        let keepalive = socket::set_keepalive(fd, true).is_ok();

        let dev = self.iodev_new_from_fd_with_sockopts(
            fd, FdKind::Accepted, handler, false, false, keepalive,
        );
        dev_set_local(&dev, local);
        *dev.remote_addr.lock().unwrap() = Some(peer);
        *dev.io_state.lock().unwrap() = IoState::ReadWrite;
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    /// `eptcp_connect`: blocking connect, used when the caller is willing
    /// to stall the calling thread for the handshake.
    pub fn eptcp_connect<A: ToSocketAddrs>(
        self: &Arc<Core>,
        addr: A,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let fd = stream.into_raw_fd();
        let keepalive = socket::set_keepalive(fd, true).is_ok();

        let dev = self.iodev_new_from_fd_with_sockopts(
            fd, FdKind::Connected, handler, false, false, keepalive,
        );
        dev_set_local(&dev, local);
        *dev.remote_addr.lock().unwrap() = Some(peer);
        *dev.io_state.lock().unwrap() = IoState::ReadWrite;
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    /// `eptcp_nb_connect`: non-blocking connect. The dev comes back in
    /// `IoState::Connecting`; the pump promotes it to CONNECTED/CONNFAIL
    /// once the fd turns writable (spec §4.2).
    pub fn eptcp_nb_connect(
        self: &Arc<Core>,
        addr: SocketAddr,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0
        ))?;

        let (storage, len) = sockaddr_of(&addr);
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let keepalive = socket::set_keepalive(fd, true).is_ok();
        let dev = self.iodev_new_from_fd_with_sockopts(
            fd, FdKind::Connected, handler, false, false, keepalive,
        );
        *dev.remote_addr.lock().unwrap() = Some(addr);
        *dev.io_state.lock().unwrap() = IoState::Connecting;
        let _ = dev.rwflag_set(crate::dev::RwFlag::write());
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    // -- UDP --------------------------------------------------------

    /// `epudp_listen`.
    pub fn epudp_listen<A: ToSocketAddrs>(
        self: &Arc<Core>,
        addr: A,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let fd = socket.into_raw_fd();
        let (reuseaddr, reuseport) = apply_reuse_opts(fd);

        let dev = self.iodev_new_from_fd_with_sockopts(
            fd, FdKind::UdpServer, handler, reuseaddr, reuseport, false,
        );
        dev_set_local(&dev, local_addr);
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    /// `epudp_client`: an unconnected datagram socket for `sendto`/
    /// `recvfrom` use (the resolver's own nameserver sockets are built
    /// this way).
    pub fn epudp_client(
        self: &Arc<Core>,
        family_hint: SocketAddr,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let wildcard: SocketAddr = if family_hint.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(wildcard)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let fd = socket.into_raw_fd();
        let keepalive = socket::set_keepalive(fd, true).is_ok();

        let dev = self.iodev_new_from_fd_with_sockopts(
            fd, FdKind::UdpClient, handler, false, false, keepalive,
        );
        dev_set_local(&dev, local_addr);
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    pub fn epudp_recvfrom(&self, dev: &Arc<Dev>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        borrow_as::<net::UdpSocket>(dev.fd()).recv_from(buf)
    }

    pub fn epudp_sendto(&self, dev: &Arc<Dev>, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        borrow_as::<net::UdpSocket>(dev.fd()).send_to(buf, addr)
    }

    // -- Unix --------------------------------------------------------

    pub fn epunix_listen(
        self: &Arc<Core>,
        path: impl AsRef<std::path::Path>,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let fd = listener.into_raw_fd();

        let dev = self.iodev_new_from_fd(fd, FdKind::UnixListen, handler);
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    pub fn epunix_accept(
        self: &Arc<Core>,
        listen_dev: &Arc<Dev>,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let listener = borrow_as::<std::os::unix::net::UnixListener>(listen_dev.fd());
        let (stream, _) = listener.accept()?;
        stream.set_nonblocking(true)?;
        let fd = stream.into_raw_fd();

        let dev = self.iodev_new_from_fd(fd, FdKind::UnixAccepted, handler);
        *dev.io_state.lock().unwrap() = IoState::ReadWrite;
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }

    pub fn epunix_connect(
        self: &Arc<Core>,
        path: impl AsRef<std::path::Path>,
        bind_type: BindType,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        let fd = stream.into_raw_fd();

        let dev = self.iodev_new_from_fd(fd, FdKind::UnixConnected, handler);
        *dev.io_state.lock().unwrap() = IoState::ReadWrite;
        self.iodev_bind_epump(&dev, bind_type, false);
        Ok(dev)
    }
}

fn dev_set_local(dev: &Arc<Dev>, addr: SocketAddr) {
    *dev.local_addr.lock().unwrap() = Some(addr);
}

/// Best-effort `SO_REUSEADDR`/`SO_REUSEPORT` on an already-bound listening
/// fd, returning which actually succeeded. Applied after `std`'s own
/// `bind` rather than before it (the original sets these ahead of `bind`
/// on its own raw socket; `std::net::TcpListener`/`UdpSocket` don't expose
/// a pre-bind hook), so this only benefits a later `bind` on the same
/// address, not this one — but it still leaves [`Dev::reuseaddr`]/
/// [`Dev::reuseport`] an honest record of the running kernel's support.
fn apply_reuse_opts(fd: RawFd) -> (bool, bool) {
    let reuseaddr = socket::set_reuseaddr(fd, true).is_ok();
    let reuseport = socket::set_reuseport(fd, true).is_ok();
    (reuseaddr, reuseport)
}

/// Temporarily views a raw fd as the given std socket type without taking
/// ownership, so `accept`/`recv_from`/`send_to` can reuse the standard
/// library's syscall wrappers. The fd is leaked back out on drop via
/// `ManuallyDrop`; [`Dev::invalidate_fd`] remains the single owner that
/// actually closes it.
fn borrow_as<T: FromRawFd>(fd: RawFd) -> std::mem::ManuallyDrop<T> {
    std::mem::ManuallyDrop::new(unsafe { T::from_raw_fd(fd) })
}

pub(crate) fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len;
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        }
    }
    (storage, len)
}

/// Opens a raw, non-blocking TCP listening socket with `SO_REUSEPORT`
/// set before `bind`, for [`crate::mlisten`]'s per-pump sockets. Standard
/// library `TcpListener::bind` cannot do this since it binds internally,
/// before a caller gets a chance to set socket options.
pub(crate) fn reuseport_tcp_listener(addr: SocketAddr) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))?;

    if let Err(e) = socket::set_reuseaddr(fd, true).and_then(|_| socket::set_reuseport(fd, true)) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let (storage, len) = sockaddr_of(&addr);
    if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) } < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    if unsafe { libc::listen(fd, 1024) } < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// Opens a raw, non-blocking UDP socket with `SO_REUSEPORT` set before
/// `bind`, mirroring [`reuseport_tcp_listener`] for [`crate::mlisten`]'s
/// per-pump datagram sockets.
pub(crate) fn reuseport_udp_socket(addr: SocketAddr) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = syscall!(socket(domain, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))?;

    if let Err(e) = socket::set_reuseaddr(fd, true).and_then(|_| socket::set_reuseport(fd, true)) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let (storage, len) = sockaddr_of(&addr);
    if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) } < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// Probes whether the running kernel supports `SO_REUSEPORT` by setting
/// it on a scratch socket, per SPEC_FULL §4.9.
pub(crate) fn probe_reuseport_supported() -> bool {
    let fd = match syscall!(socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0)) {
        Ok(fd) => fd,
        Err(_) => return false,
    };
    let supported = socket::set_reuseport(fd, true).is_ok();
    unsafe { libc::close(fd) };
    supported
}
