use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use std::io;

use crate::event::IoHandler;
use crate::registry::{Core, PumpId};
use crate::sys::socket::{self, Tristate};
use crate::timer::{Deadline, Timer, IOTCMD_IDLE};
use crate::{PollOpt, Poller, Ready, Source, Token};

/// `iodev_linger_close`'s idle timeout (spec §4.3).
const LINGER_CLOSE_MS: u64 = 2_000;

/// Identity of a registered [`Dev`]. Monotonic, assigned by
/// [`crate::registry::Core`] starting at 100 per spec §4.8; never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevId(pub u64);

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a [`Dev`]'s fd actually is, carried all the way through to the
/// user callback's `fd_kind` argument.
///
/// The full fourteen-variant original enumeration is kept rather than the
/// abbreviated tcp/udp split spec.md's component table shows, because
/// `close`'s linger discipline and multi-listen both switch on variants
/// (`UnixAccepted`, `LingerClose`, `Timer`) the abbreviated table omits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdKind {
    Listen,
    Connected,
    Accepted,
    UdpServer,
    UdpClient,
    UnixListen,
    UnixConnected,
    UnixAccepted,
    RawSock,
    FileDev,
    Stdin,
    Stdout,
    Timer,
    UserCmd,
    LingerClose,
}

impl FdKind {
    /// Numeric `fd_kind` marker handed to the user callback's last
    /// argument (spec §6), in original enumeration order.
    pub fn marker(&self) -> i32 {
        match self {
            FdKind::Listen => 0,
            FdKind::Connected => 1,
            FdKind::Accepted => 2,
            FdKind::UdpServer => 3,
            FdKind::UdpClient => 4,
            FdKind::UnixListen => 5,
            FdKind::UnixConnected => 6,
            FdKind::UnixAccepted => 7,
            FdKind::RawSock => 8,
            FdKind::FileDev => 9,
            FdKind::Stdin => 10,
            FdKind::Stdout => 11,
            FdKind::Timer => 12,
            FdKind::UserCmd => 13,
            FdKind::LingerClose => 14,
        }
    }
}

/// A dev's fd-lifecycle phase, replacing the original's per-object
/// recursive critical section (spec §9) with a single short-lived lock
/// guarding only the transition itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdLifecycle {
    New,
    Bound,
    Ready,
    Closing,
    Closed,
}

/// In-progress I/O state of a dev, independent of its fd-lifecycle phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoState {
    Connecting,
    Accepting,
    ReadWrite,
    Resolving,
}

/// Which pump(s) a [`Dev`] attaches to.
///
/// `NewForEpump` has no caller in this core — see `DESIGN.md` — but is
/// retained for forward compatibility with pump-creation-time binding,
/// matching the original header's six-way enumeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindType {
    None,
    One,
    Given(u64),
    Current,
    All,
    NewForEpump,
}

/// One observable file descriptor plus its monitoring intent, binding and
/// protocol-level bookkeeping.
///
/// `dev_id` is stable for the dev's whole lifetime; `fd` is a separate
/// field specifically because it can be invalidated (set to `-1`) by a
/// close while other fields (cached peer address, kind) remain valid for
/// logging/diagnostics a moment longer.
pub struct Dev {
    pub id: DevId,
    fd: Mutex<RawFd>,
    pub kind: FdKind,
    pub rw_flag: Mutex<RwFlag>,
    pub io_state: Mutex<IoState>,
    pub lifecycle: Mutex<FdLifecycle>,
    pub bind_type: Mutex<BindType>,
    pub local_addr: Mutex<Option<SocketAddr>>,
    pub remote_addr: Mutex<Option<SocketAddr>>,
    pub tcp_nodelay: Mutex<Tristate>,
    pub tcp_nopush: Mutex<Tristate>,
    pub ssl_handshake_done: AtomicU32,
    pub reuseaddr: bool,
    pub reuseport: bool,
    pub keepalive: bool,
    pub owning_pump: Mutex<Option<PumpId>>,
    pub preferred_worker: Mutex<Option<u64>>,
    pub handler: Option<IoHandler>,
    /// Set while a READ event for this dev is enqueued but not yet
    /// executed, so the edge-triggered poll loop never injects a second
    /// one on top (spec §4.5's de-duplication rule).
    pub read_pending: std::sync::atomic::AtomicBool,
    pub write_pending: std::sync::atomic::AtomicBool,
}

/// Read/write monitoring intent, mirrored to the `Poller` on every change.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct RwFlag {
    bits: u8,
}

const RW_READ: u8 = 0b01;
const RW_WRITE: u8 = 0b10;

impl RwFlag {
    pub fn empty() -> RwFlag {
        RwFlag { bits: 0 }
    }

    pub fn read() -> RwFlag {
        RwFlag { bits: RW_READ }
    }

    pub fn write() -> RwFlag {
        RwFlag { bits: RW_WRITE }
    }

    pub fn read_write() -> RwFlag {
        RwFlag { bits: RW_READ | RW_WRITE }
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn has_read(self) -> bool {
        self.bits & RW_READ != 0
    }

    pub fn has_write(self) -> bool {
        self.bits & RW_WRITE != 0
    }

    pub fn insert(&mut self, other: RwFlag) {
        self.bits |= other.bits;
    }

    pub fn remove(&mut self, other: RwFlag) {
        self.bits &= !other.bits;
    }

    pub fn to_ready(self) -> Ready {
        let mut r = Ready::empty();
        if self.has_read() {
            r.insert(Ready::readable());
        }
        if self.has_write() {
            r.insert(Ready::writable());
        }
        r
    }
}

impl Dev {
    pub fn new(id: DevId, kind: FdKind) -> Dev {
        Dev {
            id,
            fd: Mutex::new(-1),
            kind,
            rw_flag: Mutex::new(RwFlag::empty()),
            io_state: Mutex::new(IoState::ReadWrite),
            lifecycle: Mutex::new(FdLifecycle::New),
            bind_type: Mutex::new(BindType::None),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            tcp_nodelay: Mutex::new(Tristate::Unset),
            tcp_nopush: Mutex::new(Tristate::Unset),
            ssl_handshake_done: AtomicU32::new(0),
            reuseaddr: false,
            reuseport: false,
            keepalive: false,
            owning_pump: Mutex::new(None),
            preferred_worker: Mutex::new(None),
            handler: None,
            read_pending: std::sync::atomic::AtomicBool::new(false),
            write_pending: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn new_from_fd(id: DevId, fd: RawFd, kind: FdKind, handler: Option<IoHandler>) -> Dev {
        let mut dev = Dev::new(id, kind);
        *dev.fd.get_mut().unwrap() = fd;
        *dev.rw_flag.get_mut().unwrap() = RwFlag::read();
        *dev.lifecycle.get_mut().unwrap() = FdLifecycle::Ready;
        dev.handler = handler;
        dev
    }

    /// Like [`Dev::new_from_fd`], but also records which of the
    /// creation-time socket options (`SO_REUSEADDR`, `SO_REUSEPORT`,
    /// `SO_KEEPALIVE`) the caller actually managed to apply to `fd`,
    /// mirroring the original's `pdev->reuseaddr = (ret == 0)` bookkeeping
    /// in `eptcp_listen`/`epudp_listen`.
    pub fn new_from_fd_with_sockopts(
        id: DevId,
        fd: RawFd,
        kind: FdKind,
        handler: Option<IoHandler>,
        reuseaddr: bool,
        reuseport: bool,
        keepalive: bool,
    ) -> Dev {
        let mut dev = Dev::new_from_fd(id, fd, kind, handler);
        dev.reuseaddr = reuseaddr;
        dev.reuseport = reuseport;
        dev.keepalive = keepalive;
        dev
    }

    pub fn fd(&self) -> RawFd {
        *self.fd.lock().unwrap()
    }

    pub fn is_valid(&self) -> bool {
        self.fd() >= 0
    }

    /// Replaces the fd-lifecycle phase, returning the previous one.
    pub fn set_lifecycle(&self, next: FdLifecycle) -> FdLifecycle {
        let mut guard = self.lifecycle.lock().unwrap();
        std::mem::replace(&mut *guard, next)
    }

    pub fn lifecycle(&self) -> FdLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    /// Atomically replaces the read/write intent under the fd lock and
    /// returns the previous value, so the caller can decide whether the
    /// `Poller` needs re-pushing.
    pub fn rwflag_set(&self, flags: RwFlag) -> RwFlag {
        let mut guard = self.rw_flag.lock().unwrap();
        std::mem::replace(&mut *guard, flags)
    }

    pub fn add_notify(&self, flags: RwFlag) -> RwFlag {
        let mut guard = self.rw_flag.lock().unwrap();
        let before = *guard;
        guard.insert(flags);
        before
    }

    pub fn del_notify(&self, flags: RwFlag) -> RwFlag {
        let mut guard = self.rw_flag.lock().unwrap();
        let before = *guard;
        guard.remove(flags);
        before
    }

    pub fn rw_flag(&self) -> RwFlag {
        *self.rw_flag.lock().unwrap()
    }

    /// Invalidates the fd, leaving every other field intact for a moment
    /// longer so diagnostics and the linger-close path can still read
    /// `kind`/`remote_addr`. Returns the fd that was closed, or `None` if
    /// the dev was already invalid (double-close is a no-op, per spec §7's
    /// "programmer error" taxonomy).
    pub fn invalidate_fd(&self) -> Option<RawFd> {
        let mut guard = self.fd.lock().unwrap();
        if *guard < 0 {
            return None;
        }
        let fd = *guard;
        *guard = -1;
        Some(fd)
    }
}

impl Core {
    /// `iodev_new`.
    pub fn iodev_new(self: &Arc<Core>, kind: FdKind) -> Arc<Dev> {
        let id = self.alloc_dev_id();
        let dev = Arc::new(Dev::new(id, kind));
        self.iodev_add(Arc::clone(&dev));
        dev
    }

    /// `iodev_new_from_fd`.
    pub fn iodev_new_from_fd(
        self: &Arc<Core>,
        fd: RawFd,
        kind: FdKind,
        handler: Option<IoHandler>,
    ) -> Arc<Dev> {
        self.iodev_new_from_fd_with_sockopts(fd, kind, handler, false, false, false)
    }

    /// `iodev_new_from_fd`, recording creation-time socket option state
    /// (spec data model's `reuseaddr`/`reuseport`/`keepalive` fields).
    pub fn iodev_new_from_fd_with_sockopts(
        self: &Arc<Core>,
        fd: RawFd,
        kind: FdKind,
        handler: Option<IoHandler>,
        reuseaddr: bool,
        reuseport: bool,
        keepalive: bool,
    ) -> Arc<Dev> {
        let id = self.alloc_dev_id();
        let dev = Arc::new(Dev::new_from_fd_with_sockopts(
            id, fd, kind, handler, reuseaddr, reuseport, keepalive,
        ));
        self.iodev_add(Arc::clone(&dev));
        dev
    }

    /// `iodev_bind_epump` (spec §4.3). Unbinds any previous attachment
    /// first (binding twice unbinds first), then attaches `dev` to the
    /// pump(s) `bind_type` resolves to; if none are running yet the dev
    /// waits on the pending-assignment list for the first pump to start.
    /// A no-op, with the dev left in a clean unbound state, if the fd
    /// became invalid between allocation and bind.
    pub fn iodev_bind_epump(&self, dev: &Arc<Dev>, bind_type: BindType, no_poll: bool) {
        self.iodev_unbind_epump(dev);

        if !dev.is_valid() {
            return;
        }

        *dev.bind_type.lock().unwrap() = bind_type;
        dev.set_lifecycle(FdLifecycle::Bound);

        if matches!(bind_type, BindType::All) {
            self.global_iodev_add(dev.id);
        }

        if no_poll {
            return;
        }

        let targets = self.resolve_bind(&bind_type);
        if targets.is_empty() {
            if !matches!(bind_type, BindType::None | BindType::NewForEpump) {
                self.queue_pending_dev(Arc::clone(dev));
            }
            return;
        }

        for pump_id in targets {
            self.bind_dev_to_pump(pump_id, Arc::clone(dev));
        }
    }

    /// `unbind_epump`: removes `dev` from the global all-pump list (if
    /// present) and from whichever pump's device tree currently holds it.
    pub fn iodev_unbind_epump(&self, dev: &Arc<Dev>) {
        self.global_iodev_del(dev.id);
        if let Some(pump_id) = dev.owning_pump.lock().unwrap().take() {
            self.unbind_dev_from_pump(pump_id, dev.id);
        }
    }

    /// `iodev_linger_close` (spec §4.3): half-closes the write side and
    /// starts a 2-second idle timer that finishes the job with a full
    /// close, giving any already-queued outbound bytes a chance to drain.
    pub fn iodev_linger_close(self: &Arc<Core>, id: DevId) {
        let Some(dev) = self.iodev_find(id) else {
            return;
        };
        let fd = dev.fd();
        if fd >= 0 {
            unsafe {
                libc::shutdown(fd, libc::SHUT_WR);
            }
        }
        dev.set_lifecycle(FdLifecycle::Closing);

        let timer = Timer {
            id: self.alloc_timer_id(),
            cmd_id: IOTCMD_IDLE,
            deadline: Deadline::after(LINGER_CLOSE_MS),
            owning_pump: *dev.owning_pump.lock().unwrap(),
            caller_thread: 0,
            dev_for_idle: Some(id),
            handler: None,
        };
        self.iotimer_start(timer);
    }

    /// `iodev_tcp_nodelay_set`: only touches the socket when the tristate
    /// actually changes, and only records the change if the syscall
    /// succeeds, matching the original's "set once, remember it" discipline.
    pub fn iodev_tcp_nodelay_set(&self, dev: &Arc<Dev>, on: bool) -> Tristate {
        let want = if on { Tristate::On } else { Tristate::Off };
        let mut guard = dev.tcp_nodelay.lock().unwrap();
        if *guard != want {
            let fd = dev.fd();
            if fd >= 0 && socket::set_tcp_nodelay(fd, on).is_ok() {
                *guard = want;
            }
        }
        *guard
    }

    pub fn iodev_tcp_nodelay(&self, dev: &Arc<Dev>) -> Tristate {
        *dev.tcp_nodelay.lock().unwrap()
    }

    /// `iodev_tcp_nopush_set`. On Linux this maps to `TCP_CORK`, which the
    /// original documents as the nearest equivalent to BSD's `TCP_NOPUSH`.
    pub fn iodev_tcp_nopush_set(&self, dev: &Arc<Dev>, on: bool) -> Tristate {
        let want = if on { Tristate::On } else { Tristate::Off };
        let mut guard = dev.tcp_nopush.lock().unwrap();
        if *guard != want {
            let fd = dev.fd();
            if fd >= 0 && socket::set_tcp_nopush(fd, on).is_ok() {
                *guard = want;
            }
        }
        *guard
    }

    pub fn iodev_tcp_nopush(&self, dev: &Arc<Dev>) -> Tristate {
        *dev.tcp_nopush.lock().unwrap()
    }
}

impl Source for Dev {
    fn add(&self, poller: &Poller, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.fd().add(poller, token, interest, opts)
    }

    fn modify(
        &self,
        poller: &Poller,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.fd().modify(poller, token, interest, opts)
    }

    fn delete(&self, poller: &Poller) -> io::Result<()> {
        self.fd().delete(poller)
    }
}

impl fmt::Debug for Dev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dev")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fd", &self.fd())
            .field("rw_flag", &self.rw_flag())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
