use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::dev::{BindType, Dev, DevId, FdKind};
use crate::event::IoHandler;
use crate::net;
use crate::registry::{Core, PumpId};

/// One logical listen endpoint projected onto every pump (spec §4.9, C9).
///
/// When the kernel supports `SO_REUSEPORT`, `devs` holds one dev id per
/// running pump, each wrapping its own socket bound to the same
/// `(ip, port)`; the kernel balances `accept`/`recvfrom` across them.
/// Otherwise `devs` holds exactly one dev id, bound `ALL_EPUMP`, shared by
/// every pump's device tree.
#[derive(Clone)]
pub struct MlistenRecord {
    pub addr: SocketAddr,
    pub fd_kind: FdKind,
    pub reuseport: bool,
    handler: Option<IoHandler>,
    pub devs: Vec<DevId>,
}

impl Core {
    /// `mlisten_open`: records the endpoint globally and creates per-pump
    /// listening devs where possible, falling back to a single socket
    /// shared via `ALL_EPUMP` when `SO_REUSEPORT` is unavailable.
    pub fn mlisten_open(
        self: &Arc<Core>,
        addr: SocketAddr,
        fd_kind: FdKind,
        handler: Option<IoHandler>,
    ) -> io::Result<()> {
        let reuseport = self.reuseport_supported() && matches!(fd_kind, FdKind::Listen | FdKind::UdpServer);

        let mut record = MlistenRecord {
            addr,
            fd_kind,
            reuseport,
            handler: handler.clone(),
            devs: Vec::new(),
        };

        if reuseport {
            for pump_id in self.epump_thread_list() {
                match self.mlisten_open_reuseport(addr, fd_kind, handler.clone(), pump_id) {
                    Ok(dev) => record.devs.push(dev.id),
                    Err(_e) => {
                        #[cfg(feature = "log")]
                        warn!("mlisten_open: reuseport socket for pump {:?} failed: {}", pump_id, _e);
                    }
                }
            }
        } else {
            let dev = self.mlisten_open_plain(addr, fd_kind, handler)?;
            record.devs.push(dev.id);
        }

        #[cfg(feature = "log")]
        debug!(
            "mlisten_open: {} on {:?} ({})",
            addr,
            fd_kind,
            if reuseport { "reuseport" } else { "shared" }
        );
        self.mlisten_add(record);
        Ok(())
    }

    /// `mlisten_close`: removes devs from every pump and forgets the
    /// record.
    pub fn mlisten_close(&self, addr: SocketAddr) {
        for record in self.mlisten_snapshot() {
            if record.addr != addr {
                continue;
            }
            for dev_id in &record.devs {
                self.iodev_close(*dev_id);
            }
        }
        self.mlisten_remove(addr);
    }

    /// Called by [`Core::start_epump`] right after a new pump registers:
    /// every tracked `SO_REUSEPORT` record mints that pump its own socket.
    /// `ALL_EPUMP` fallback records need nothing further — the new pump
    /// already inherits their single shared dev via the global dev list.
    pub(crate) fn mlisten_on_pump_started(self: &Arc<Core>, pump_id: PumpId) {
        let snapshot = self.mlisten_snapshot();
        for record in snapshot {
            if !record.reuseport {
                continue;
            }
            match self.mlisten_open_reuseport(record.addr, record.fd_kind, record.handler.clone(), pump_id) {
                Ok(dev) => {
                    let id = dev.id;
                    self.mlisten_for_each_mut(|r| {
                        if r.addr == record.addr && r.reuseport {
                            r.devs.push(id);
                        }
                    });
                }
                Err(_e) => {
                    #[cfg(feature = "log")]
                    warn!(
                        "mlisten: new pump {:?} failed to mint reuseport socket for {}: {}",
                        pump_id, record.addr, _e
                    );
                }
            }
        }
    }

    fn mlisten_open_reuseport(
        self: &Arc<Core>,
        addr: SocketAddr,
        fd_kind: FdKind,
        handler: Option<IoHandler>,
        pump_id: PumpId,
    ) -> io::Result<Arc<Dev>> {
        let fd = match fd_kind {
            FdKind::Listen => net::reuseport_tcp_listener(addr)?,
            FdKind::UdpServer => net::reuseport_udp_socket(addr)?,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported mlisten fd_kind")),
        };

        // reuseport_tcp_listener/reuseport_udp_socket already failed out
        // above if either option didn't take, so both held by the time we
        // get here.
        let dev = self.iodev_new_from_fd_with_sockopts(fd, fd_kind, handler, true, true, false);
        *dev.local_addr.lock().unwrap() = Some(addr);
        self.iodev_bind_epump(&dev, BindType::Given(pump_id.0), false);
        Ok(dev)
    }

    fn mlisten_open_plain(
        self: &Arc<Core>,
        addr: SocketAddr,
        fd_kind: FdKind,
        handler: Option<IoHandler>,
    ) -> io::Result<Arc<Dev>> {
        match fd_kind {
            FdKind::Listen => self.eptcp_listen(addr, BindType::All, handler),
            FdKind::UdpServer => self.epudp_listen(addr, BindType::All, handler),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported mlisten fd_kind")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tracks_addr_and_devs() {
        let record = MlistenRecord {
            addr: "127.0.0.1:0".parse().unwrap(),
            fd_kind: FdKind::Listen,
            reuseport: true,
            handler: None,
            devs: vec![DevId(100), DevId(101)],
        };
        assert_eq!(record.devs.len(), 2);
        assert!(record.reuseport);
    }
}
