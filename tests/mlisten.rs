//! E3: a listen dev bound `ALL_EPUMP` is picked up by a pump that starts
//! after it, and begins accepting without anyone re-registering it by
//! hand. `mlisten_open`'s non-`SO_REUSEPORT` fallback is exactly this
//! primitive (see `src/mlisten.rs`'s `mlisten_open_plain`), so exercising
//! it directly here covers the inheritance mechanism without depending on
//! whether the test host's kernel happens to support `SO_REUSEPORT`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use epump_core::{BindType, Core, DevId, EventKind, FdKind, IoHandler};

#[derive(Clone)]
struct DevSlot(Arc<Mutex<Option<DevId>>>);

impl DevSlot {
    fn new() -> DevSlot {
        DevSlot(Arc::new(Mutex::new(None)))
    }

    fn set(&self, id: DevId) {
        *self.0.lock().unwrap() = Some(id);
    }

    fn get(&self) -> Option<DevId> {
        *self.0.lock().unwrap()
    }
}

fn echo_handler(core: Arc<Core>, slot: DevSlot) -> IoHandler {
    Arc::new(move |kind, _fd_kind| {
        if kind == EventKind::Read {
            if let Some(dev) = slot.get().and_then(|id| core.iodev_find(id)) {
                let fd = dev.fd();
                let mut buf = [0u8; 512];
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n > 0 {
                    unsafe {
                        libc::write(fd, buf.as_ptr() as *const libc::c_void, n as usize);
                    }
                }
            }
        }
        0
    })
}

fn accept_handler(core: Arc<Core>, listen_slot: DevSlot) -> IoHandler {
    Arc::new(move |kind, _fd_kind| {
        if kind == EventKind::Accept {
            if let Some(listen_dev) = listen_slot.get().and_then(|id| core.iodev_find(id)) {
                let echo_slot = DevSlot::new();
                let handler = echo_handler(core.clone(), echo_slot.clone());
                if let Ok(accepted) = core.eptcp_accept(&listen_dev, BindType::One, Some(handler)) {
                    echo_slot.set(accepted.id);
                }
            }
        }
        0
    })
}

#[test]
fn second_pump_inherits_an_all_epump_listener() {
    let core = Core::new(1024);
    core.start_epump(1).expect("first pump should start");

    let listen_slot = DevSlot::new();
    let handler = accept_handler(core.clone(), listen_slot.clone());
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listen_dev = core
        .eptcp_listen(addr, BindType::All, Some(handler))
        .expect("ALL_EPUMP listen should succeed with one pump running");
    listen_slot.set(listen_dev.id);
    let bound_addr = listen_dev.local_addr.lock().unwrap().unwrap();

    // A connection before the second pump exists works off the first pump.
    let mut early = TcpStream::connect(bound_addr).expect("client should connect before second pump starts");
    early.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    early.write_all(b"before").unwrap();
    let mut buf = [0u8; 32];
    let n = early.read(&mut buf).expect("echo should come back from the first pump");
    assert_eq!(&buf[..n], b"before");

    core.start_epump(1).expect("second pump should start");
    std::thread::sleep(Duration::from_millis(200));

    // The dev is shared (ALL_EPUMP), so connections after the second pump
    // starts must still be accepted and echoed without any extra wiring.
    let mut later = TcpStream::connect(bound_addr).expect("client should connect after second pump starts");
    later.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    later.write_all(b"after").unwrap();
    let mut buf = [0u8; 32];
    let n = later.read(&mut buf).expect("echo should come back after the second pump joins");
    assert_eq!(&buf[..n], b"after");

    core.stop();
    core.join();
}

#[test]
fn mlisten_open_and_close_round_trip() {
    let core = Core::new(1024);
    core.start_epump(1).expect("pump should start");

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    // Bind once to pick a free ephemeral port, then hand that exact
    // address to `mlisten_open` (which needs a concrete port, not 0).
    let probe = std::net::TcpListener::bind(addr).unwrap();
    let chosen_addr = probe.local_addr().unwrap();
    drop(probe);

    core.mlisten_open(chosen_addr, FdKind::Listen, None)
        .expect("mlisten_open should succeed");
    std::thread::sleep(Duration::from_millis(50));

    core.mlisten_close(chosen_addr);

    core.stop();
    core.join();
}
