//! E1: listener accepts a connection, the accepted dev is bound
//! `ONE_EPUMP`, and bytes a client writes come back unchanged.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use epump_core::{BindType, Core, DevId, EventKind, IoHandler};

/// Holds the id of a dev a closure doesn't know about until after the
/// call that creates it returns (`eptcp_listen`/`eptcp_accept` both need
/// their handler up front).
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
fn echo_roundtrip() {
    let core = Core::new(1024);
    core.start_epump(1).expect("pump should start");

    let listen_slot = DevSlot::new();
    let handler = accept_handler(core.clone(), listen_slot.clone());
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listen_dev = core
        .eptcp_listen(addr, BindType::One, Some(handler))
        .expect("listen should succeed");
    listen_slot.set(listen_dev.id);

    let bound_addr = listen_dev
        .local_addr
        .lock()
        .unwrap()
        .expect("listener records its bound address");

    let mut client = TcpStream::connect(bound_addr).expect("client should connect");
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(b"hello epump").unwrap();

    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).expect("echo should come back within the timeout");
    assert_eq!(&buf[..n], b"hello epump");

    core.stop();
    core.join();
}

/// A second client on the same listener gets its own accepted dev and its
/// own independent echo stream (no cross-talk between connections).
#[test]
fn echo_handles_multiple_connections() {
    let core = Core::new(1024);
    core.start_epump(1).expect("pump should start");

    let listen_slot = DevSlot::new();
    let handler = accept_handler(core.clone(), listen_slot.clone());
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listen_dev = core
        .eptcp_listen(addr, BindType::One, Some(handler))
        .expect("listen should succeed");
    listen_slot.set(listen_dev.id);
    let bound_addr = listen_dev.local_addr.lock().unwrap().unwrap();

    let mut clients: Vec<TcpStream> = (0..3)
        .map(|_| {
            let c = TcpStream::connect(bound_addr).unwrap();
            c.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            c
        })
        .collect();

    for (i, client) in clients.iter_mut().enumerate() {
        let msg = format!("client-{}", i);
        client.write_all(msg.as_bytes()).unwrap();
        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], msg.as_bytes());
    }

    core.stop();
    core.join();
}
