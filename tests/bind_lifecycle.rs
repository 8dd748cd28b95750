//! E8: bind/unbind/bind idempotence (a dev ends up bound to exactly one
//! pump no matter how many times it's bound) and E6: closing a dev mid
//! event-storm drops its in-flight events instead of touching freed
//! state (testable property 3).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use epump_core::{BindType, Core, Dev, EventKind, FdKind};

fn eventfd_dev(core: &Arc<Core>) -> Arc<Dev> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(fd >= 0, "eventfd(2) should succeed");
    core.iodev_new_from_fd(fd, FdKind::RawSock, None)
}

#[test]
fn bind_unbind_bind_is_idempotent() {
    let core = Core::new(1024);
    core.start_epump(2).expect("pumps should start");

    let dev = eventfd_dev(&core);

    core.iodev_bind_epump(&dev, BindType::One, false);
    std::thread::sleep(Duration::from_millis(50));
    assert!(
        dev.owning_pump.lock().unwrap().is_some(),
        "dev should be bound to exactly one pump"
    );

    // Binding again unbinds first (registry.rs's iodev_bind_epump doc
    // comment), so this never ends up double-registered in two device
    // trees at once.
    core.iodev_bind_epump(&dev, BindType::One, false);
    std::thread::sleep(Duration::from_millis(50));
    assert!(dev.owning_pump.lock().unwrap().is_some());

    core.iodev_unbind_epump(&dev);
    assert!(
        dev.owning_pump.lock().unwrap().is_none(),
        "unbind should clear ownership immediately"
    );

    core.iodev_bind_epump(&dev, BindType::One, false);
    std::thread::sleep(Duration::from_millis(50));
    assert!(
        dev.owning_pump.lock().unwrap().is_some(),
        "rebinding after unbind should succeed"
    );

    core.iodev_close(dev.id);
    core.stop();
    core.join();
}

/// Closing a dev while a flood of READ readiness events for it is still
/// working its way through the queue must not run its callback on freed
/// state — the pump/worker re-verify the dev's identity against the
/// registry on dequeue and drop anything for an id that's gone.
#[test]
fn closing_a_dev_drops_its_in_flight_events() {
    let core = Core::new(1024);
    core.start_epump(1).expect("pump should start");
    core.start_worker(2).expect("workers should start");

    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let handler = Arc::new(move |kind: EventKind, _marker: i32| {
        if kind == EventKind::Read {
            calls2.fetch_add(1, Ordering::SeqCst);
        }
        0
    });

    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(fd >= 0);
    let dev = core.iodev_new_from_fd(fd, FdKind::RawSock, Some(handler));
    core.iodev_bind_epump(&dev, BindType::One, false);
    std::thread::sleep(Duration::from_millis(50));

    // Bump the eventfd's counter so it is read-ready, then immediately
    // close the dev — any READ event already in flight must be dropped
    // rather than delivered to a callback whose dev no longer exists.
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
    }
    core.iodev_close(dev.id);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        calls.load(Ordering::SeqCst),
        0,
        "a closed dev must not run its callback for a stale event"
    );
    assert!(core.iodev_find(dev.id).is_none(), "closed dev id must not resolve");

    core.stop();
    core.join();
}

/// Double-close on an already-closed id is a harmless no-op rather than a
/// panic or a double free (testable property 6).
#[test]
fn closing_an_unknown_dev_twice_is_a_no_op() {
    let core = Core::new(1024);
    let dev = eventfd_dev(&core);
    core.iodev_close(dev.id);
    core.iodev_close(dev.id);
    assert!(core.iodev_close_by(dev.id).is_err(), "second close should report unknown id");
}
