use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[cfg(feature = "log")]
use log::{trace, warn};

use crate::dev::{Dev, DevId, FdKind, IoState};
use crate::event::{Event, EventKind, Target};
use crate::queue::EventQueue;
use crate::registry::{Core, PumpId};
use crate::sys::epoll::Events;
use crate::sys::socket;
use crate::timer::{Deadline, Timer, TimerId, IOTCMD_IDLE};
use crate::{PollOpt, Poller, Ready, Token};

/// Token a pump's own cross-thread event queue is registered under.
const WAKE_TOKEN: Token = Token(0);
/// Token the command queue (bind/timer requests from other threads) is
/// registered under. Dev ids start at 100 (spec §4.8) so neither of these
/// reserved low tokens can collide with a device's `Token(dev_id.0)`.
const CMD_TOKEN: Token = Token(1);

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Requests a foreign thread queues for a pump to apply on its own turn,
/// since only the pump thread ever touches its `device_tree`/`timer_wheel`
/// or calls into its `Poller`.
pub enum PumpCmd {
    BindDev(Arc<Dev>),
    UnbindDev(DevId),
    SetNotify(DevId, Ready),
    StartTimer(Timer),
    StopTimer(TimerId),
}

/// Control-plane handle `Core` keeps for a running pump: everything a
/// foreign thread needs to hand the pump work or ask it to stop, without
/// touching the pump's own epoll fd or device tree directly.
pub struct PumpHandle {
    id: PumpId,
    event_queue: EventQueue<Event>,
    cmd_queue: EventQueue<PumpCmd>,
    objnum: Arc<AtomicUsize>,
    quit: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PumpHandle {
    pub fn id(&self) -> PumpId {
        self.id
    }

    pub fn queue(&self) -> EventQueue<Event> {
        self.event_queue.clone()
    }

    /// `epump_objnum(0)`: devices + timers, used to sort the pump list by
    /// load every 5 seconds (spec §4.6).
    pub fn objnum(&self) -> usize {
        self.objnum.load(Ordering::Relaxed)
    }

    /// Wakes the pump out of `poller.dispatch` without queueing any
    /// particular event; used by `core.stop()` and after queueing a
    /// command this pump needs to notice promptly.
    pub fn wake(&self) {
        let _ = self.cmd_queue.wake();
    }

    pub fn bind_dev(&self, dev: Arc<Dev>) {
        let _ = self.cmd_queue.push(PumpCmd::BindDev(dev));
    }

    pub fn unbind_dev(&self, id: DevId) {
        let _ = self.cmd_queue.push(PumpCmd::UnbindDev(id));
    }

    pub fn set_notify(&self, id: DevId, ready: Ready) {
        let _ = self.cmd_queue.push(PumpCmd::SetNotify(id, ready));
    }

    pub fn push_timer(&self, timer: Timer) {
        let _ = self.cmd_queue.push(PumpCmd::StartTimer(timer));
    }

    pub fn stop_timer(&self, id: TimerId) {
        let _ = self.cmd_queue.push(PumpCmd::StopTimer(id));
    }

    /// Event de-duplication on dequeue (object-id re-validation, spec
    /// §4.5/§8 property 3) already keeps a closed dev's stale events from
    /// running a callback, so there is nothing further to scrub out of
    /// the cross-thread queues themselves here.
    pub fn purge_dev(&self, _id: DevId) {}

    pub fn join(self) {
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// State private to the pump thread: its `Poller`, its device and timer
/// trees, and the two queues it drains every loop iteration.
struct PumpRuntime {
    id: PumpId,
    core: Arc<Core>,
    poller: Poller,
    devices: indexmap::IndexMap<DevId, Arc<Dev>>,
    timers: crate::timer::TimerWheel,
    event_queue: EventQueue<Event>,
    cmd_queue: EventQueue<PumpCmd>,
    events: Events,
    objnum: Arc<AtomicUsize>,
    quit: Arc<AtomicBool>,
}

/// Spawns a new pump thread and blocks until it has finished standing up
/// its `Poller` and queues, returning the handle `Core` keeps for it.
pub fn spawn(id: PumpId, core: Arc<Core>) -> io::Result<PumpHandle> {
    let objnum = Arc::new(AtomicUsize::new(0));
    let quit = Arc::new(AtomicBool::new(false));
    let objnum2 = Arc::clone(&objnum);
    let quit2 = Arc::clone(&quit);

    let (ready_tx, ready_rx) = mpsc::channel();

    let join = thread::Builder::new()
        .name(format!("epump-pump-{}", id.0))
        .spawn(move || match PumpRuntime::new(id, core, objnum2, quit2) {
            Ok((runtime, event_queue, cmd_queue)) => {
                let _ = ready_tx.send(Ok((event_queue, cmd_queue)));
                runtime.run();
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })?;

    let (event_queue, cmd_queue) = ready_rx
        .recv()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "pump thread exited before starting"))??;

    Ok(PumpHandle {
        id,
        event_queue,
        cmd_queue,
        objnum,
        quit,
        join: Mutex::new(Some(join)),
    })
}

impl PumpRuntime {
    fn new(
        id: PumpId,
        core: Arc<Core>,
        objnum: Arc<AtomicUsize>,
        quit: Arc<AtomicBool>,
    ) -> io::Result<(PumpRuntime, EventQueue<Event>, EventQueue<PumpCmd>)> {
        let poller = Poller::new()?;
        let event_queue = EventQueue::new(&poller, WAKE_TOKEN)?;
        let cmd_queue = EventQueue::new(&poller, CMD_TOKEN)?;

        let runtime = PumpRuntime {
            id,
            core,
            poller,
            devices: indexmap::IndexMap::new(),
            timers: crate::timer::TimerWheel::new(),
            event_queue: event_queue.clone(),
            cmd_queue: cmd_queue.clone(),
            events: Poller::events(DEFAULT_EVENT_CAPACITY),
            objnum,
            quit,
        };

        Ok((runtime, event_queue, cmd_queue))
    }

    /// Main dispatch loop (spec §4.6): register self, inherit the
    /// all-pump devices and any timers queued before a pump existed, then
    /// alternate `check_timeout`/`ioevent_handle` with `poller.dispatch`
    /// until told to quit.
    fn run(mut self) {
        self.core.set_current_pump(Some(self.id));
        self.inherit_global_state();

        while !self.quit.load(Ordering::Relaxed) && !self.core.is_quit() {
            loop {
                let fired = self.check_timeout();
                self.drain_event_queue();
                self.drain_cmd_queue();
                if !fired {
                    break;
                }
            }

            self.objnum
                .store(self.devices.len() + self.timers.len(), Ordering::Relaxed);

            let timeout_ms = self.timers.next_timeout_ms().map(|ms| ms.min(i32::MAX as u64) as i32);

            match self.poller.wait(&mut self.events, timeout_ms) {
                Ok(n) => self.handle_readiness(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_e) => {
                    #[cfg(feature = "log")]
                    warn!("pump {:?}: poller wait failed: {}", self.id, _e);
                }
            }

            let _ = self.event_queue.ack();
            let _ = self.cmd_queue.ack();
        }

        self.core.set_current_pump(None);
    }

    fn inherit_global_state(&mut self) {
        for dev in self.core.global_iodev_getmon() {
            self.register_dev(dev);
        }
        for dev in self.core.take_pending_devs() {
            self.register_dev(dev);
        }
        for timer in self.core.global_iotimer_take() {
            self.core.note_timer_owner(timer.id, self.id);
            self.timers.insert(timer);
        }
    }

    /// Pops every expired timer and dispatches a `TIMEOUT` event for it.
    /// Returns whether any timer fired, so the caller can keep alternating
    /// with `ioevent_handle` per spec §4.6 step (c).
    fn check_timeout(&mut self) -> bool {
        let expired = self.timers.pop_expired(Deadline::now());
        if expired.is_empty() {
            return false;
        }

        for timer in expired {
            self.core.forget_timer_owner(timer.id);

            if timer.cmd_id == IOTCMD_IDLE {
                if let Some(dev_id) = timer.dev_for_idle {
                    self.core.iodev_close(dev_id);
                }
            }

            let mut event = Event::new(EventKind::Timeout, Target::Timer(timer.id));
            event.target_pump = Some(self.id);
            event.handler = timer.handler.or_else(|| self.core.default_callback());
            self.core.dispatch_event(event);
        }

        true
    }

    fn drain_event_queue(&mut self) {
        while let Ok(event) = self.event_queue.pop() {
            self.handle_event(event);
        }
    }

    fn drain_cmd_queue(&mut self) {
        while let Ok(cmd) = self.cmd_queue.pop() {
            self.handle_cmd(cmd);
        }
    }

    fn handle_cmd(&mut self, cmd: PumpCmd) {
        match cmd {
            PumpCmd::BindDev(dev) => self.register_dev(dev),
            PumpCmd::UnbindDev(id) => self.unregister_dev(id),
            PumpCmd::SetNotify(id, ready) => self.set_notify(id, ready),
            PumpCmd::StartTimer(timer) => {
                self.core.note_timer_owner(timer.id, self.id);
                self.timers.insert(timer);
            }
            PumpCmd::StopTimer(id) => {
                if let Some(deadline) = self.timers.find_deadline(id) {
                    self.timers.remove(id, deadline);
                }
            }
        }
    }

    fn register_dev(&mut self, dev: Arc<Dev>) {
        if !dev.is_valid() {
            return;
        }
        let ready = dev.rw_flag().to_ready();
        if let Err(_e) = self.poller.add(&*dev, Token(dev.id.0), ready, PollOpt::level()) {
            #[cfg(feature = "log")]
            warn!("pump {:?}: failed to register dev {}: {}", self.id, dev.id, _e);
            return;
        }
        *dev.owning_pump.lock().unwrap() = Some(self.id);
        self.devices.insert(dev.id, dev);
    }

    fn unregister_dev(&mut self, id: DevId) {
        if let Some(dev) = self.devices.shift_remove(&id) {
            let _ = self.poller.delete(&*dev);
        }
    }

    fn set_notify(&mut self, id: DevId, ready: Ready) {
        if let Some(dev) = self.devices.get(&id) {
            if dev.is_valid() {
                let _ = self.poller.modify(&**dev, Token(id.0), ready, PollOpt::level());
            }
        }
    }

    /// Classifies raw readiness per spec §4.2: listen-ready → ACCEPT,
    /// connect-pending + writable → CONNECTED/CONNFAIL, error/hangup →
    /// INVALID_DEV, otherwise READ and/or WRITE.
    fn handle_readiness(&mut self, n: usize) {
        for i in 0..n {
            let Some(raw) = self.events.get(i) else { continue };
            let token = raw.token();
            if token == WAKE_TOKEN || token == CMD_TOKEN {
                continue;
            }

            let dev_id = DevId(token.0);
            let Some(dev) = self.devices.get(&dev_id).cloned() else {
                continue;
            };
            if !dev.is_valid() {
                continue;
            }

            let ready = raw.kind();

            if ready.is_error() || ready.is_hup() {
                self.emit(&dev, EventKind::InvalidDev);
                continue;
            }

            match dev.kind {
                FdKind::Listen | FdKind::UnixListen => {
                    if ready.is_readable() {
                        self.emit(&dev, EventKind::Accept);
                    }
                }
                _ => {
                    let connecting = *dev.io_state.lock().unwrap() == IoState::Connecting;
                    if connecting && ready.is_writable() {
                        match socket::socket_error(dev.fd()) {
                            Ok(()) => {
                                *dev.io_state.lock().unwrap() = IoState::ReadWrite;
                                self.emit(&dev, EventKind::Connected);
                            }
                            Err(_) => self.emit(&dev, EventKind::ConnFail),
                        }
                        continue;
                    }

                    if ready.is_readable() {
                        self.emit_dedup(&dev, EventKind::Read, &dev.read_pending);
                    }
                    if ready.is_writable() {
                        self.emit_dedup(&dev, EventKind::Write, &dev.write_pending);
                    }
                }
            }
        }
    }

    fn emit(&self, dev: &Arc<Dev>, kind: EventKind) {
        let mut event = Event::new(kind, Target::Dev(dev.id));
        event.target_pump = Some(self.id);
        event.target_worker = *dev.preferred_worker.lock().unwrap();
        event.handler = dev.handler.clone().or_else(|| self.core.default_callback());
        self.core.dispatch_event(event);
    }

    /// Spec §4.5's de-duplication rule: a second READ/WRITE for the same
    /// dev is never queued while one is still outstanding.
    fn emit_dedup(&self, dev: &Arc<Dev>, kind: EventKind, pending: &AtomicBool) {
        if pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit(dev, kind);
    }

    /// Pop + execute (spec §4.5): re-verify the target against the
    /// registry before running its callback, so an event for a dev closed
    /// after it was queued is dropped silently instead of touching freed
    /// state (testable property 3).
    fn handle_event(&mut self, event: Event) {
        match event.target {
            Target::Dev(id) => {
                let Some(dev) = self.core.iodev_find(id) else {
                    #[cfg(feature = "log")]
                    trace!("pump {:?}: dropping event for closed dev {}", self.id, id);
                    return;
                };
                match event.kind {
                    EventKind::Read => dev.read_pending.store(false, Ordering::Release),
                    EventKind::Write => dev.write_pending.store(false, Ordering::Release),
                    _ => {}
                }
                *dev.preferred_worker.lock().unwrap() = event.target_worker;
                if let Some(handler) = &event.handler {
                    let _ = handler(event.kind, dev.kind.marker());
                }
            }
            Target::Timer(_) => {
                if let Some(handler) = &event.handler {
                    let _ = handler(event.kind, FdKind::Timer.marker());
                }
            }
            Target::DnsMessage(msg_id) => {
                self.core.dns_deliver(msg_id);
            }
        }
    }
}
