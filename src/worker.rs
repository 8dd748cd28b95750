use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(feature = "log")]
use log::warn;

use crate::event::{Event, EventKind, Target};
use crate::queue::EventQueue;
use crate::registry::{Core, WorkerId};
use crate::Poller;
use crate::Token;

const WAKE_TOKEN: Token = Token(0);

/// Bound on the worker's wait (spec §4.7: "wait up to 5s on the event
/// signal").
const WAIT_TIMEOUT_MS: i32 = 5_000;

/// Window `real_load` is recomputed over (spec §4.7).
const LOAD_WINDOW: Duration = Duration::from_secs(10);

/// Nominal queue capacity `real_load`'s queue-length term is normalised
/// against. The original pools fds out of a fixed-size table; a worker's
/// `EventQueue` is unbounded, so this stands in for "pool capacity" as a
/// load-shedding signal rather than a hard limit.
const NOMINAL_QUEUE_CAPACITY: f64 = 1024.0;

/// Control-plane handle `Core` keeps for a running worker.
pub struct WorkerHandle {
    id: WorkerId,
    queue: EventQueue<Event>,
    real_load_bits: Arc<AtomicU64>,
    quit: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn queue(&self) -> EventQueue<Event> {
        self.queue.clone()
    }

    pub fn wake(&self) {
        let _ = self.queue.wake();
    }

    /// `real_load` as last computed over the trailing 10-second window;
    /// used to sort the worker list (spec §4.7), round-robin within the
    /// window otherwise.
    pub fn real_load(&self) -> f64 {
        f64::from_bits(self.real_load_bits.load(Ordering::Relaxed))
    }

    pub fn purge_dev(&self, _id: crate::dev::DevId) {}

    pub fn join(self) {
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

struct WorkerRuntime {
    id: WorkerId,
    core: Arc<Core>,
    poller: Poller,
    queue: EventQueue<Event>,
    real_load_bits: Arc<AtomicU64>,
    quit: Arc<AtomicBool>,
    idle_time: Duration,
    working_time: Duration,
    window_start: Instant,
    accumulated_events: u64,
}

pub fn spawn(id: WorkerId, core: Arc<Core>) -> io::Result<WorkerHandle> {
    let real_load_bits = Arc::new(AtomicU64::new(0f64.to_bits()));
    let quit = Arc::new(AtomicBool::new(false));
    let real_load2 = Arc::clone(&real_load_bits);
    let quit2 = Arc::clone(&quit);

    let (ready_tx, ready_rx) = mpsc::channel();

    let join = thread::Builder::new()
        .name(format!("epump-worker-{}", id.0))
        .spawn(move || match WorkerRuntime::new(id, core, real_load2, quit2) {
            Ok((runtime, queue)) => {
                let _ = ready_tx.send(Ok(queue));
                runtime.run();
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })?;

    let queue = ready_rx
        .recv()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "worker thread exited before starting"))??;

    Ok(WorkerHandle {
        id,
        queue,
        real_load_bits,
        quit,
        join: Mutex::new(Some(join)),
    })
}

impl WorkerRuntime {
    fn new(
        id: WorkerId,
        core: Arc<Core>,
        real_load_bits: Arc<AtomicU64>,
        quit: Arc<AtomicBool>,
    ) -> io::Result<(WorkerRuntime, EventQueue<Event>)> {
        let poller = Poller::new()?;
        let queue = EventQueue::new(&poller, WAKE_TOKEN)?;

        let runtime = WorkerRuntime {
            id,
            core,
            poller,
            queue: queue.clone(),
            real_load_bits,
            quit,
            idle_time: Duration::ZERO,
            working_time: Duration::ZERO,
            window_start: Instant::now(),
            accumulated_events: 0,
        };

        Ok((runtime, queue))
    }

    fn run(mut self) {
        let mut events = Poller::events(16);

        while !self.quit.load(Ordering::Relaxed) && !self.core.is_quit() {
            let wait_start = Instant::now();
            match self.poller.wait(&mut events, Some(WAIT_TIMEOUT_MS)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_e) => {
                    #[cfg(feature = "log")]
                    warn!("worker {:?}: poller wait failed: {}", self.id, _e);
                }
            }
            self.idle_time += wait_start.elapsed();
            let _ = self.queue.ack();

            let work_start = Instant::now();
            while let Ok(event) = self.queue.pop() {
                self.handle_event(event);
                self.accumulated_events += 1;
                self.core.bump_worker_events();
            }
            self.working_time += work_start.elapsed();

            if self.window_start.elapsed() >= LOAD_WINDOW {
                self.recompute_load();
            }
        }
    }

    fn recompute_load(&mut self) {
        let total = (self.idle_time + self.working_time).as_secs_f64();
        let working_ratio = if total > 0.0 {
            self.working_time.as_secs_f64() / total
        } else {
            0.0
        };

        let queue_term = (self.queue.len() as f64 / NOMINAL_QUEUE_CAPACITY).min(1.0);
        let share_term = {
            let grand_total = self.core.total_worker_events().max(1) as f64;
            (self.accumulated_events as f64 / grand_total).min(1.0)
        };

        let real_load = 0.6 * queue_term + 0.3 * working_ratio + 0.1 * share_term;
        self.real_load_bits.store(real_load.to_bits(), Ordering::Relaxed);

        self.idle_time = Duration::ZERO;
        self.working_time = Duration::ZERO;
        self.window_start = Instant::now();
    }

    /// Identical re-verify-then-execute discipline to `Pump::handle_event`
    /// (spec §4.5): a worker is just another consumer of the same event
    /// queues, dispatched to because it is less loaded than every pump.
    fn handle_event(&mut self, event: Event) {
        self.core.set_current_pump(event.target_pump);

        match event.target {
            Target::Dev(id) => {
                let Some(dev) = self.core.iodev_find(id) else {
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
                    let _ = handler(event.kind, crate::dev::FdKind::Timer.marker());
                }
            }
            Target::DnsMessage(msg_id) => {
                self.core.dns_deliver(msg_id);
            }
        }

        self.core.set_current_pump(None);
    }
}
