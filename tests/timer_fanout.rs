//! E2: many timers scheduled on a single pump fire in non-decreasing
//! deadline order, and delivery delay stays small for an otherwise idle
//! system.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use epump_core::Core;

#[test]
fn timers_fire_in_non_decreasing_deadline_order() {
    let core = Core::new(1024);
    core.start_epump(1).expect("pump should start");

    const COUNT: u64 = 200;

    let fired: Arc<Mutex<Vec<(u64, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    for i in 0..COUNT {
        // Spread deadlines across [1ms, 1000ms], same range E2 names.
        let ms = 1 + (i * 1000 / COUNT);
        let fired = fired.clone();
        let handler = Arc::new(move |_kind, _marker| {
            fired.lock().unwrap().push((ms, Instant::now()));
            0
        });
        core.start_timer(ms, 0, Some(handler), None);
    }

    // Every timer fires within ~1s; give the idle system comfortable
    // headroom before asserting.
    std::thread::sleep(Duration::from_millis(1500));

    let results = fired.lock().unwrap();
    assert_eq!(results.len(), COUNT as usize, "every timer must fire exactly once");

    let scheduled: Vec<u64> = results.iter().map(|(ms, _)| *ms).collect();
    let mut sorted = scheduled.clone();
    sorted.sort_unstable();
    assert_eq!(scheduled, sorted, "timers must fire in non-decreasing deadline order");

    for (ms, at) in results.iter() {
        let delay = at.duration_since(start).as_millis() as i64 - *ms as i64;
        assert!(delay <= 50, "timer {}ms fired {}ms late (budget 50ms)", ms, delay);
    }

    core.stop();
    core.join();
}

#[test]
fn stop_after_start_never_delivers_a_timeout() {
    use epump_core::EventKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    let core = Core::new(1024);
    core.start_epump(1).expect("pump should start");

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    let handler = Arc::new(move |kind, _marker| {
        if kind == EventKind::Timeout {
            fired2.store(true, Ordering::SeqCst);
        }
        0
    });

    let id = core.start_timer(50, 0, Some(handler), None);
    core.iotimer_stop(id);

    std::thread::sleep(Duration::from_millis(150));
    assert!(!fired.load(Ordering::SeqCst), "a stopped timer must never deliver TIMEOUT");

    core.stop();
    core.join();
}
