use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use shared_owner::SharedPtr;

const THREADS: usize = 8;
const ROUNDS: usize = 1_000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

static DROPS: AtomicUsize = AtomicUsize::new(0);

/// Panics if dropped twice.
struct Sentinel {
    dropped: AtomicBool,
    payload: u64,
}

impl Sentinel {
    fn new(payload: u64) -> Sentinel {
        Sentinel {
            dropped: AtomicBool::new(false),
            payload,
        }
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        assert!(
            !self.dropped.swap(true, Ordering::SeqCst),
            "sentinel dropped twice"
        );
        DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

// Tests in this file share DROPS, so they serialize on this lock.
static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn copies_across_threads_restore_count() {
    init_logging();
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let before_drops = DROPS.load(Ordering::SeqCst);

    let shared = SharedPtr::new(Sentinel::new(42));
    let before = shared.use_count();

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let shared = &shared;
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    let copy = shared.clone();
                    assert!(copy.use_count() >= 2);
                    assert_eq!(copy.payload, 42);
                    drop(copy);
                }
            });
        }
    });

    assert_eq!(shared.use_count(), before);
    assert_eq!(DROPS.load(Ordering::SeqCst), before_drops);
    drop(shared);
    assert_eq!(DROPS.load(Ordering::SeqCst), before_drops + 1);
}

#[test]
fn last_owner_on_any_thread_frees_once() {
    init_logging();
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    for round in 0..100u64 {
        let before_drops = DROPS.load(Ordering::SeqCst);
        let shared = SharedPtr::new(Sentinel::new(round));
        let copies: Vec<_> = (0..THREADS).map(|_| shared.clone()).collect();
        drop(shared);

        std::thread::scope(|scope| {
            for copy in copies {
                scope.spawn(move || {
                    assert_eq!(copy.payload, round);
                    drop(copy);
                });
            }
        });

        assert_eq!(DROPS.load(Ordering::SeqCst), before_drops + 1);
    }
}

#[test]
fn moves_between_threads_do_not_count() {
    init_logging();
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let before_drops = DROPS.load(Ordering::SeqCst);

    let mut shared = SharedPtr::new(Sentinel::new(7));
    let keep = shared.clone();
    let moved = SharedPtr::take(&mut shared);

    let count = std::thread::scope(|scope| scope.spawn(move || moved.use_count()).join().unwrap());
    assert_eq!(count, 2);
    assert_eq!(keep.use_count(), 1);
    assert!(SharedPtr::is_empty(&shared));
    drop(keep);
    assert_eq!(DROPS.load(Ordering::SeqCst), before_drops + 1);
}

#[test]
fn unique_owner_can_mutate_after_join() {
    init_logging();
    let mut counter = SharedPtr::new(Mutex::new(0usize));

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let copy = counter.clone();
            scope.spawn(move || {
                *copy.lock().unwrap() += 1;
            });
        }
    });

    let total = SharedPtr::get_mut(&mut counter)
        .map(|m| *m.get_mut().unwrap())
        .expect("all copies were dropped");
    assert_eq!(total, THREADS);
}
