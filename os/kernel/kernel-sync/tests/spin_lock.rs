use kernel_sync::SpinLock;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guard_releases_on_drop() {
    let lock = SpinLock::new(0_u32);
    {
        let mut guard = lock.lock();
        *guard = 41;
        assert!(lock.is_locked());
    }
    assert!(!lock.is_locked());
    *lock.lock() += 1;
    assert_eq!(*lock.lock(), 42);
}

#[test]
fn try_lock_fails_while_held() {
    let lock = SpinLock::new(1_u8);
    let first = lock.try_lock();
    assert!(first.is_some());
    assert!(lock.try_lock().is_none());
    assert_eq!(lock.try_with_lock(|v| *v), None);

    drop(first);
    assert_eq!(lock.try_with_lock(|v| *v), Some(1));
}

#[test]
fn with_lock_returns_closure_result() {
    let lock = SpinLock::new(Vec::<u64>::new());
    let len = lock.with_lock(|v| {
        v.extend([0x1000, 0x2000]);
        v.len()
    });
    assert_eq!(len, 2);
    assert_eq!(lock.into_inner(), vec![0x1000, 0x2000]);
}

#[test]
fn get_mut_needs_no_locking() {
    let mut lock = SpinLock::new([0_u8; 4]);
    lock.get_mut()[2] = 7;
    assert_eq!(*lock.lock(), [0, 0, 7, 0]);
}

#[test]
fn contended_counter_is_exact() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0_usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *v += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn panic_inside_critical_section_unlocks() {
    let lock = SpinLock::new(0_u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(lock.with_lock(|v| *v), 123);
}

#[test]
fn debug_does_not_lock() {
    let lock = SpinLock::new(5_u8);
    let _guard = lock.lock();
    assert_eq!(format!("{lock:?}"), "SpinLock { locked: true, .. }");
}
