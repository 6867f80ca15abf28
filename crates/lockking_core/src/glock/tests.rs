use super::*;
use std::{
    thread,
    time::{Duration, Instant},
};

use crate::matrix::{HIERARCHICAL_MATRIX, READER_WRITER_MATRIX, hierarchical_modes::*, rw_modes::*};

const IS4 : usize = 0;
const IX4 : usize = 1;
const S4  : usize = 2;
const X4  : usize = 3;

fn four_mode_matrix() -> CompatibilityMatrix {
    CompatibilityMatrix::from_pairs(4, &[(IS4, IS4), (IS4, IX4), (IX4, IX4), (IS4, S4), (S4, S4)]).unwrap()
}

fn wait_for_waiters(lock: &GLock<'_>, count: u64) {
    let start = Instant::now();
    while lock.snapshot().waiters < count {
        assert!(start.elapsed() < Duration::from_secs(10), "waiters never blocked");
        thread::sleep(Duration::from_millis(1));
    }
}

fn assert_modes_compatible(state: &GLockState, matrix: &CompatibilityMatrix) {
    for (i, &a) in state.grants.iter().enumerate() {
        for (j, &b) in state.grants.iter().enumerate() {
            if a > 0 && b > 0 {
                assert!(matrix.compatible(i, j), "modes {i} and {j} held together: {state:?}");
            }
        }
    }
}

#[test]
fn glock_new() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
    assert_eq!(lock.mode_count(), 5);
    assert!(!lock.has_external_mutex());
    assert!(!lock.is_locked());
    assert!(!lock.has_waiters());
    assert!(!lock.is_referenced());
    assert_eq!(lock.snapshot(), GLockState { grants: vec![0; 5], waiters: 0 });
}

#[test]
fn glock_acquire_release() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();

    assert_eq!(lock.acquire(IS, Timeout::Immediate), Ok(()));
    assert_eq!(lock.acquire(IS, Timeout::Immediate), Ok(()));
    assert_eq!(lock.acquire(IX, Timeout::Immediate), Ok(()));
    assert_eq!(lock.grants(IS), Ok(2));
    assert_eq!(lock.grants(IX), Ok(1));
    assert!(lock.is_locked());

    assert_eq!(lock.acquire(S, Timeout::Immediate), Err(LockError::WouldBlock));
    assert_eq!(lock.acquire(X, Timeout::Immediate), Err(LockError::WouldBlock));

    assert_eq!(lock.release(IX), Ok(()));
    assert_eq!(lock.acquire(S, Timeout::Immediate), Ok(()));

    assert_eq!(lock.release(IS), Ok(()));
    assert_eq!(lock.release(IS), Ok(()));
    assert_eq!(lock.release(S), Ok(()));
    assert!(!lock.is_locked());
}

#[test]
fn glock_invalid_mode() {
    let lock = GLock::new(&READER_WRITER_MATRIX).unwrap();
    let err = LockError::InvalidMode { mode: 2, mode_count: 2 };

    assert_eq!(lock.acquire(2, Timeout::Infinite), Err(err));
    assert_eq!(lock.release(2), Err(err));
    assert_eq!(lock.transition(READ, 2, Timeout::Infinite), Err(err));
    assert_eq!(lock.transition(2, READ, Timeout::Infinite), Err(err));
    assert_eq!(lock.grants(2), Err(err));
    assert!(!lock.is_referenced());
}

#[test]
fn glock_release_not_held() {
    let lock = GLock::new(&READER_WRITER_MATRIX).unwrap();
    assert_eq!(lock.release(READ), Err(LockError::NotHeld));

    lock.acquire(READ, Timeout::Immediate).unwrap();
    assert_eq!(lock.release(WRITE), Err(LockError::NotHeld));
    assert_eq!(lock.snapshot().grants, [1, 0]);
}

#[test]
fn glock_self_incompatible_mode() {
    let lock = GLock::new(&READER_WRITER_MATRIX).unwrap();
    lock.acquire(WRITE, Timeout::Immediate).unwrap();
    assert_eq!(lock.acquire(WRITE, Timeout::Immediate), Err(LockError::WouldBlock));
    assert_eq!(lock.acquire(READ, Timeout::Immediate), Err(LockError::WouldBlock));
}

#[test]
fn glock_timed_out_acquire_leaves_state() {
    let lock = GLock::new(&READER_WRITER_MATRIX).unwrap();
    lock.acquire(READ, Timeout::Immediate).unwrap();
    let before = lock.snapshot();

    let start = Instant::now();
    assert_eq!(lock.acquire(WRITE, Timeout::Bounded(Duration::from_millis(30))), Err(LockError::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(lock.snapshot(), before);
}

#[test]
fn glock_transition_ignores_own_grant() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();

    // The only holder may move from S to X, even though S and X are incompatible
    lock.acquire(S, Timeout::Immediate).unwrap();
    assert_eq!(lock.transition(S, X, Timeout::Immediate), Ok(()));
    assert_eq!(lock.snapshot().grants, [0, 0, 0, 0, 1]);

    assert_eq!(lock.transition(X, IS, Timeout::Immediate), Ok(()));
    assert_eq!(lock.snapshot().grants, [1, 0, 0, 0, 0]);
}

#[test]
fn glock_transition_blocked_by_others() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
    lock.acquire(S, Timeout::Immediate).unwrap();
    lock.acquire(S, Timeout::Immediate).unwrap();
    let before = lock.snapshot();

    assert_eq!(lock.transition(S, X, Timeout::Immediate), Err(LockError::WouldBlock));
    assert_eq!(lock.transition(S, X, Timeout::Bounded(Duration::from_millis(10))), Err(LockError::TimedOut));
    assert_eq!(lock.snapshot(), before);
}

#[test]
fn glock_transition_not_held() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
    lock.acquire(IS, Timeout::Immediate).unwrap();
    assert_eq!(lock.transition(IX, S, Timeout::Infinite), Err(LockError::NotHeld));
    assert_eq!(lock.snapshot().grants, [1, 0, 0, 0, 0]);
}

#[test]
fn glock_incompatible_waiter_proceeds_after_release() {
    let matrix = four_mode_matrix();
    let lock = GLock::new(&matrix).unwrap();

    lock.acquire(S4, Timeout::Infinite).unwrap();
    assert_eq!(lock.acquire(IX4, Timeout::Immediate), Err(LockError::WouldBlock));

    thread::scope(|s| {
        let waiter = s.spawn(|| lock.acquire(IX4, Timeout::Bounded(Duration::from_secs(10))));

        wait_for_waiters(&lock, 1);
        assert_eq!(lock.grants(IX4), Ok(0));
        lock.release(S4).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(()));
    });

    assert_eq!(lock.snapshot(), GLockState { grants: vec![0, 1, 0, 0], waiters: 0 });
    assert_eq!(lock.acquire(X4, Timeout::Immediate), Err(LockError::WouldBlock));
}

#[test]
fn glock_transition_wakes_waiters() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
    lock.acquire(S, Timeout::Infinite).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| lock.acquire(IX, Timeout::Bounded(Duration::from_secs(10))));

        wait_for_waiters(&lock, 1);
        // IS is compatible with IX, the waiter must be able to proceed
        lock.transition(S, IS, Timeout::Immediate).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(()));
    });

    assert_eq!(lock.snapshot().grants, [1, 1, 0, 0, 0]);
}

#[test]
fn glock_blocking_transition() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
    lock.acquire(IS, Timeout::Infinite).unwrap();
    lock.acquire(IS, Timeout::Infinite).unwrap();

    thread::scope(|s| {
        let upgrader = s.spawn(|| lock.transition(IS, X, Timeout::Bounded(Duration::from_secs(10))));

        wait_for_waiters(&lock, 1);
        lock.release(IS).unwrap();

        assert_eq!(upgrader.join().unwrap(), Ok(()));
    });

    assert_eq!(lock.snapshot().grants, [0, 0, 0, 0, 1]);
}

#[test]
fn glock_mode_safety_under_contention() {
    const THREADS : usize = 8;
    const ITERATIONS : usize = 300;

    let matrix = &*HIERARCHICAL_MATRIX;
    let lock = GLock::new(matrix).unwrap();

    thread::scope(|s| {
        for seed in 0..THREADS {
            let lock = &lock;
            s.spawn(move || {
                let mut rng = 0x9E37_79B9_7F4A_7C15u64 ^ (seed as u64 + 1);
                let mut next = move || {
                    rng ^= rng << 13;
                    rng ^= rng >> 7;
                    rng ^= rng << 17;
                    rng
                };

                for _ in 0..ITERATIONS {
                    let mode = (next() % 5) as usize;
                    let timeout = match next() % 3 {
                        0 => Timeout::Immediate,
                        1 => Timeout::Bounded(Duration::from_micros(200)),
                        _ => Timeout::Infinite,
                    };
                    if lock.acquire(mode, timeout).is_err() {
                        continue;
                    }
                    assert_modes_compatible(&lock.snapshot(), matrix);

                    let new_mode = (next() % 5) as usize;
                    let held = if lock.transition(mode, new_mode, Timeout::Immediate).is_ok() {
                        assert_modes_compatible(&lock.snapshot(), matrix);
                        new_mode
                    } else {
                        mode
                    };

                    lock.release(held).unwrap();
                }
            });
        }
    });

    assert_eq!(lock.snapshot(), GLockState { grants: vec![0; 5], waiters: 0 });
}

#[test]
fn glock_external_mutex() {
    let mutex = SharedMutex::new(());
    let first = GLock::with_mutex(&READER_WRITER_MATRIX, &mutex).unwrap();
    let second = GLock::with_mutex(&READER_WRITER_MATRIX, &mutex).unwrap();
    assert!(first.has_external_mutex());

    {
        // Both locks change together, nobody can observe one without the other
        let mut guard = mutex.lock();
        first.acquire_in(&mut guard, WRITE, Timeout::Immediate).unwrap();
        second.acquire_in(&mut guard, READ, Timeout::Immediate).unwrap();
        assert!(first.is_locked_in(&guard));
        assert!(second.is_referenced_in(&guard));
        assert!(!first.has_waiters_in(&guard));
        assert_eq!(second.snapshot_in(&guard).grants, [1, 0]);
    }

    // The plain methods lock the external mutex themselves
    assert!(first.is_locked());
    assert_eq!(first.release(WRITE), Ok(()));

    let mut guard = mutex.lock();
    assert_eq!(second.release_in(&mut guard, READ), Ok(()));
    assert!(!second.is_locked_in(&guard));
}

#[test]
fn glock_external_mutex_concurrent_release_in() {
    const THREADS : u64 = 4;
    const RELEASES : u64 = 2000;

    let mutex = SharedMutex::new(());
    let lock = GLock::with_mutex(&READER_WRITER_MATRIX, &mutex).unwrap();
    {
        let mut guard = mutex.lock();
        for _ in 0..THREADS * RELEASES {
            lock.acquire_in(&mut guard, READ, Timeout::Immediate).unwrap();
        }
    }

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..RELEASES {
                    // Each release needs a guard of its own
                    let mut guard = mutex.lock();
                    lock.release_in(&mut guard, READ).unwrap();
                }
            });
        }
    });

    assert_eq!(lock.grants(READ), Ok(0));
    assert!(!lock.is_referenced());
}

#[test]
fn glock_external_mutex_blocking_wait_releases_mutex() {
    let mutex = SharedMutex::new(());
    let lock = GLock::with_mutex(&READER_WRITER_MATRIX, &mutex).unwrap();
    lock.acquire(WRITE, Timeout::Immediate).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let mut guard = mutex.lock();
            lock.acquire_in(&mut guard, READ, Timeout::Bounded(Duration::from_secs(10)))
        });

        // The waiter must have given up the mutex while suspended for this to make progress
        wait_for_waiters(&lock, 1);
        let mut guard = mutex.lock();
        lock.transition_in(&mut guard, WRITE, READ, Timeout::Immediate).unwrap();
        drop(guard);

        assert_eq!(waiter.join().unwrap(), Ok(()));
    });

    assert_eq!(lock.snapshot().grants, [2, 0]);
}

#[test]
#[should_panic(expected = "different mutex")]
fn glock_foreign_guard_panics() {
    let lock = GLock::new(&READER_WRITER_MATRIX).unwrap();
    let other = SharedMutex::new(());
    let mut guard = other.lock();
    let _ = lock.acquire_in(&mut guard, READ, Timeout::Immediate);
}

#[test]
fn glock_deinit() {
    let lock = GLock::new(&READER_WRITER_MATRIX).unwrap();
    lock.acquire(READ, Timeout::Immediate).unwrap();

    let lock = lock.deinit().unwrap_err();
    lock.release(READ).unwrap();
    assert!(lock.deinit().is_ok());
}

#[test]
fn glock_guard_releases_on_drop() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
    {
        let mut guard = lock.lock(S, Timeout::Immediate).unwrap();
        assert_eq!(guard.mode(), S);
        assert_eq!(lock.acquire(IX, Timeout::Immediate), Err(LockError::WouldBlock));

        guard.transition(X, Timeout::Immediate).unwrap();
        assert_eq!(guard.mode(), X);
        assert_eq!(lock.snapshot().grants, [0, 0, 0, 0, 1]);

        assert_eq!(lock.lock(IS, Timeout::Immediate).err(), Some(LockError::WouldBlock));
    }
    assert!(!lock.is_locked());
}

#[test]
fn glock_debug() {
    let lock = GLock::new(&READER_WRITER_MATRIX).unwrap();
    lock.acquire(READ, Timeout::Immediate).unwrap();
    let text = format!("{lock:?}");
    assert!(text.contains("Internal"));
    assert!(text.contains("grants: [1, 0]"));

    let mutex = SharedMutex::new(());
    let lock = GLock::with_mutex(&READER_WRITER_MATRIX, &mutex).unwrap();
    let _guard = mutex.lock();
    assert!(format!("{lock:?}").contains("<locked>"));
}

#[test]
fn glock_blocked_transition_fails_when_grant_is_released() {
    let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
    lock.acquire(IS, Timeout::Immediate).unwrap();
    lock.acquire(S, Timeout::Immediate).unwrap();

    thread::scope(|s| {
        let transition = s.spawn(|| lock.transition(IS, X, Timeout::Bounded(Duration::from_secs(10))));
        wait_for_waiters(&lock, 1);

        // Grants aren't owned, releasing the IS grant here pulls it out from under the transition
        lock.release(IS).unwrap();
        assert_eq!(transition.join().unwrap(), Err(LockError::NotHeld));
    });

    let state = lock.snapshot();
    assert_eq!(state.grants, [0, 0, 1, 0, 0]);
    assert_eq!(state.waiters, 0);
}
