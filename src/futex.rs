//! The per-file meta lock: a spinlock on the `meta_lock` word of the meta
//! block, parked on a futex once spinning stops paying off. The word lives
//! in the shared mapping, so the plain (non-private) futex ops also work
//! across processes that map the same file. Recovery of a crashed holder is
//! the external garbage collector's job.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const SPIN_LIMIT: usize = 128;

pub(crate) fn lock(word: &AtomicU32) {
    if word
        .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        return;
    }

    for _ in 0..SPIN_LIMIT {
        std::hint::spin_loop();
        if word.load(Ordering::Relaxed) == UNLOCKED
            && word
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
    }

    loop {
        if word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
            return;
        }
        futex_wait(word, CONTENDED);
    }
}

pub(crate) fn unlock(word: &AtomicU32) {
    if word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
        futex_wake(word);
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, 1);
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_word: &AtomicU32, _expected: u32) {
    std::thread::yield_now();
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn lock_serializes_increments() {
        let word = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU64::new(0));
        let mut threads = vec![];
        for _ in 0..8 {
            let word = word.clone();
            let counter = counter.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock(&word);
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    unlock(&word);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8_000);
        assert_eq!(word.load(Ordering::Relaxed), UNLOCKED);
    }
}
