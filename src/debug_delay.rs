/// Injects random scheduling jitter into the lock-free loops, shaking out
/// more interleavings per test run. Compiles to nothing outside the
/// `runtime_verification` feature.
pub fn debug_delay() {
    #[cfg(feature = "runtime_verification")]
    {
        use std::thread;
        use std::time::Duration;

        use rand::{thread_rng, Rng};

        match thread_rng().gen_range(0..100) {
            0..=79 => {}
            80..=98 => thread::yield_now(),
            _ => thread::sleep(Duration::from_millis(2)),
        }
    }
}
