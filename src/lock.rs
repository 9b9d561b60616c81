//! The wait/lock primitive (spec.md §4.1).
//!
//! Acquiring an entry's lock is: under an interrupt-disabled critical
//! section, try to set the `LOCKED` bit; on success return, on failure
//! sleep on the entry's wait channel and retry from the top on wake.
//! Grounded on `buffer_wait()`/`get_free_buffer()` in
//! `original_source/fs/buffer.c`, generalized so both the buffer cache and
//! the page cache share one retry primitive instead of duplicating the
//! loop.
//!
//! Sleeps issued here are uninterruptible: the [`crate::collab::Scheduler`]
//! contract promises `sleep` does not return early for a pending signal,
//! so this loop never needs to distinguish "woken" from "aborted".

use crate::collab::{Scheduler, WaitChannel};

/// Retry `attempt` until it returns `Some`, sleeping on `channel` between
/// tries. `attempt` is responsible for its own critical section: it must
/// re-check the predicate under the coordination lock every call, since a
/// wake is a broadcast and the condition may already be gone by the time
/// this task runs (spec.md §4.1: "wakeups ... cause thundering-herd
/// retries; this is accepted").
pub fn retry_until_some<R>(
    scheduler: &dyn Scheduler,
    channel: WaitChannel,
    mut attempt: impl FnMut() -> Option<R>,
) -> R {
    loop {
        if let Some(result) = attempt() {
            return result;
        }
        scheduler.sleep(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct ImmediateWake;
    impl Scheduler for ImmediateWake {
        fn sleep(&self, _channel: WaitChannel) {}
        fn wake(&self, _channel: WaitChannel) {}
    }

    #[test]
    fn returns_first_successful_attempt() {
        let scheduler = ImmediateWake;
        let calls = Cell::new(0);
        let result = retry_until_some(&scheduler, WaitChannel::ANY_BUFFER_LOCK, || {
            let n = calls.get() + 1;
            calls.set(n);
            if n < 3 {
                None
            } else {
                Some(n)
            }
        });
        assert_eq!(result, 3);
        assert_eq!(calls.get(), 3);
    }
}
