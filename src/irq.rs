//! Interrupt-disabled critical sections (spec.md §5).
//!
//! All list (free/hash/dirty) membership changes execute inside
//! [`critical_section`]. On x86_64 this really does disable interrupts, the
//! way `arch/x86_64/boot.rs` does around its own setup by calling
//! `x86_64::instructions::interrupts::disable()`/`enable()` directly.
//! Everywhere else, including host test builds, there is no interrupt flag
//! to mask, so a single global coordination lock gives the same
//! mutual-exclusion scope, per spec.md Design Notes §9.

#[cfg(target_arch = "x86_64")]
pub fn critical_section<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn critical_section<R>(f: impl FnOnce() -> R) -> R {
    static GLOBAL: spin::Mutex<()> = spin::Mutex::new(());
    let _guard = GLOBAL.lock();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_closure_and_returns_value() {
        let value = critical_section(|| 1 + 1);
        assert_eq!(value, 2);
    }

    #[test]
    fn nested_calls_do_not_deadlock_sequentially() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        critical_section(|| COUNTER.fetch_add(1, Ordering::Relaxed));
        critical_section(|| COUNTER.fetch_add(1, Ordering::Relaxed));
        assert_eq!(COUNTER.load(Ordering::Relaxed), 2);
    }
}
