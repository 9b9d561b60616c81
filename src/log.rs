//! Subsystem-tagged leveled logging with a bounded ring buffer.
//!
//! Trimmed down from `lib/printk.rs` + `lib/ringbuf.rs`: this crate has no
//! UART to write to, so entries only accumulate in the ring buffer for
//! later draining (e.g. by a kernel's `dmesg` syscall) and are exposed to
//! callers through [`drain`], useful for asserting on warnings in tests.

use core::fmt;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

const RING_CAPACITY: usize = 256;
const MESSAGE_CAPACITY: usize = 128;

#[derive(Clone, Copy)]
pub struct Entry {
    pub level: Level,
    message: [u8; MESSAGE_CAPACITY],
    len: usize,
}

impl Entry {
    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<invalid utf8>")
    }
}

struct RingBuffer {
    entries: [Option<Entry>; RING_CAPACITY],
    head: usize,
    tail: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            entries: [None; RING_CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, entry: Entry) {
        let next_head = (self.head + 1) % RING_CAPACITY;
        if next_head == self.tail {
            self.tail = (self.tail + 1) % RING_CAPACITY;
        }
        self.entries[self.head] = Some(entry);
        self.head = next_head;
    }

    fn drain(&mut self) -> impl Iterator<Item = Entry> + '_ {
        let mut out = heapless::Vec::<Entry, RING_CAPACITY>::new();
        while self.tail != self.head {
            if let Some(entry) = self.entries[self.tail].take() {
                let _ = out.push(entry);
            }
            self.tail = (self.tail + 1) % RING_CAPACITY;
        }
        out.into_iter()
    }
}

static LOG: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

/// Record one log line. `subsystem` is the module name (e.g. `"buffer"`,
/// `"page"`), matching the kernel's `WARNING: fn(): msg` convention.
pub fn log(level: Level, subsystem: &str, args: fmt::Arguments) {
    use fmt::Write;

    struct Sink {
        buf: [u8; MESSAGE_CAPACITY],
        len: usize,
    }
    impl Write for Sink {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let remaining = MESSAGE_CAPACITY - self.len;
            let take = core::cmp::min(remaining, s.len());
            self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
            self.len += take;
            Ok(())
        }
    }

    let mut sink = Sink {
        buf: [0u8; MESSAGE_CAPACITY],
        len: 0,
    };
    let _ = write!(sink, "{subsystem}: ");
    let _ = write!(sink, "{args}");

    LOG.lock().push(Entry {
        level,
        message: sink.buf,
        len: sink.len,
    });
}

/// Drain every buffered log entry (oldest first). Draining is destructive,
/// matching `LogBuffer::drain_all` in the kernel crate.
pub fn drain() -> impl Iterator<Item = Entry> {
    LOG.lock().drain().collect::<heapless::Vec<_, RING_CAPACITY>>().into_iter()
}

#[macro_export]
macro_rules! log_error {
    ($subsystem:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::Level::Error, $subsystem, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($subsystem:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::Level::Warn, $subsystem, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($subsystem:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::Level::Info, $subsystem, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        while drain().next().is_some() {}
        log_info!("test", "first");
        log_warn!("test", "second {}", 2);
        let drained: heapless::Vec<Entry, 4> = drain().collect();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message(), "test: first");
        assert_eq!(drained[1].message(), "test: second 2");
        assert_eq!(drained[1].level, Level::Warn);
    }

    #[test]
    fn overflow_drops_oldest() {
        while drain().next().is_some() {}
        for i in 0..RING_CAPACITY + 10 {
            log_info!("test", "{}", i);
        }
        let drained: heapless::Vec<Entry, RING_CAPACITY> = drain().collect();
        assert_eq!(drained.len(), RING_CAPACITY - 1);
    }
}
