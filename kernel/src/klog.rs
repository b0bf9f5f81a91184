//! Structured kernel log
//!
//! A fixed-size, heap-free circular buffer of log entries behind the
//! `log` crate facade: `log::warn!` and friends anywhere in the kernel
//! land here and echo to the serial console. Once full the buffer wraps
//! and overwrites the oldest entries.

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Entries the circular buffer can hold.
const LOG_CAPACITY: usize = 256;

/// Longest stored message; the tail of longer messages is dropped.
const LOG_MESSAGE_MAX_LEN: usize = 120;

/// Longest stored target (module path) tag.
const LOG_TARGET_MAX_LEN: usize = 24;

/// One recorded log line.
#[derive(Clone, Copy)]
pub struct LogEntry {
    /// Scheduler ticks at the time of the record.
    pub ticks: u64,
    pub level: Level,
    target_buf: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message_buf: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            ticks: 0,
            level: Level::Trace,
            target_buf: [0; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message_buf: [0; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    pub fn target(&self) -> &str {
        core::str::from_utf8(&self.target_buf[..self.target_len as usize]).unwrap_or("")
    }

    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message_buf[..self.message_len as usize]).unwrap_or("")
    }
}

struct LogBuffer {
    entries: [LogEntry; LOG_CAPACITY],
    next: usize,
    count: usize,
}

static BUFFER: Mutex<LogBuffer> = Mutex::new(LogBuffer {
    entries: [LogEntry::empty(); LOG_CAPACITY],
    next: 0,
    count: 0,
});

fn copy_clipped(dst: &mut [u8], src: &str) -> u8 {
    let take = src.len().min(dst.len());
    // Clip on a char boundary so `target()`/`message()` stay valid UTF-8.
    let mut take = take;
    while take > 0 && !src.is_char_boundary(take) {
        take -= 1;
    }
    dst[..take].copy_from_slice(&src.as_bytes()[..take]);
    take as u8
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Render once into a stack buffer shared by the echo and the
        // stored entry.
        struct FixedWriter {
            buf: [u8; LOG_MESSAGE_MAX_LEN],
            len: usize,
        }
        impl core::fmt::Write for FixedWriter {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                let space = LOG_MESSAGE_MAX_LEN - self.len;
                let take = s.len().min(space);
                self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
                self.len += take;
                Ok(())
            }
        }
        let mut writer = FixedWriter {
            buf: [0; LOG_MESSAGE_MAX_LEN],
            len: 0,
        };
        let _ = core::fmt::write(&mut writer, *record.args());
        let message = core::str::from_utf8(&writer.buf[..writer.len]).unwrap_or("");

        println!("[{}] {}: {}", record.level(), record.target(), message);

        let mut entry = LogEntry::empty();
        entry.ticks = current_ticks();
        entry.level = record.level();
        entry.target_len = copy_clipped(&mut entry.target_buf, record.target());
        entry.message_len = copy_clipped(&mut entry.message_buf, message);

        let mut buffer = BUFFER.lock();
        let slot = buffer.next;
        buffer.entries[slot] = entry;
        buffer.next = (slot + 1) % LOG_CAPACITY;
        buffer.count = (buffer.count + 1).min(LOG_CAPACITY);
    }

    fn flush(&self) {}
}

fn current_ticks() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::arch::x86_64::timer::ticks()
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        crate::arch::aarch64::timer::ticks()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger behind the `log` facade.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Number of entries currently held.
pub fn count() -> usize {
    BUFFER.lock().count
}

/// Run `f` over the buffered entries, oldest first.
pub fn for_each(mut f: impl FnMut(&LogEntry)) {
    let buffer = BUFFER.lock();
    let start = if buffer.count == LOG_CAPACITY {
        buffer.next
    } else {
        0
    };
    for i in 0..buffer.count {
        f(&buffer.entries[(start + i) % LOG_CAPACITY]);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn entries_wrap_and_clip() {
        let _guard = crate::lock_global_state_for_test();
        {
            let mut buffer = BUFFER.lock();
            buffer.next = 0;
            buffer.count = 0;
        }
        init();

        for i in 0..LOG_CAPACITY + 4 {
            log::warn!("entry number {}", i);
        }
        assert_eq!(count(), LOG_CAPACITY, "buffer holds at most its capacity");

        let mut first = None;
        for_each(|e| {
            if first.is_none() {
                first = Some(alloc::string::String::from(e.message()));
            }
        });
        assert_eq!(
            first.as_deref(),
            Some("entry number 4"),
            "oldest surviving entry follows the overwritten ones"
        );
    }
}
