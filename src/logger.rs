use crate::ffi::BridgeLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

static LOGGER: Lazy<Logger> = Lazy::new(Logger::new);
static RATE_LIMITER: Lazy<RateLimiter> = Lazy::new(|| RateLimiter::new(RATE_LIMIT_INTERVAL));

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, BreadcrumbFlags::empty(), message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, BreadcrumbFlags::empty(), message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, BreadcrumbFlags::empty(), message.into());
}

/// Debug-level line tagged with `flag`; dropped unless the sink's breadcrumb
/// mask includes it.
pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    if flag.is_empty() {
        return;
    }
    LOGGER.log(LogLevel::Debug, flag, message.into());
}

/// Installs the host log sink, or removes it when `sink` is `None`.
pub fn install_sink(sink: Option<&BridgeLogSink>, level: Option<&str>) -> Result<(), SinkError> {
    LOGGER.install_sink(sink, level)
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const HANDLE   = 0b0000_0001;
        const ATTACH   = 0b0000_0010;
        const DISPATCH = 0b0000_0100;
        const PROCESS  = 0b0000_1000;
        const ENGINE   = 0b0001_0000;
        const FFI      = 0b0010_0000;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("log sink has no callback")]
    MissingCallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Unknown names fall back to `Info`.
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "debug" | "dbg" | "trace" => Self::Debug,
            _ => Self::Info,
        }
    }

    fn as_c_ptr(self) -> *const c_char {
        let name: &'static [u8] = match self {
            Self::Error => b"error\0",
            Self::Warn => b"warn\0",
            Self::Info => b"info\0",
            Self::Debug => b"debug\0",
        };
        name.as_ptr().cast()
    }
}

#[derive(Clone, Copy)]
struct Sink {
    callback: LogCallback,
    context: *mut c_void,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

unsafe impl Send for Sink {}
unsafe impl Sync for Sink {}

impl Sink {
    /// Breadcrumbs are filtered by mask alone; plain lines by level.
    fn accepts(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags) -> bool {
        if breadcrumbs.is_empty() {
            level <= self.min_level
        } else {
            self.breadcrumbs.intersects(breadcrumbs)
        }
    }
}

struct Logger {
    sink: Mutex<Option<Sink>>,
    prefix: String,
}

impl Logger {
    fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            prefix: format!("[tb-p{}]", std::process::id()),
        }
    }

    fn install_sink(
        &self,
        sink: Option<&BridgeLogSink>,
        level: Option<&str>,
    ) -> Result<(), SinkError> {
        let next = match sink {
            Some(sink) => Some(Sink {
                callback: sink.log.ok_or(SinkError::MissingCallback)?,
                context: sink.context,
                breadcrumbs: BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
                min_level: level.map_or(LogLevel::Info, LogLevel::parse),
            }),
            None => None,
        };
        *self.sink.lock() = next;
        Ok(())
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(sink) = self.sink.lock().as_mut() {
            sink.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        if message.is_empty() {
            return;
        }
        // Copied out so the host callback never runs under the lock.
        let sink = *self.sink.lock();
        let Some(sink) = sink.filter(|sink| sink.accepts(level, breadcrumbs)) else {
            return;
        };

        let line = match label_for(breadcrumbs) {
            Some(label) => format!("{} [{label}] {message}", self.prefix),
            None => format!("{} {message}", self.prefix),
        };
        // Interior NULs would truncate the host's copy, so such lines are dropped.
        let Ok(line) = CString::new(line) else {
            return;
        };
        unsafe {
            (sink.callback)(
                level.as_c_ptr(),
                line.as_ptr(),
                breadcrumbs.bits(),
                sink.context,
            );
        }
    }
}

/// Label of the first breadcrumb set, in declaration order.
fn label_for(flags: BreadcrumbFlags) -> Option<&'static str> {
    flags.iter_names().next().map(|(name, _)| name)
}

// Engine worker threads can fail the same way thousands of times per second
// (a stale handle, a host that refuses attachment). Each category is limited on
// its own so one noisy failure cannot hide another.

const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Native thread could not be attached to the host runtime
    AttachFailure,
    /// Callback addressed a released or unknown handle
    StaleHandle,
    /// Second result against a one-shot handle
    DuplicateResult,
    /// Release of an id that is no longer registered
    DuplicateRelease,
    /// Host returned an unusable value from a query
    QueryFailure,
}

impl ErrorCategory {
    const COUNT: usize = 5;

    fn label(self) -> &'static str {
        match self {
            Self::AttachFailure => "ATTACH_FAILURE",
            Self::StaleHandle => "STALE_HANDLE",
            Self::DuplicateResult => "DUPLICATE_RESULT",
            Self::DuplicateRelease => "DUPLICATE_RELEASE",
            Self::QueryFailure => "QUERY_FAILURE",
        }
    }
}

const NEVER: u64 = u64::MAX;

struct Slot {
    /// Millis since `RateLimiter::epoch` of the last emitted line.
    last_ms: AtomicU64,
    suppressed: AtomicU64,
}

struct RateLimiter {
    epoch: Instant,
    interval_ms: u64,
    slots: [Slot; ErrorCategory::COUNT],
}

impl RateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            slots: std::array::from_fn(|_| Slot {
                last_ms: AtomicU64::new(NEVER),
                suppressed: AtomicU64::new(0),
            }),
        }
    }

    /// Returns how many lines of `category` were suppressed since the last
    /// admitted one, or `None` when this one is suppressed too.
    fn admit(&self, category: ErrorCategory) -> Option<u64> {
        let slot = &self.slots[category as usize];
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = slot.last_ms.load(Ordering::Relaxed);
        let due = last == NEVER || now.saturating_sub(last) >= self.interval_ms;
        if due
            && slot
                .last_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            Some(slot.suppressed.swap(0, Ordering::Relaxed))
        } else {
            slot.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Logs an error line, at most one per category per second. The next admitted
/// line reports how many were suppressed in between. Returns whether this one
/// was emitted.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    let Some(suppressed) = RATE_LIMITER.admit(category) else {
        return false;
    };
    let message = message.into();
    let line = if suppressed == 0 {
        format!("[{}] {message}", category.label())
    } else {
        format!("[{}] {message} ({suppressed} suppressed)", category.label())
    };
    LOGGER.log(LogLevel::Error, BreadcrumbFlags::empty(), line);
    true
}
