//! File logger for bgjobs.
//!
//! Output goes to `~/.bgjobs/bgjobs.log`; the log of the previous run is
//! kept as `bgjobs.log.1`. The threshold comes from `BGJOBS_LOG`
//! (`error`, `warn`, `info`, `debug` or `trace`), else from `--debug` or
//! `BGJOBS_DEBUG=1`, else INFO.
//!
//! Until [`init_with_debug`] runs, every `jlog*` macro is a no-op, so the
//! library and its tests stay silent unless the binary opts in.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

const LEVEL_VAR: &str = "BGJOBS_LOG";
const DEBUG_VAR: &str = "BGJOBS_DEBUG";

static LOGGER: OnceLock<Logger> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Case-insensitive level name.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.label().eq_ignore_ascii_case(name))
    }

    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Threshold from an explicit level name, falling back to the debug switch.
fn resolve_level(level_var: Option<&str>, debug: bool) -> LogLevel {
    level_var.and_then(LogLevel::parse).unwrap_or(if debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    })
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// An open log file plus its threshold.
struct Logger {
    threshold: LogLevel,
    file: Mutex<File>,
}

impl Logger {
    /// Open `path` fresh, moving any existing log aside to `<path>.1`.
    fn open(path: &Path, threshold: LogLevel) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        if path.exists() {
            let mut previous = path.as_os_str().to_owned();
            previous.push(".1");
            fs::rename(path, PathBuf::from(previous))?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            threshold,
            file: Mutex::new(file),
        })
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level <= self.threshold
    }

    fn write(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{} {:<5} {}", stamp, level, args);
        }
    }
}

/// Start logging to `~/.bgjobs/bgjobs.log`. Later calls are ignored.
pub fn init_with_debug(debug: bool) {
    let level_var = std::env::var(LEVEL_VAR).ok();
    let threshold = resolve_level(level_var.as_deref(), debug || env_flag(DEBUG_VAR));
    let Some(path) = dirs::home_dir().map(|h| h.join(".bgjobs").join("bgjobs.log")) else {
        return;
    };
    if LOGGER.get().is_some() {
        return;
    }
    if let Ok(logger) = Logger::open(&path, threshold) {
        let _ = LOGGER.set(logger);
    }
}

#[doc(hidden)]
pub fn emit(level: LogLevel, args: fmt::Arguments<'_>) {
    if let Some(logger) = LOGGER.get() {
        logger.write(level, args);
    }
}

/// INFO: job lifecycle (start, cancel, finish, recovery).
#[macro_export]
macro_rules! jlog {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

/// ERROR: a run stopped on a store failure.
#[macro_export]
macro_rules! jlog_error {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

/// WARN: recoverable surprises such as stale task records.
#[macro_export]
macro_rules! jlog_warn {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// DEBUG: dispatch decisions and store opens.
#[macro_export]
macro_rules! jlog_debug {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// TRACE: individual record writes.
#[macro_export]
macro_rules! jlog_trace {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Trace, format_args!($($arg)*))
    };
}
