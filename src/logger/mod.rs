//! Named loggers shared by the local store components.
//!
//! Every component keeps a `LazyLock<Logger>` named after the subsystem (for example
//! `@firebase/firestore`). Records below the logger's level are dropped; the rest go to an
//! optional user callback and then to the `log` facade, so the embedding application picks
//! the backend.

use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock, Weak};

static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INSTANCES: LazyLock<Mutex<Vec<Weak<LoggerInner>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

/// Receives every record that passes the level filter of its logger.
pub type LogCallback = Arc<dyn Fn(LogRecord) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    name: String,
    log_level: AtomicU8,
    user_callback: RwLock<Option<UserCallback>>,
}

#[derive(Clone)]
struct UserCallback {
    callback: LogCallback,
    /// Overrides the logger's own level for the callback only.
    level: Option<LogLevel>,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(LoggerInner {
            name: name.into(),
            log_level: AtomicU8::new(GLOBAL_LOG_LEVEL.load(Ordering::SeqCst)),
            user_callback: RwLock::new(None),
        });
        INSTANCES
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&inner));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.log_level.load(Ordering::SeqCst))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.log_level.store(level as u8, Ordering::SeqCst);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message.into());
    }

    fn emit(&self, level: LogLevel, message: String) {
        let user_callback = self
            .inner
            .user_callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(user) = user_callback {
            if level >= user.level.unwrap_or_else(|| self.log_level()) {
                (user.callback)(LogRecord {
                    level,
                    message: message.clone(),
                    logger_name: self.name().to_owned(),
                    timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                });
            }
        }

        if level < self.log_level() {
            return;
        }
        if let Some(target) = level.to_log_level() {
            log::log!(target: self.name(), target, "{message}");
        }
    }

    fn set_user_callback(&self, user_callback: Option<UserCallback>) {
        *self
            .inner
            .user_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = user_callback;
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name())
            .field("log_level", &self.log_level())
            .finish()
    }
}

fn for_each_instance(mut f: impl FnMut(Logger)) {
    let mut instances = INSTANCES.lock().unwrap_or_else(PoisonError::into_inner);
    instances.retain(|weak| weak.strong_count() > 0);
    for inner in instances.iter().filter_map(Weak::upgrade) {
        f(Logger { inner });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Silent = 4,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Silent,
        }
    }

    fn to_log_level(self) -> Option<log::Level> {
        match self {
            LogLevel::Debug => Some(log::Level::Debug),
            LogLevel::Info => Some(log::Level::Info),
            LogLevel::Warn => Some(log::Level::Warn),
            LogLevel::Error => Some(log::Level::Error),
            LogLevel::Silent => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "silent" => Ok(LogLevel::Silent),
            other => Err(LogError::InvalidLogLevel(other.to_string())),
        }
    }
}

/// One record as handed to a user callback.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub logger_name: String,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    InvalidLogLevel(String),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::InvalidLogLevel(level) => write!(f, "Invalid log level \"{level}\""),
        }
    }
}

impl std::error::Error for LogError {}

/// Sets the level of every existing logger and of loggers created afterwards.
pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    for_each_instance(|logger| logger.set_log_level(level));
}

/// Installs (or clears) a callback receiving every record at or above `level`, or at or above
/// each logger's own level when `level` is `None`.
pub fn set_user_log_handler(callback: Option<LogCallback>, level: Option<LogLevel>) {
    let user_callback = callback.map(|callback| UserCallback { callback, level });
    for_each_instance(|logger| logger.set_user_callback(user_callback.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn capture(logger_name: &str, level: Option<LogLevel>) -> Arc<Mutex<Vec<LogRecord>>> {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        let name = logger_name.to_owned();
        set_user_log_handler(
            Some(Arc::new(move |record: LogRecord| {
                if record.logger_name == name {
                    sink.lock().unwrap().push(record);
                }
            })),
            level,
        );
        records
    }

    #[test]
    fn log_level_filters_records() {
        let _guard = TEST_GUARD.lock().unwrap();
        let logger = Logger::new("@firebase/logger-level-test");
        set_log_level(LogLevel::Warn);
        let records = capture(logger.name(), None);

        logger.debug("debug message");
        logger.info("info message");
        logger.warn("warn message");
        logger.error(String::from("error message"));

        let levels: Vec<_> = records.lock().unwrap().iter().map(|record| record.level).collect();
        assert_eq!(levels, [LogLevel::Warn, LogLevel::Error]);
        set_user_log_handler(None, None);
        set_log_level(LogLevel::Info);
    }

    #[test]
    fn callback_level_overrides_logger_level() {
        let _guard = TEST_GUARD.lock().unwrap();
        set_log_level(LogLevel::Error);
        let logger = Logger::new("@firebase/logger-user-test");
        let records = capture(logger.name(), Some(LogLevel::Debug));

        logger.debug(format!("Starting transaction: {}", 42));

        let stored = records.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message, "Starting transaction: 42");
        assert!(!stored[0].timestamp.is_empty());
        drop(stored);
        set_user_log_handler(None, None);
        set_log_level(LogLevel::Info);
    }

    #[test]
    fn parses_level_names() {
        assert_eq!(LogLevel::from_str("WARNING").unwrap(), LogLevel::Warn);
        assert!(LogLevel::from_str("loud").is_err());
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
    }
}
