//! Multi-sink log fan-out.
//!
//! A [`LogManager`] owns a list of shared sink handles and forwards each
//! message to every sink whose threshold admits the message's severity.
//! Message closures are evaluated at most once, and only when at least one
//! sink will accept the result, so callers can log expensive formatting
//! freely.

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

/// Message severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        };
        f.write_str(label)
    }
}

/// A leveled log destination.
///
/// Sinks are held behind `Rc` because they are added and removed from the
/// manager without being exclusively owned by it (the per-run file sink is
/// detached before the drop directory is archived).
pub trait LogSink {
    fn threshold(&self) -> Severity;
    fn write(&self, level: Severity, message: &str);
}

/// Human-oriented sink writing `LEVEL: message` lines to stderr.
pub struct ConsoleSink {
    threshold: Severity,
}

impl ConsoleSink {
    pub fn new(threshold: Severity) -> Self {
        Self { threshold }
    }
}

impl LogSink for ConsoleSink {
    fn threshold(&self) -> Severity {
        self.threshold
    }

    fn write(&self, level: Severity, message: &str) {
        eprintln!("{}: {}", level, message);
    }
}

/// Machine-oriented sink writing one JSON object per line to a file.
pub struct FileSink {
    threshold: Severity,
    file: RefCell<File>,
}

impl FileSink {
    /// Opens `path` for writing at debug threshold to capture maximum detail.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            threshold: Severity::Debug,
            file: RefCell::new(File::create(path)?),
        })
    }
}

impl LogSink for FileSink {
    fn threshold(&self) -> Severity {
        self.threshold
    }

    fn write(&self, level: Severity, message: &str) {
        let line = serde_json::json!({
            "time": chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "level": level.to_string(),
            "msg": message,
        });
        let mut file = self.file.borrow_mut();
        let _ = writeln!(file, "{}", line);
    }
}

/// Routes one log call to every attached sink that admits its level.
#[derive(Default)]
pub struct LogManager {
    sinks: RefCell<Vec<Rc<dyn LogSink>>>,
}

impl LogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Rc<dyn LogSink>) {
        self.sinks.borrow_mut().push(sink);
    }

    pub fn remove_sink(&self, sink: &Rc<dyn LogSink>) {
        self.sinks.borrow_mut().retain(|s| !Rc::ptr_eq(s, sink));
    }

    /// Forwards a message to every sink admitting `level`.
    ///
    /// The closure runs at most once, and not at all when no sink wants the
    /// level.
    pub fn dispatch(&self, level: Severity, message: impl FnOnce() -> String) {
        let sinks = self.sinks.borrow();
        let mut message = Some(message);
        let mut rendered: Option<String> = None;

        for sink in sinks.iter() {
            if sink.threshold() > level {
                continue;
            }
            if rendered.is_none() {
                if let Some(render) = message.take() {
                    rendered = Some(render());
                }
            }
            if let Some(text) = rendered.as_deref() {
                sink.write(level, text);
            }
        }
    }

    pub fn debug(&self, message: impl FnOnce() -> String) {
        self.dispatch(Severity::Debug, message);
    }

    pub fn info(&self, message: impl FnOnce() -> String) {
        self.dispatch(Severity::Info, message);
    }

    pub fn warn(&self, message: impl FnOnce() -> String) {
        self.dispatch(Severity::Warn, message);
    }

    pub fn error(&self, message: impl FnOnce() -> String) {
        self.dispatch(Severity::Error, message);
    }

    pub fn fatal(&self, message: impl FnOnce() -> String) {
        self.dispatch(Severity::Fatal, message);
    }
}
