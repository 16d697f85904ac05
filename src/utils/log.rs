//! Logging sink described in spec §4.7/§6: four verbosity levels, fed
//! either a raw file descriptor or a caller callback. No external logging
//! facade is used — the teacher crate carries none either, and this
//! contract (level + sink choice passed in at `init`) is specific enough
//! that wrapping `log`/`tracing` would add a second, redundant knob.

use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    #[default]
    Silent,
    Error,
    Verbose,
    SuperVerbose,
}

pub type LogCallback = Box<dyn Fn(Verbosity, &str) + Send + Sync>;

enum Sink {
    None,
    Fd(Mutex<File>),
    Callback(LogCallback),
}

pub struct Logger {
    level: Verbosity,
    sink: Sink,
}

impl Logger {
    pub fn silent() -> Self {
        Logger {
            level: Verbosity::Silent,
            sink: Sink::None,
        }
    }

    pub fn with_fd(level: Verbosity, file: File) -> Self {
        Logger {
            level,
            sink: Sink::Fd(Mutex::new(file)),
        }
    }

    pub fn with_callback(level: Verbosity, callback: LogCallback) -> Self {
        Logger {
            level,
            sink: Sink::Callback(callback),
        }
    }

    pub fn log(&self, level: Verbosity, msg: &str) {
        if level > self.level || self.level == Verbosity::Silent {
            return;
        }
        match &self.sink {
            Sink::None => {}
            Sink::Fd(file) => {
                if let Ok(mut f) = file.lock() {
                    let _ = writeln!(f, "[{level:?}] {msg}");
                }
            }
            Sink::Callback(cb) => cb(level, msg),
        }
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(Verbosity::Error, msg.as_ref());
    }

    pub fn verbose(&self, msg: impl AsRef<str>) {
        self.log(Verbosity::Verbose, msg.as_ref());
    }

    pub fn superverbose(&self, msg: impl AsRef<str>) {
        self.log(Verbosity::SuperVerbose, msg.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_respects_level() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let logger = Logger::with_callback(
            Verbosity::Error,
            Box::new(move |_, _| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        logger.error("boom");
        logger.verbose("should not print");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn silent_suppresses_everything() {
        let logger = Logger::silent();
        logger.error("nope");
    }
}
