use std::ffi::CString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::SystemTime;

use chrono::{Local, TimeZone};

/// Message severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn name(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
    fn syslog_priority(self) -> libc::c_int {
        match self {
            Level::Debug => libc::LOG_DEBUG,
            Level::Info => libc::LOG_INFO,
            Level::Warn => libc::LOG_WARNING,
            Level::Error => libc::LOG_ERR,
        }
    }
}

/// Where to put the log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    fn write(&mut self, priority: libc::c_int, message: &str) {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                let message = CString::new(message.replace('\0', "")).unwrap();
                // "%s" so a '%' in the logged request cannot reach syslog's
                // formatter.
                unsafe {
                    libc::syslog(
                        priority,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_c_str().as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                // A log line that cannot be written is dropped rather than
                // taking the server down.
                write!(file, "{}", message).ok();
                file.flush().ok();
            }
        }
    }
}

/// Leveled diagnostics plus Common Log Format access lines, all going to one
/// sink.
#[derive(Debug)]
pub struct Logger {
    sink: LogSink,
    min_level: Level,
}

impl Logger {
    pub fn new(sink: LogSink, min_level: Level) -> Self {
        Self { sink, min_level }
    }

    pub fn log(&mut self, level: Level, message: &str) {
        if level < self.min_level {
            return;
        }
        let line = format!(
            "{} [{}] {}\n",
            clf_date(SystemTime::now()),
            level.name(),
            message
        );
        self.sink.write(level.syslog_priority(), &line);
    }

    /// Writes one access line for a completed request.
    pub fn access(&mut self, peer: &str, method: &str, uri: &str, status: u16, bytes_sent: usize) {
        let line = format!(
            "{} - - {} \"{} {} HTTP/1.1\" {} {}\n",
            peer,
            clf_date(SystemTime::now()),
            log_encode(method),
            log_encode(uri),
            status,
            bytes_sent,
        );
        self.sink.write(libc::LOG_INFO, &line);
    }
}

/// Common Log Format date in the local timezone.
fn clf_date(when: SystemTime) -> String {
    let secs = when
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Local
        .timestamp_opt(secs, 0)
        .unwrap()
        .format("[%d/%b/%Y:%H:%M:%S %z]")
        .to_string()
}

/// Percent-escape a request field for the log: no control bytes, no quotes,
/// nothing outside ASCII.
fn log_encode(field: &str) -> String {
    let mut encoded = String::with_capacity(field.len());
    for &byte in field.as_bytes() {
        if byte == b' ' || (byte.is_ascii_graphic() && byte != b'"') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}
