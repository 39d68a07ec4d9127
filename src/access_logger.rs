//! Access Logger
//!
//! Writes one line per client session:
//! $remote_addr $client_cn [$time_local] $outcome upstream=$addr in=$bytes out=$bytes time=$ms

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, error, info};

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Bytes were relayed; the session ran to completion
    Relayed,
    /// Client identity not present in the allow-list
    Unauthorized,
    /// Token bucket empty
    RateLimited,
    /// Every eligible upstream failed to dial
    Exhausted,
}

impl SessionOutcome {
    fn as_str(self) -> &'static str {
        match self {
            SessionOutcome::Relayed => "relayed",
            SessionOutcome::Unauthorized => "unauthorized",
            SessionOutcome::RateLimited => "rate_limited",
            SessionOutcome::Exhausted => "exhausted",
        }
    }
}

/// Access log entry for one client session
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub remote_addr: SocketAddr,
    pub client_cn: String,
    pub outcome: SessionOutcome,
    /// Upstream that served the session (None if nothing was dialed)
    pub upstream: Option<String>,
    /// Bytes copied client -> upstream
    pub bytes_in: u64,
    /// Bytes copied upstream -> client
    pub bytes_out: u64,
    pub duration_ms: u64,
}

/// Access logger that writes to a file, one line per session
pub struct AccessLogger {
    file: Arc<Mutex<Option<File>>>,
    enabled: bool,
}

impl AccessLogger {
    /// Create a new access logger
    pub fn new(path: Option<PathBuf>) -> Self {
        let file = if let Some(ref p) = path {
            match OpenOptions::new().create(true).append(true).open(p) {
                Ok(f) => {
                    info!("Access log enabled: {:?}", p);
                    Some(f)
                }
                Err(e) => {
                    error!("Failed to open access log file {:?}: {}", p, e);
                    None
                }
            }
        } else {
            debug!("Access logging to tracing only (no file configured)");
            None
        };

        Self {
            file: Arc::new(Mutex::new(file)),
            enabled: path.is_some(),
        }
    }

    /// Log a session entry
    pub fn log(&self, entry: &AccessLogEntry) {
        if self.enabled {
            let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
            let upstream = entry.upstream.as_deref().unwrap_or("-");

            let log_line = format!(
                "{} {} [{}] {} upstream={} in={} out={} time={}ms\n",
                entry.remote_addr.ip(),
                entry.client_cn,
                timestamp,
                entry.outcome.as_str(),
                upstream,
                entry.bytes_in,
                entry.bytes_out,
                entry.duration_ms
            );

            if let Ok(mut guard) = self.file.lock() {
                if let Some(ref mut file) = *guard {
                    if let Err(e) = file.write_all(log_line.as_bytes()) {
                        error!("Failed to write access log: {}", e);
                    }
                }
            }
        }

        // Also log at debug level for journald capture
        debug!(
            target: "access_log",
            remote_addr = %entry.remote_addr.ip(),
            client = %entry.client_cn,
            outcome = entry.outcome.as_str(),
            upstream = ?entry.upstream,
            bytes_in = entry.bytes_in,
            bytes_out = entry.bytes_out,
            duration_ms = entry.duration_ms,
            "session"
        );
    }
}

/// Global access logger instance using OnceLock for thread-safe initialization
static ACCESS_LOGGER: OnceLock<AccessLogger> = OnceLock::new();

/// Initialize the global access logger
pub fn init_access_logger(path: Option<PathBuf>) {
    let _ = ACCESS_LOGGER.set(AccessLogger::new(path));
}

/// Log a session entry using the global logger
pub fn log_access(entry: &AccessLogEntry) {
    if let Some(logger) = ACCESS_LOGGER.get() {
        logger.log(entry);
    }
}
