use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

static LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("claude-squad")
        .join("logs")
}

pub fn log_path() -> PathBuf {
    if let Ok(guard) = LOG_PATH.lock() {
        if let Some(ref path) = *guard {
            return path.clone();
        }
    }

    let dir = log_dir();
    if let Err(e) = fs::create_dir_all(&dir) {
        eprintln!("Failed to create log directory: {e}");
    }

    let file = dir.join(format!("cs-{}.log", Local::now().format("%Y%m%d-%H%M%S")));
    if let Ok(mut guard) = LOG_PATH.lock() {
        *guard = Some(file.clone());
    }
    file
}

/// Initialize logging once at process entry. The controller logs to stderr
/// and the log file; the daemon has no terminal, so it logs to the file only.
pub fn init_logging(daemon: bool) {
    let path = log_path();
    let path_for_format = path.clone();

    let mut builder = Builder::new();

    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    } else {
        builder.filter_module("claude_squad", LevelFilter::Debug);
        builder.filter_module("cs", LevelFilter::Debug);
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(move |buf, record| {
        let level = match record.level() {
            log::Level::Error => "ERROR",
            log::Level::Warn => "WARN ",
            log::Level::Info => "INFO ",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };
        let line = format!(
            "[{} {} {}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            record.target(),
            record.args()
        );

        if !daemon {
            write!(buf, "{line}")?;
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path_for_format)
        {
            let _ = file.write_all(line.as_bytes());
        }
        Ok(())
    });

    builder.target(env_logger::Target::Stderr);
    // A second init (tests, re-entry) is not fatal.
    let _ = builder.try_init();

    log::info!(
        "claude-squad v{} starting (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );
    log::info!("log file: {}", path.display());
}

/// Rate limiter for repeating error logs: `should_log` answers true at most
/// once per window. The daemon uses a 60 s window so a wedged instance does
/// not flood the log at poll frequency.
pub struct LogEvery {
    window: Duration,
    last: Option<Instant>,
}

impl LogEvery {
    pub fn new(window: Duration) -> LogEvery {
        LogEvery { window, last: None }
    }

    pub fn should_log(&mut self) -> bool {
        match self.last {
            Some(last) if last.elapsed() < self.window => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}
