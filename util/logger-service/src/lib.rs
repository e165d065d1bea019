//! Runtime logging backend.
//!
//! Formats and routes [`log`] records to stdout, the main log file, and any
//! number of additional named file sinks (`extra` loggers), each governed by
//! its own filter directive string. The backend installs the global `log`
//! logger exactly once per process; [`init`] may be called again afterwards
//! (tests do this routinely) to swap in a new [`LoggerConfig`] without
//! re-registering with the `log` crate, which only accepts one logger.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use env_logger::filter::{Builder as FilterBuilder, Filter};
use frame_logger_config::LoggerConfig;
use log::{Level, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

static LOGGER: OnceCell<Logger> = OnceCell::new();

#[derive(Debug)]
pub enum Error {
    /// `log::set_logger` rejected the logger; this only happens if some
    /// other crate installed one first.
    AlreadySetByOther,
    NotInitialized,
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AlreadySetByOther => {
                write!(f, "a global logger was already installed by another crate")
            }
            Error::NotInitialized => write!(f, "logger has not been initialized yet"),
            Error::Io(e) => write!(f, "log file io error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// RAII handle returned by [`init`] / [`init_silent`]. Dropping it flushes
/// the file sinks; it does not uninstall the logger, since `log` has no
/// mechanism to do so.
pub struct Guard(());

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(logger) = LOGGER.get() {
            logger.flush();
        }
    }
}

struct ExtraSink {
    filter: Filter,
    file: Mutex<File>,
}

struct Logger {
    log_dir: RwLock<PathBuf>,
    main_file_path: RwLock<PathBuf>,
    filter: RwLock<Filter>,
    to_stdout: AtomicBool,
    to_stdout_color: AtomicBool,
    to_file: AtomicBool,
    file: Mutex<Option<File>>,
    extra: RwLock<std::collections::HashMap<String, ExtraSink>>,
}

fn build_filter(directives: &str) -> Filter {
    FilterBuilder::new().parse(directives).build()
}

fn recompute_max_level(logger: &Logger) {
    let mut max = logger.filter.read().filter();
    for sink in logger.extra.read().values() {
        max = max.max(sink.filter.filter());
    }
    log::set_max_level(max);
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn timestamp_now() -> String {
    use time::format_description::well_known::Rfc3339;
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let format = time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3] [offset_hour sign:mandatory]:[offset_minute]"
    );
    now.format(&format)
        .unwrap_or_else(|_| now.format(&Rfc3339).unwrap_or_default())
}

fn plain_line(record: &Record) -> String {
    let thread = std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string();
    format!(
        "{} {} {} {}  {}",
        timestamp_now(),
        thread,
        record.level(),
        record.target(),
        record.args()
    )
}

fn colored_line(record: &Record) -> String {
    use yansi::Paint;
    let thread = std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string();
    let level = match record.level() {
        Level::Error => Paint::red(record.level()).to_string(),
        Level::Warn => Paint::yellow(record.level()).to_string(),
        Level::Info => Paint::green(record.level()).to_string(),
        Level::Debug => Paint::blue(record.level()).to_string(),
        Level::Trace => Paint::magenta(record.level()).to_string(),
    };
    format!(
        "{} {} {} {}  {}",
        timestamp_now(),
        thread,
        level,
        record.target(),
        record.args()
    )
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if self.filter.read().enabled(metadata) {
            return true;
        }
        self.extra
            .read()
            .values()
            .any(|sink| sink.filter.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        let main_matches = self.filter.read().matches(record);
        if main_matches {
            if self.to_stdout.load(Ordering::Relaxed) {
                if self.to_stdout_color.load(Ordering::Relaxed) {
                    println!("{}", colored_line(record));
                } else {
                    println!("{}", plain_line(record));
                }
            }
            if self.to_file.load(Ordering::Relaxed) {
                let line = plain_line(record);
                if let Some(file) = self.file.lock().unwrap().as_mut() {
                    let _ = writeln!(file, "{line}");
                }
            }
        }

        for sink in self.extra.read().values() {
            if sink.filter.matches(record) {
                let line = plain_line(record);
                let mut file = sink.file.lock().unwrap();
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = self.file.lock().unwrap().as_mut() {
            let _ = file.flush();
        }
        for sink in self.extra.read().values() {
            let _ = sink.file.lock().unwrap().flush();
        }
    }
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("unnamed");
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());
        log::error!(
            target: "panic",
            "thread '{name}' panicked at '{payload}': {location}\n{:?}",
            backtrace_placeholder()
        );
    }));
}

/// Backtraces are expensive to capture on every panic; this crate leaves the
/// actual capture to `RUST_BACKTRACE`-aware default output and only logs the
/// location, matching the structured-log line the rest of the pipeline emits.
fn backtrace_placeholder() -> &'static str {
    "<set RUST_BACKTRACE=1 for a backtrace>"
}

fn resolve_filter_directive(env_override: Option<&str>, config: &LoggerConfig) -> String {
    if let Some(var) = env_override {
        if let Ok(value) = std::env::var(var) {
            return value;
        }
    }
    config
        .filter
        .clone()
        .unwrap_or_else(|| "info".to_string())
}

fn build_extra_sinks(
    log_dir: &Path,
    config: &LoggerConfig,
) -> std::io::Result<std::collections::HashMap<String, ExtraSink>> {
    let mut map = std::collections::HashMap::new();
    for (name, extra) in &config.extra {
        let path = log_dir.join(format!("{name}.log"));
        let file = open_log_file(&path)?;
        map.insert(
            name.clone(),
            ExtraSink {
                filter: build_filter(&extra.filter),
                file: Mutex::new(file),
            },
        );
    }
    Ok(map)
}

fn configure(logger: &Logger, env_override: Option<&str>, config: &LoggerConfig) -> Result<(), Error> {
    let directive = resolve_filter_directive(env_override, config);
    *logger.filter.write() = build_filter(&directive);
    logger
        .to_stdout
        .store(config.log_to_stdout, Ordering::Relaxed);
    logger.to_stdout_color.store(config.color, Ordering::Relaxed);
    logger.to_file.store(config.log_to_file, Ordering::Relaxed);

    let main_path = config.log_dir.join(&config.file);
    let file = if config.log_to_file {
        Some(open_log_file(&main_path)?)
    } else {
        None
    };
    *logger.file.lock().unwrap() = file;
    *logger.main_file_path.write() = main_path;
    *logger.log_dir.write() = config.log_dir.clone();

    let extra = build_extra_sinks(&config.log_dir, config)?;
    *logger.extra.write() = extra;

    recompute_max_level(logger);
    Ok(())
}

/// Initializes (or reconfigures) the process-wide logger from `config`.
///
/// If `env_override` names an environment variable and it is set, its value
/// replaces `config.filter` for the main logger's directive string.
pub fn init(env_override: Option<&str>, config: LoggerConfig) -> Result<Guard, Error> {
    if let Some(logger) = LOGGER.get() {
        configure(logger, env_override, &config)?;
        return Ok(Guard(()));
    }

    let directive = resolve_filter_directive(env_override, &config);
    let main_path = config.log_dir.join(&config.file);
    let file = if config.log_to_file {
        Some(open_log_file(&main_path)?)
    } else {
        None
    };
    let extra = build_extra_sinks(&config.log_dir, &config)?;

    let logger = Logger {
        log_dir: RwLock::new(config.log_dir.clone()),
        main_file_path: RwLock::new(main_path),
        filter: RwLock::new(build_filter(&directive)),
        to_stdout: AtomicBool::new(config.log_to_stdout),
        to_stdout_color: AtomicBool::new(config.color),
        to_file: AtomicBool::new(config.log_to_file),
        file: Mutex::new(file),
        extra: RwLock::new(extra),
    };

    LOGGER.set(logger).map_err(|_| Error::AlreadySetByOther)?;
    let installed = LOGGER.get().expect("just inserted");
    recompute_max_level(installed);
    log::set_logger(installed).map_err(|_| Error::AlreadySetByOther)?;
    install_panic_hook();
    Ok(Guard(()))
}

/// Initializes a logger that discards everything; used by components that
/// want `frame_logger` call sites to remain compiled but silent, such as unit
/// tests that assert on return values rather than log output.
pub fn init_silent() -> Result<Guard, Error> {
    let config = LoggerConfig {
        filter: Some("off".to_string()),
        color: false,
        log_to_stdout: false,
        log_to_file: false,
        ..Default::default()
    };
    init(None, config)
}

/// Entry point for reconfiguring the running backend without a restart:
/// `Logger::update_main_logger`, `::update_extra_logger`, `::remove_extra_logger`.
pub struct LoggerUpdater;

impl LoggerUpdater {
    pub fn update_main_logger(
        filter: Option<String>,
        log_to_stdout: Option<bool>,
        log_to_file: Option<bool>,
        log_to_stdout_color: Option<bool>,
    ) -> Result<(), Error> {
        let logger = LOGGER.get().ok_or(Error::NotInitialized)?;
        if let Some(f) = filter {
            *logger.filter.write() = build_filter(&f);
        }
        if let Some(v) = log_to_stdout {
            logger.to_stdout.store(v, Ordering::Relaxed);
        }
        if let Some(v) = log_to_file {
            logger.to_file.store(v, Ordering::Relaxed);
            let mut slot = logger.file.lock().unwrap();
            if v && slot.is_none() {
                let path = logger.main_file_path.read().clone();
                *slot = Some(open_log_file(&path)?);
            }
        }
        if let Some(v) = log_to_stdout_color {
            logger.to_stdout_color.store(v, Ordering::Relaxed);
        }
        recompute_max_level(logger);
        Ok(())
    }

    pub fn update_extra_logger(name: String, filter: String) -> Result<(), Error> {
        let logger = LOGGER.get().ok_or(Error::NotInitialized)?;
        let path = logger.log_dir.read().join(format!("{name}.log"));
        let file = open_log_file(&path)?;
        logger.extra.write().insert(
            name,
            ExtraSink {
                filter: build_filter(&filter),
                file: Mutex::new(file),
            },
        );
        recompute_max_level(logger);
        Ok(())
    }

    pub fn remove_extra_logger(name: String) -> Result<(), Error> {
        let logger = LOGGER.get().ok_or(Error::NotInitialized)?;
        logger.extra.write().remove(&name);
        recompute_max_level(logger);
        Ok(())
    }
}

pub use LoggerUpdater as Logger;
