//! Logging setup.
//!
//! Binaries install `env_logger`; the Python extension forwards `log` records
//! into Python's `logging` module so they show up next to the host
//! application's own records.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "SHIMMER_LOG";

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| parse_level(Some(v)))
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Install a stderr logger for binaries, levelled by `SHIMMER_LOG` or `RUST_LOG`.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use self::python_bridge::{
    init_python_logging, reset_python_logging_cache, set_python_log_level,
    set_python_log_level_str,
};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, Once, PoisonError};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        /// Python logger name -> (effective level, logger object)
        cache: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn py_level(level: Level) -> usize {
            match level {
                Level::Error => 40,
                Level::Warn => 30,
                Level::Info => 20,
                Level::Debug => 10,
                Level::Trace => 5,
            }
        }

        fn effective_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (Self::py_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        /// Python logger for `name`, looked up once and cached.
        fn logger_for(&self, py: Python<'_>, name: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut cache = lock(&self.cache);
            if let Some((level, logger)) = cache.get(name) {
                return Ok((*level, logger.clone_ref(py)));
            }

            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((name,))?;
            let level = Self::effective_level(&logger).unwrap_or(LevelFilter::Off);
            let logger = logger.unbind();
            cache.insert(name.to_string(), (level, logger.clone_ref(py)));
            Ok((level, logger))
        }

        fn emit(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let (enabled, logger) = self.logger_for(py, &name)?;

            let level = record.level().to_level_filter();
            if level > enabled || level > *lock(&self.top_filter) {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let rec = logger.call_method1(
                "makeRecord",
                (
                    &name,
                    Self::py_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none, // exc_info
                    &none, // func
                    &none, // extra
                ),
            )?;
            logger.call_method1("handle", (rec,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *lock(&self.top_filter)
        }

        fn log(&self, record: &Record) {
            Python::attach(|py| {
                if let Err(e) = self.emit(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust `log` records into Python's `logging`. Idempotent.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => e.restore(py),
        });
        Ok(())
    }

    /// Forget cached Python loggers; call after reconfiguring Python logging.
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            lock(&logger.cache).clear();
        }
    }

    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *lock(&logger.top_filter) = level;
            reset_python_logging_cache();
        }
        log::set_max_level(level);
        Ok(())
    }

    /// Like [`set_python_log_level`], parsing `level` (falling back to the
    /// environment when absent or invalid).
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        set_python_log_level(py, level)
    }
}
