use std::sync::{Arc, Mutex};
use taghist_error::{THError, THResult};
use taghist_models::settings::LogConfig;
use tracing::{subscriber::set_global_default, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn, fmt, layer::SubscriberExt, Layer, Registry,
};

/// Logging bootstrap: console plus a daily-rolling file, with a level that
/// can be adjusted at runtime.
pub struct Logger {
    level: Arc<Mutex<Level>>,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(config: &LogConfig) -> Self {
        let level = parse_level(&config.level).unwrap_or(Level::INFO);
        Logger {
            level: Arc::new(Mutex::new(level)),
            _file_guard: None,
        }
    }

    #[inline]
    pub fn set_level(&self, new_level: Level) {
        *self.level.lock().unwrap() = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *self.level.lock().unwrap()
    }

    /// Install the global subscriber. The returned guard inside `self` keeps
    /// the non-blocking file writer alive; keep the `Logger` around for the
    /// process lifetime.
    pub fn initialize(&mut self, config: &LogConfig) -> THResult<()> {
        let file_appender = rolling::daily(&config.dir, "taghist.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        self._file_guard = Some(guard);

        let console_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| metadata.level() <= &*level.lock().unwrap())
        };
        let file_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| metadata.level() <= &*level.lock().unwrap())
        };

        let console_layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_filter(console_filter);
        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        let subscriber = Registry::default().with(console_layer).with(file_layer);
        set_global_default(subscriber).map_err(|_| THError::from("failed to set logger"))?;
        Ok(())
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}
