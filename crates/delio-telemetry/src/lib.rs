mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{names, HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "delio_kernel::guard" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: delio_dir().join("database/kernel-logs.db"),
        }
    }
}

/// Handle to the installed telemetry stack.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Arc<MetricsRecorder>,
    base_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    filter_handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        if let Some(handle) = &self.filter_handle {
            if let Err(e) = handle.reload(EnvFilter::new(directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Shared metrics recorder.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    /// Persisted warn+ logs, when enabled.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup; a second call
/// keeps the first subscriber and returns a guard without a filter handle.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter_str = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    // JSON lines on stderr; stdout belongs to the operator console
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_list(true);

    let (sqlite_layer, log_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("delio-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        log_sink,
        metrics: Arc::new(MetricsRecorder::new()),
        base_level: config.log_level,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
        filter_handle: installed.then_some(filter_handle),
    }
}

/// Parse a level name (`"warn"`, `"DEBUG"`), falling back to INFO.
pub fn parse_level(value: &str) -> Level {
    value.trim().parse().unwrap_or(Level::INFO)
}

fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    let mut directives = base.to_string().to_lowercase();
    for (module, level) in modules {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

fn delio_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".delio")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let directives = filter_directives(
            Level::WARN,
            &[("delio_kernel::guard".to_string(), Level::DEBUG)],
        );
        assert_eq!(directives, "warn,delio_kernel::guard=debug");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn default_config_paths_under_delio_dir() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.ends_with("database/kernel-logs.db"));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn guard_tracks_module_levels() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init_telemetry(TelemetryConfig {
            log_db_path: dir.path().join("logs.db"),
            ..Default::default()
        });
        guard.set_module_level("delio_kernel", Level::DEBUG);
        guard.set_module_level("delio_kernel", Level::TRACE);
        assert_eq!(guard.module_levels(), vec![("delio_kernel".to_string(), Level::TRACE)]);
        assert!(guard.logs().is_some());
        guard.metrics().counter_inc(names::CYCLES_TOTAL, &[], 1);
        assert_eq!(guard.metrics().counter_get(names::CYCLES_TOTAL, &[]), 1);
    }
}
