pub mod metrics;

pub use metrics::{
    names, HistogramSummary, MetricType, MetricsRecorder, MetricsSnapshot, HISTOGRAM_WINDOW,
};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "easel_server::batcher" => TRACE).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from a level name such as `"debug"`; unknown names fall back to INFO.
    pub fn from_level_name(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            json,
            ..Self::default()
        }
    }

    fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the metrics recorder alive for the lifetime of the process.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize logging and metrics. Call once at startup; later calls keep
/// the first subscriber.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        tracing::debug!("easel-telemetry: subscriber already set: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

/// Run `f` with a warn-level stderr subscriber in scope.
///
/// Settings decide how logging is configured, so they load before
/// [`init_telemetry`]; warnings raised while loading them still get printed.
pub fn with_bootstrap_logging<T>(f: impl FnOnce() -> T) -> T {
    with_bootstrap_writer(std::io::stderr, f)
}

fn with_bootstrap_writer<W, T>(writer: W, f: impl FnOnce() -> T) -> T
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_writer(writer)
        .with_ansi(false)
        .compact()
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;

    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bootstrap_logging_prints_early_warnings() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let writer = {
            let out = Arc::clone(&out);
            move || Capture(Arc::clone(&out))
        };

        let value = with_bootstrap_writer(writer, || {
            tracing::warn!(key = "EASEL_PORT", value = "abc", "invalid u16 env var, ignoring");
            tracing::info!("not shown");
            7
        });

        assert_eq!(value, 7);
        let text = String::from_utf8(out.lock().clone()).unwrap();
        assert!(text.contains("EASEL_PORT"));
        assert!(text.contains("invalid u16 env var"));
        assert!(!text.contains("not shown"));
    }

    #[test]
    fn filter_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("easel_server".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.filter_directive(), "warn,easel_server=debug");
    }

    #[test]
    fn level_name_parsing() {
        assert_eq!(TelemetryConfig::from_level_name("debug", false).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_level_name("nonsense", false).log_level, Level::INFO);
    }

    #[test]
    fn init_twice_does_not_panic() {
        let first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        first.metrics().counter_inc("x", &[], 1);
        assert_eq!(second.metrics().counter_get("x", &[]), 0);
    }
}
