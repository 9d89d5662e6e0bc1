use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time},
    layer::SubscriberExt,
    EnvFilter,
};

// Logging is initialized at most once per process
static INIT: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Map a level name to a tracing level, defaulting to `INFO`
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize console logging. `RUST_LOG` directives are honored on top of
/// `log_level`. Later calls, or a subscriber installed elsewhere, are left
/// alone.
pub fn init_logger(log_level: &str) {
    if INITIALIZED.load(Ordering::SeqCst) {
        return;
    }

    INIT.call_once(|| {
        let env_filter = EnvFilter::from_default_env().add_directive(parse_level(log_level).into());

        let terminal_layer = fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(time::SystemTime::default())
            .with_file(true)
            .with_line_number(true)
            .with_target(false);

        let subscriber = tracing_subscriber::registry().with(env_filter).with(terminal_layer);

        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            tracing::debug!("Logging system initialized, output to console");
        }

        INITIALIZED.store(true, Ordering::SeqCst);
    });
}
