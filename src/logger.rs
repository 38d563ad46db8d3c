use tracing_subscriber::EnvFilter;

/// Filter directive for the numeric `log_level` setting
/// (debug=5, info=4, warning=3, error=2, fatal=1, panic=0).
pub fn directive(log_level: u8) -> &'static str {
    match log_level {
        5..=u8::MAX => "debug",
        4 => "info",
        3 => "warn",
        _ => "error",
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `log_level` when set.
pub fn init(log_level: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(log_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
