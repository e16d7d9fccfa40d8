use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(log: &LogConfig) {
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},oplscraper={}", log.level, log.level)));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    // Ignore a second install (tests, repeated calls from one binary).
    let _ = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {}", info);
    }));
}
