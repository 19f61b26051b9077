use talemu_events::LogSinkLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Install the global subscriber: env-filtered fmt output plus the optional
/// log sink bridge layer.
pub fn init(
    filter: &str,
    format: LogFormat,
    sink: Option<LogSinkLayer>,
) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(filter)?;

    match format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(sink)
                .with(fmt::layer())
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(sink)
                .with(fmt::layer().json())
                .init();
        }
    }

    Ok(())
}
