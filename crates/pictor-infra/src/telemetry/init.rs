use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pictor_core::LogFormat;

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter() -> &'static str {
    "pictor=info,pictor_worker=info,pictor_db=info,pictor_storage=info,pictor_processing=info,sqlx=warn"
}

/// Install the global subscriber: an `EnvFilter` plus either a human-readable
/// or a JSON formatting layer.
pub fn init_telemetry(service_name: &str, log_format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter().into());
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!(service = service_name, format = ?log_format, "Telemetry initialized");
    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::debug!("Telemetry shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(default_filter()).is_ok());
    }

    #[test]
    fn second_install_is_an_error_not_a_panic() {
        let _ = init_telemetry("pictor-test", LogFormat::Text);
        assert!(init_telemetry("pictor-test", LogFormat::Json).is_err());
    }
}
