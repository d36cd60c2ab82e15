//! Subscriber wiring for the binaries. Library code only emits `tracing`
//! events; installing a subscriber is left to [`crate::config::set_logger`].

#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::{EnvFilter, Layer, Registry};

    /// Set to any value to install no subscriber at all.
    pub const DISABLE_LOGS_ENV: &str = "LANSPEED_DISABLE_LOGS";
    /// Set to any value to log to stderr instead of stdout.
    pub const LOG_TO_STDERR_ENV: &str = "LANSPEED_LOG_TO_STDERR";
    /// `json` switches to one JSON object per event.
    pub const LOG_FORMAT_ENV: &str = "LANSPEED_LOG_FORMAT";

    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var(DISABLE_LOGS_ENV).is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy()
            .add_directive("hyper=info".parse()?)
            .add_directive("reqwest=info".parse()?);

        let to_stderr = std::env::var(LOG_TO_STDERR_ENV).is_ok();
        let use_json = std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
