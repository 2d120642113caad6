use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Handle used to change the log filter at runtime.
pub type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Human-readable lines on stderr.
    Stderr,
    /// JSON lines in an hourly rolling file `stratadb.log` under `dir`.
    File { dir: String },
}

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
}

/// Install the global subscriber. Fails if one is already installed.
/// Returns a reload handle that can update the filter at runtime.
pub fn init(target: LogTarget, level: Level) -> Result<LogHandle> {
    let (filter, handle) = reload::Layer::new(filter_for(level));
    let (stderr_layer, file_layer) = match target {
        LogTarget::Stderr => (Some(fmt::layer().with_writer(std::io::stderr).with_target(true)), None),
        LogTarget::File { dir } => {
            let appender = RollingFileAppender::new(Rotation::HOURLY, dir, "stratadb.log");
            let layer = fmt::layer()
                .with_writer(appender)
                .json()
                .with_current_span(false)
                .with_span_list(false);
            (None, Some(layer))
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("installing log subscriber")?;
    Ok(handle)
}

/// Replace the active filter with a directive string such as
/// `"info,strata_exec=debug"`.
pub fn set_filter(handle: &LogHandle, directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives).with_context(|| format!("invalid log filter {directives:?}"))?;
    handle.reload(filter).context("reloading log filter")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_once_then_reload() {
        let handle = init(LogTarget::Stderr, Level::INFO).unwrap();
        set_filter(&handle, "warn,strata_exec=debug").unwrap();
        assert!(set_filter(&handle, "strata_exec=notalevel").is_err());
        assert!(init(LogTarget::Stderr, Level::DEBUG).is_err());
    }
}
