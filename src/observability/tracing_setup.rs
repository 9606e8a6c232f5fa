// observability/tracing_setup.rs - Log output for agents

use serde::Deserialize;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// How log lines are rendered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingFormat {
    /// Multi-line, for reading one agent at a time
    #[default]
    Pretty,
    /// One line per event, closest to the classic `[agent] time --> text` console
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for TracingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(TracingFormat::Pretty),
            "compact" => Ok(TracingFormat::Compact),
            "json" => Ok(TracingFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Log subscriber settings.
///
/// `RUST_LOG` always wins over `directives`.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Level for everything not named in `directives`
    pub level: LevelFilter,

    /// Extra `EnvFilter` directives, e.g. `fipa_contract_net::network=trace`
    pub directives: Vec<String>,

    pub format: TracingFormat,

    /// Log when actor handler spans close, with their busy time
    pub span_timings: bool,

    /// Colored output; ignored for JSON
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            directives: Vec::new(),
            format: TracingFormat::Pretty,
            span_timings: false,
            ansi: true,
        }
    }
}

impl TracingConfig {
    /// Config for a level name as given on a command line. Unknown names fall
    /// back to `info`.
    pub fn for_level(level: &str, format: TracingFormat) -> Self {
        Self {
            level: level.parse().unwrap_or(LevelFilter::INFO),
            format,
            ..Self::default()
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_span_timings(mut self) -> Self {
        self.span_timings = true;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
        let mut filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .parse_lossy("");
        for directive in &self.directives {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("ignoring log directive '{directive}': {e}"),
            }
        }
        filter
    }
}

/// Install the global subscriber. A second call fails instead of replacing it.
pub fn init_tracing(config: TracingConfig) -> Result<(), TryInitError> {
    let spans = if config.span_timings { FmtSpan::CLOSE } else { FmtSpan::NONE };
    let ansi = config.ansi && config.format != TracingFormat::Json;

    let output = fmt::layer().with_span_events(spans).with_ansi(ansi);
    let output = match config.format {
        TracingFormat::Pretty => output.pretty().boxed(),
        TracingFormat::Compact => output.compact().with_target(false).boxed(),
        TracingFormat::Json => output.json().flatten_event(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(config.env_filter())
        .try_init()?;

    tracing::debug!(level = %config.level, format = ?config.format, "Logging ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_level_parses_names() {
        assert_eq!(TracingConfig::for_level("warn", TracingFormat::Compact).level, LevelFilter::WARN);
        assert_eq!(TracingConfig::for_level("DEBUG", TracingFormat::Json).level, LevelFilter::DEBUG);
        assert_eq!(TracingConfig::for_level("loud", TracingFormat::Pretty).level, LevelFilter::INFO);
    }

    #[test]
    fn test_directives_accumulate() {
        let config = TracingConfig::default()
            .with_directive("fipa_contract_net::network=trace")
            .with_span_timings();
        assert_eq!(config.directives.len(), 1);
        assert!(config.span_timings);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<TracingFormat>(), Ok(TracingFormat::Json));
        assert!("xml".parse::<TracingFormat>().is_err());
    }
}
