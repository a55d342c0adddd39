use clap::Args;

use crate::config::LoggingConfig;

/// Logging options shared by every command
#[derive(Debug, Clone, Default, Args)]
pub struct LoggingArgs {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "SPARSEDIT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log filter directives
    #[arg(long = "log-filter", env = "SPARSEDIT_LOG_FILTER")]
    pub log_filter: Option<String>,
}

impl LoggingArgs {
    /// Level from the flags, falling back to the configured one
    pub fn get_effective_level<'a>(&'a self, configured: &'a str) -> &'a str {
        match (self.verbose, self.log_level.as_deref()) {
            (v, _) if v >= 2 => "trace",
            (1, _) => "debug",
            (0, Some(level)) => level,
            _ => configured,
        }
    }

    /// `EnvFilter` directives for this invocation.
    ///
    /// An explicit `--log-filter` always wins. The configured filter applies
    /// only when no `-v` was given, otherwise the crate directive follows the
    /// effective level.
    pub fn filter_directives(&self, config: &LoggingConfig) -> String {
        let level = self.get_effective_level(&config.level);
        match (self.log_filter.as_deref(), config.filter.as_deref()) {
            (Some(filter), _) => filter.to_owned(),
            (None, Some(filter)) if self.verbose == 0 => filter.to_owned(),
            _ => format!("sparsedit_core={}", level),
        }
    }
}
