use std::{borrow::Cow, fmt, io::IsTerminal, path::PathBuf, str::FromStr};

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use config::Config;
use logforth::filter::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "Gatekeeper", version, long_about = concat!("Gatekeeper v", env!("CARGO_PKG_VERSION")))]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "GATEKEEPER_CONFIG_PATH", default_value = "./gatekeeper.toml")]
    pub config: PathBuf,
    /// Set the logging level
    #[arg(long = "log", env = "GATEKEEPER_LOG", default_value_t = LogLevel::default())]
    pub log_level: LogLevel,
    /// Set the style of log output
    #[arg(long, env = "GATEKEEPER_LOG_STYLE", default_value_t = LogStyle::default())]
    pub log_style: LogStyle,
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn config(&self) -> anyhow::Result<Config> {
        let config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            log::info!(
                "No configuration file at {}, using defaults",
                self.config.display()
            );
            Config::default()
        };

        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the configuration and print the effective limits
    Validate,
    /// Check whether a request of the caller would be admitted, without counting it
    Check {
        #[command(flatten)]
        caller: Caller,
        /// Tokens the request is expected to use
        #[arg(long, default_value_t = 0)]
        tokens: u64,
    },
    /// Print the current usage of a caller as JSON
    Usage {
        #[command(flatten)]
        caller: Caller,
    },
    /// Clear the counters of a caller, or of everyone
    Reset {
        #[command(flatten)]
        caller: Caller,
        /// Clear every counter, including the global bucket
        #[arg(long, conflicts_with_all = ["user", "session"])]
        all: bool,
    },
}

/// Identity of the caller a command applies to.
#[derive(Debug, ClapArgs)]
pub struct Caller {
    /// User id of the caller
    #[arg(long)]
    pub user: Option<String>,
    /// Session id of the caller, used when there is no user id
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogStyle {
    /// Colorized text, used as the default with TTY output
    Color,
    /// Standard text, used as the default with non-TTY output
    Text,
    /// JSON objects
    Json,
}

impl Default for LogStyle {
    fn default() -> Self {
        if std::io::stderr().is_terminal() {
            LogStyle::Color
        } else {
            LogStyle::Text
        }
    }
}

impl AsRef<str> for LogStyle {
    fn as_ref(&self) -> &str {
        match self {
            LogStyle::Color => "color",
            LogStyle::Text => "text",
            LogStyle::Json => "json",
        }
    }
}

impl fmt::Display for LogStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogLevel {
    /// Disable logging
    Off,
    /// Only log errors
    Error,
    /// Log errors, and warnings
    #[default]
    Warn,
    /// Log errors, warnings, and info messages
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log errors, warnings, info, debug, and trace messages
    Trace,
}

impl LogLevel {
    pub fn env_filter(self) -> anyhow::Result<EnvFilter> {
        let filter_str = match self {
            LogLevel::Off => Cow::Borrowed("off"),
            // Dependencies stay at 'warn', workspace crates follow the selected level.
            level => Cow::Owned(format!(
                "warn,gatekeeper={level},rate_limit={level},config={level},telemetry={level}"
            )),
        };

        EnvFilter::from_str(&filter_str).map_err(|e| anyhow::anyhow!("Invalid log filter '{filter_str}': {e}"))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_all_conflicts_with_caller() {
        let result = Args::try_parse_from(["gatekeeper", "reset", "--all", "--user", "alice"]);
        assert!(result.is_err());

        let args = Args::try_parse_from(["gatekeeper", "reset", "--all"]).unwrap();
        assert!(matches!(args.command, Command::Reset { all: true, .. }));
    }

    #[test]
    fn check_takes_caller_and_tokens() {
        let args =
            Args::try_parse_from(["gatekeeper", "-c", "limits.toml", "check", "--session", "s1", "--tokens", "500"])
                .unwrap();

        assert_eq!(args.config, PathBuf::from("limits.toml"));

        let Command::Check { caller, tokens } = args.command else {
            unreachable!("expected the check command");
        };

        assert_eq!(caller.user, None);
        assert_eq!(caller.session.as_deref(), Some("s1"));
        assert_eq!(tokens, 500);
    }

    #[test]
    fn log_levels_scope_workspace_crates() {
        assert!(LogLevel::Debug.env_filter().is_ok());
        assert!(LogLevel::Off.env_filter().is_ok());
    }
}
