use slog::Drain;
use std::convert::TryFrom;
use std::env;
use std::time::Duration;

/// Options configures a peer. Every field is optional; unset fields fall
/// back to the defaults described on [`Config`].
#[derive(Clone, Default)]
pub struct Options {
    /// Deadline applied to calls whose context carries none.
    pub default_timeout: Option<Duration>,
    /// Sink for textual events. Defaults to an info-level stderr logger.
    pub logger: Option<slog::Logger>,
    /// Command server pre-fetch; bounds concurrently dispatched requests.
    pub command_workers: Option<usize>,
    /// Bounds concurrently running notification and async-response handlers.
    pub session_workers: Option<usize>,
    /// Period of the remote catalog cache GC.
    pub prune_interval: Option<Duration>,
    /// Self-identification string attached to outbound message headers.
    pub product: Option<String>,
}

impl Options {
    /// Reads overrides from `RINQ_*` environment variables. Variables that
    /// are unset or empty are ignored.
    pub fn from_env() -> Result<Options, ConfigError> {
        let mut options = Options::default();

        if let Some(ms) = env_positive_int("RINQ_DEFAULT_TIMEOUT")? {
            options.default_timeout = Some(Duration::from_millis(ms));
        }

        if let Some(value) = env_var("RINQ_LOG_DEBUG") {
            let debug = value.parse::<bool>().map_err(|_| ConfigError::InvalidBool {
                var: "RINQ_LOG_DEBUG",
                value,
            })?;
            options.logger = Some(default_logger(debug));
        }

        if let Some(n) = env_positive_int("RINQ_COMMAND_WORKERS")? {
            options.command_workers = Some(n as usize);
        }

        if let Some(n) = env_positive_int("RINQ_SESSION_WORKERS")? {
            options.session_workers = Some(n as usize);
        }

        if let Some(ms) = env_positive_int("RINQ_PRUNE_INTERVAL")? {
            options.prune_interval = Some(Duration::from_millis(ms));
        }

        if let Some(product) = env_var("RINQ_PRODUCT") {
            options.product = Some(product);
        }

        Ok(options)
    }
}

/// Config is a resolved set of options.
#[derive(Clone)]
pub struct Config {
    pub default_timeout: Duration,
    pub logger: slog::Logger,
    pub command_workers: usize,
    pub session_workers: usize,
    pub prune_interval: Duration,
    pub product: String,
}

impl TryFrom<Options> for Config {
    type Error = ConfigError;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        Ok(Config {
            default_timeout: options.default_timeout.unwrap_or(Duration::from_secs(5)),
            logger: options.logger.unwrap_or_else(|| default_logger(false)),
            command_workers: options.command_workers.unwrap_or(parallelism),
            session_workers: options.session_workers.unwrap_or(parallelism * 10),
            prune_interval: options.prune_interval.unwrap_or(Duration::from_secs(3 * 60)),
            product: options.product.unwrap_or_default(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidInteger { var: &'static str, value: String },
    #[error("{var} must be a boolean, got '{value}'")]
    InvalidBool { var: &'static str, value: String },
}

/// Builds the stderr logger used when the application does not supply one.
pub fn default_logger(debug: bool) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();

    let level = if debug { slog::Level::Debug } else { slog::Level::Info };
    let drain = slog::LevelFilter::new(drain, level).fuse();

    slog::Logger::root(drain, slog::o!())
}

fn env_var(var: &'static str) -> Option<String> {
    match env::var(var) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn env_positive_int(var: &'static str) -> Result<Option<u64>, ConfigError> {
    let value = match env_var(var) {
        Some(value) => value,
        None => return Ok(None),
    };

    match value.parse::<i64>() {
        Ok(n) if n > 0 => Ok(Some(n as u64)),
        _ => Err(ConfigError::InvalidInteger { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-wide; tests that touch them must not
    // run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "RINQ_DEFAULT_TIMEOUT",
        "RINQ_LOG_DEBUG",
        "RINQ_COMMAND_WORKERS",
        "RINQ_SESSION_WORKERS",
        "RINQ_PRUNE_INTERVAL",
        "RINQ_PRODUCT",
    ];

    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_LOCK.lock().unwrap();

        for var in ALL_VARS {
            env::remove_var(var);
        }
        for (var, value) in vars {
            env::set_var(var, value);
        }

        f();

        for var in ALL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn from_env_returns_empty_options_when_nothing_is_set() {
        with_env(&[], || {
            let options = Options::from_env().unwrap();
            assert!(options.default_timeout.is_none());
            assert!(options.logger.is_none());
            assert!(options.command_workers.is_none());
            assert!(options.session_workers.is_none());
            assert!(options.prune_interval.is_none());
            assert!(options.product.is_none());
        });
    }

    #[test]
    fn from_env_reads_default_timeout_in_milliseconds() {
        with_env(&[("RINQ_DEFAULT_TIMEOUT", "500")], || {
            let options = Options::from_env().unwrap();
            assert_eq!(options.default_timeout, Some(Duration::from_millis(500)));
        });
    }

    #[test]
    fn from_env_rejects_non_positive_timeouts() {
        with_env(&[("RINQ_DEFAULT_TIMEOUT", "-500")], || {
            assert!(Options::from_env().is_err());
        });
    }

    #[test]
    fn from_env_reads_worker_counts() {
        with_env(
            &[("RINQ_COMMAND_WORKERS", "15"), ("RINQ_SESSION_WORKERS", "25")],
            || {
                let options = Options::from_env().unwrap();
                assert_eq!(options.command_workers, Some(15));
                assert_eq!(options.session_workers, Some(25));
            },
        );
    }

    #[test]
    fn from_env_rejects_invalid_worker_counts() {
        with_env(&[("RINQ_COMMAND_WORKERS", "-1")], || {
            assert!(Options::from_env().is_err());
        });
    }

    #[test]
    fn from_env_reads_prune_interval_in_milliseconds() {
        with_env(&[("RINQ_PRUNE_INTERVAL", "1500")], || {
            let options = Options::from_env().unwrap();
            assert_eq!(options.prune_interval, Some(Duration::from_millis(1500)));
        });
    }

    #[test]
    fn from_env_builds_a_logger_from_log_debug() {
        with_env(&[("RINQ_LOG_DEBUG", "true")], || {
            let options = Options::from_env().unwrap();
            assert!(options.logger.is_some());
        });

        with_env(&[("RINQ_LOG_DEBUG", "not-a-bool")], || {
            assert!(Options::from_env().is_err());
        });
    }

    #[test]
    fn from_env_reads_product() {
        with_env(&[("RINQ_PRODUCT", "my-app")], || {
            let options = Options::from_env().unwrap();
            assert_eq!(options.product.as_deref(), Some("my-app"));
        });
    }

    #[test]
    fn config_applies_defaults() {
        let config = Config::try_from(Options::default()).unwrap();
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert!(config.command_workers >= 1);
        assert!(config.session_workers >= config.command_workers);
        assert_eq!(config.prune_interval, Duration::from_secs(180));
        assert_eq!(config.product, "");
    }
}
