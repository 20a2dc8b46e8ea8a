//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default unit cost charged for a job that does not carry an estimate.
pub const DEFAULT_JOB_COST: f64 = 1000.0;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Token bucket burst size, in units.
    pub rate_capacity: f64,
    /// Time it takes an empty bucket to refill completely.
    pub refill_window: Duration,
    /// Delay between poll cycles.
    pub poll_interval: Duration,
    /// Attempts after which a failing job is marked failed.
    pub max_attempts: u32,
    /// Fixed delay before a failed attempt is retried.
    pub retry_backoff: Duration,
    /// Maximum jobs fetched per cycle.
    pub batch_size: usize,
    /// Cost charged for jobs with no estimate.
    pub default_cost: f64,
    /// Reclaim jobs stuck in `processing` for longer than this.
    ///
    /// `None` leaves them alone; an external sweep must reconcile jobs
    /// orphaned by a crash.
    pub reclaim_after: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rate_capacity: 15_000.0,
            refill_window: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(300), // 5 minutes
            batch_size: 10,
            default_cost: DEFAULT_JOB_COST,
            reclaim_after: None,
        }
    }
}

impl DispatcherConfig {
    /// Build config from environment variables, falling back to defaults.
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup, e.g. a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str| lookup(key).map(|raw| (key.to_string(), raw));

        let rate_capacity = parse_or(read("AI_RATE_LIMIT_TOKENS"), defaults.rate_capacity);
        let refill_window = parse_or(
            read("AI_RATE_LIMIT_WINDOW"),
            defaults.refill_window.as_secs_f64(),
        );
        let poll_interval = parse_or(
            read("QUEUE_PROCESS_INTERVAL"),
            defaults.poll_interval.as_secs_f64(),
        );
        let max_attempts = parse_or(read("QUEUE_MAX_ATTEMPTS"), defaults.max_attempts);
        let retry_backoff = parse_or(
            read("QUEUE_RETRY_BACKOFF_SECS"),
            defaults.retry_backoff.as_secs(),
        );
        let batch_size = parse_or(read("QUEUE_BATCH_SIZE"), defaults.batch_size);
        let default_cost = parse_or(read("QUEUE_DEFAULT_COST"), defaults.default_cost);
        let reclaim_after =
            parse_opt::<u64>(read("QUEUE_RECLAIM_AFTER_SECS")).map(Duration::from_secs);

        Self {
            rate_capacity,
            refill_window: secs_f64(refill_window),
            poll_interval: secs_f64(poll_interval),
            max_attempts,
            retry_backoff: Duration::from_secs(retry_backoff),
            batch_size,
            default_cost,
            reclaim_after,
        }
    }

    /// Reject values the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate_capacity.is_finite() && self.rate_capacity > 0.0) {
            return Err(invalid("rate_capacity", "must be a positive number"));
        }
        if self.refill_window.is_zero() {
            return Err(invalid("refill_window", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.retry_backoff.is_zero() {
            return Err(invalid("retry_backoff", "must be greater than zero"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if !(self.default_cost.is_finite() && self.default_cost > 0.0) {
            return Err(invalid("default_cost", "must be a positive number"));
        }
        Ok(())
    }

    /// Units restored per second.
    pub fn refill_rate(&self) -> f64 {
        self.rate_capacity / self.refill_window.as_secs_f64()
    }
}

/// Parse a `(key, raw)` pair, warning and returning `None` when unusable.
fn parse_opt<T: std::str::FromStr>(entry: Option<(String, String)>) -> Option<T> {
    let (key, raw) = entry?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}

fn parse_or<T: std::str::FromStr>(entry: Option<(String, String)>, default: T) -> T {
    parse_opt(entry).unwrap_or(default)
}

fn secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
