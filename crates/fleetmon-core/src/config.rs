//! Engine settings, read from environment variables with defaults.

use std::time::Duration;

use chrono_tz::Tz;

/// Error type for settings parsing.
#[derive(Debug)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    Invalid { var: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => {
                write!(f, "invalid value for {}: {:?}", var, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Collector engine settings.
///
/// Every knob has a default; `from_env()` overrides from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Minimum reported elapsed time for an operation to be tracked.
    pub slow_threshold_secs: i64,
    /// Interval between process-list polls of one instance.
    pub tick_interval: Duration,
    /// Interval between directory reconciliation passes.
    pub reconcile_interval: Duration,
    /// Interval between disk-status snapshots.
    pub disk_status_interval: Duration,
    /// Local wall-clock time of the daily command-status snapshot.
    pub command_status_hour: u32,
    pub command_status_minute: u32,
    /// Timezone the daily schedule is evaluated in.
    pub timezone: Tz,
    /// Upper bound on any single query against an instance.
    pub query_timeout: Duration,
    /// Delay before restarting a crashed collector loop.
    pub restart_backoff: Duration,
    /// Connections per instance pool.
    pub pool_size: u32,
    /// Document store connection.
    pub mongo_uri: String,
    pub mongo_db: String,
    /// Collection names.
    pub instance_collection: String,
    pub slow_log_collection: String,
    pub com_status_collection: String,
    pub disk_usage_collection: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            slow_threshold_secs: 2,
            tick_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(300),
            disk_status_interval: Duration::from_secs(900),
            command_status_hour: 9,
            command_status_minute: 0,
            timezone: chrono_tz::Asia::Seoul,
            query_timeout: Duration::from_secs(10),
            restart_backoff: Duration::from_secs(5),
            pool_size: 1,
            mongo_uri: "mongodb://localhost:27017".to_string(),
            mongo_db: "mgmt_db".to_string(),
            instance_collection: "mysql_slow_query_instance".to_string(),
            slow_log_collection: "mysql_slow_queries".to_string(),
            com_status_collection: "mysql_com_status".to_string(),
            disk_usage_collection: "mysql_disk_usage".to_string(),
        }
    }
}

impl Settings {
    /// Builds settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut s = Self::default();

        if let Some(v) = env_parse::<i64>("FLEETMON_SLOW_THRESHOLD_SECS")? {
            s.slow_threshold_secs = v;
        }
        if let Some(v) = env_parse::<u64>("FLEETMON_TICK_INTERVAL_SECS")? {
            s.tick_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("FLEETMON_RECONCILE_INTERVAL_SECS")? {
            s.reconcile_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("FLEETMON_DISK_STATUS_INTERVAL_SECS")? {
            s.disk_status_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("FLEETMON_COMMAND_STATUS_HOUR")? {
            s.command_status_hour = v.min(23);
        }
        if let Some(v) = env_parse::<u32>("FLEETMON_COMMAND_STATUS_MINUTE")? {
            s.command_status_minute = v.min(59);
        }
        if let Ok(v) = std::env::var("FLEETMON_TIMEZONE") {
            s.timezone = v.parse().map_err(|_| ConfigError::Invalid {
                var: "FLEETMON_TIMEZONE".to_string(),
                value: v,
            })?;
        }
        if let Some(v) = env_parse::<u64>("FLEETMON_QUERY_TIMEOUT_SECS")? {
            s.query_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("FLEETMON_RESTART_BACKOFF_SECS")? {
            s.restart_backoff = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("FLEETMON_POOL_SIZE")? {
            s.pool_size = v.max(1);
        }

        if let Ok(v) = std::env::var("MONGODB_URI") {
            s.mongo_uri = v;
        }
        if let Ok(v) = std::env::var("MONGODB_DB_NAME") {
            s.mongo_db = v;
        }
        if let Ok(v) = std::env::var("MONGO_INSTANCE_COLLECTION") {
            s.instance_collection = v;
        }
        if let Ok(v) = std::env::var("MONGO_SLOW_LOG_COLLECTION") {
            s.slow_log_collection = v;
        }
        if let Ok(v) = std::env::var("MONGO_COM_STATUS_COLLECTION") {
            s.com_status_collection = v;
        }
        if let Ok(v) = std::env::var("MONGO_DISK_USAGE_COLLECTION") {
            s.disk_usage_collection = v;
        }

        Ok(s)
    }
}

/// Reads and parses an optional environment variable.
fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.slow_threshold_secs, 2);
        assert_eq!(s.tick_interval, Duration::from_secs(1));
        assert_eq!(s.reconcile_interval, Duration::from_secs(300));
        assert_eq!(s.timezone, chrono_tz::Asia::Seoul);
        assert_eq!(s.slow_log_collection, "mysql_slow_queries");
    }
}
