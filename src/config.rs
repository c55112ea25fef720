use std::{env, fmt::Display, str::FromStr, time::Duration};

use log::{info, warn};

pub const RAW_VOTES_TOPIC: &str = "raw-votes";
pub const POLL_UPDATES_TOPIC: &str = "poll-updates";
pub const AGGREGATOR_GROUP: &str = "poll-aggregator-group";
pub const DASHBOARD_GROUP: &str = "dashboard-consumer-group";
pub const POLL_STATS_EVENT: &str = "poll-stats";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub flush_interval: Duration,
    pub dedup_ttl: Duration,
    pub increment_timeout: Duration,
    pub log_partitions: usize,
    pub unhealthy_after: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "sqlite:poll_pulse.db".to_string(),
            redis_url: None,
            flush_interval: Duration::from_millis(2000),
            dedup_ttl: Duration::from_secs(3600),
            increment_timeout: Duration::from_millis(1000),
            log_partitions: 8,
            unhealthy_after: 3,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let defaults = Self::default();

        let log_partitions: usize = try_load("LOG_PARTITIONS", defaults.log_partitions)?;
        if log_partitions == 0 {
            return Err("LOG_PARTITIONS must be at least 1".to_string());
        }

        Ok(Self {
            port: try_load("PORT", defaults.port)?,
            database_url: try_load("DATABASE_URL", defaults.database_url)?,
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            flush_interval: Duration::from_millis(try_load("FLUSH_INTERVAL_MS", 2000u64)?),
            dedup_ttl: Duration::from_secs(try_load("DEDUP_TTL_SECS", 3600u64)?),
            increment_timeout: Duration::from_millis(try_load("INCREMENT_TIMEOUT_MS", 1000u64)?),
            log_partitions,
            unhealthy_after: try_load("UNHEALTHY_AFTER", defaults.unhealthy_after)?,
        })
    }
}

fn try_load<T>(key: &str, default: T) -> Result<T, String>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            warn!("Invalid {key} value {raw:?}: {e}");
            format!("Environment misconfigured: {key}")
        }),
        Err(_) => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let config = Config::default();
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.dedup_ttl, Duration::from_secs(3600));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn try_load_falls_back_to_default() {
        let value: u64 = try_load("POLL_PULSE_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
