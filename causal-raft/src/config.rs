//! Runtime configuration of a cluster member.

use std::sync::Arc;
use std::time::Duration;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout base, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT: u64 = 500;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 100;
/// Default delay used to coalesce appends into one outbound batch, in
/// milliseconds.
pub const DEFAULT_APPEND_BATCH_DELAY: u64 = 5;
/// Default maximum number of entries per AppendEntries payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default number of applied entries between durable state flushes.
pub const DEFAULT_FLUSH_INTERVAL: u64 = 1000;

/// The runtime configuration for a cluster member.
///
/// Obtained via [`Config::build`], which returns a builder; `validate` on
/// the builder produces the final config or a [`ConfigError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The name of the cluster this member belongs to, used in logging.
    pub cluster_name: String,
    /// The base election timeout, in milliseconds.
    ///
    /// The effective timeout is randomized uniformly in `[base, base * 2]`
    /// each time the election timer is armed.
    pub election_timeout: u64,
    /// The leader heartbeat interval, in milliseconds.
    pub heartbeat_interval: u64,
    /// How long newly appended entries are held back so several appends
    /// coalesce into one replication batch, in milliseconds.
    pub append_batch_delay: u64,
    /// The maximum number of entries in one AppendEntries payload.
    pub max_payload_entries: u64,
    /// When a follower trails the append index by more than this many
    /// entries its replication stream leaves line-rate mode.
    pub replication_lag_threshold: u64,
    /// Number of entries applied between durable flushes of the state
    /// machines. Each flush advances the log prune horizon.
    pub flush_interval: u64,
    /// Entries retained in the log below the last flushed index, so that
    /// slightly lagging followers can still be served without catch-up.
    pub log_prune_keep: u64,
    /// Whether the in-flight entry cache is enabled.
    pub in_flight_cache_enabled: bool,
    /// Maximum total content bytes held by the in-flight cache.
    pub in_flight_cache_max_bytes: u64,
    /// Maximum number of entries held by the in-flight cache.
    pub in_flight_cache_max_entries: u64,
    /// Base delay for replicator retries, in milliseconds.
    pub replication_retry_base: u64,
    /// Upper bound on the replicator retry delay, in milliseconds.
    pub replication_retry_upper: u64,
    /// Maximum replicator attempts before giving up with a failure.
    pub replication_max_retries: u32,
    /// Base delay for transport reconnect attempts, in milliseconds.
    pub reconnect_backoff_base: u64,
    /// Upper bound on the transport reconnect delay, in milliseconds.
    pub reconnect_backoff_upper: u64,
    /// Total time budget for one catch-up run, in milliseconds.
    pub catchup_max_total_time: u64,
    /// Base delay between catch-up attempts, in milliseconds.
    pub catchup_backoff_base: u64,
    /// Upper bound on the catch-up retry delay, in milliseconds.
    pub catchup_backoff_upper: u64,
    /// Size of one streamed store-copy file chunk, in bytes.
    pub catchup_chunk_size: u64,
    /// Maximum transactions in one TxPull response batch.
    pub catchup_tx_batch: u64,
}

impl Config {
    /// Start a builder seeded with defaults.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout: None,
            heartbeat_interval: None,
            append_batch_delay: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            flush_interval: None,
            log_prune_keep: None,
            in_flight_cache_enabled: None,
            in_flight_cache_max_bytes: None,
            in_flight_cache_max_entries: None,
            replication_retry_base: None,
            replication_retry_upper: None,
            replication_max_retries: None,
            reconnect_backoff_base: None,
            reconnect_backoff_upper: None,
            catchup_max_total_time: None,
            catchup_backoff_base: None,
            catchup_backoff_upper: None,
            catchup_chunk_size: None,
            catchup_tx_batch: None,
        }
    }

    /// Generate a new election timeout, uniformly random in
    /// `[election_timeout, election_timeout * 2]`.
    pub fn new_rand_election_timeout(&self) -> Duration {
        let ms = thread_rng().gen_range(self.election_timeout..=self.election_timeout * 2);
        Duration::from_millis(ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn append_batch_delay(&self) -> Duration {
        Duration::from_millis(self.append_batch_delay)
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    append_batch_delay: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    flush_interval: Option<u64>,
    log_prune_keep: Option<u64>,
    in_flight_cache_enabled: Option<bool>,
    in_flight_cache_max_bytes: Option<u64>,
    in_flight_cache_max_entries: Option<u64>,
    replication_retry_base: Option<u64>,
    replication_retry_upper: Option<u64>,
    replication_max_retries: Option<u32>,
    reconnect_backoff_base: Option<u64>,
    reconnect_backoff_upper: Option<u64>,
    catchup_max_total_time: Option<u64>,
    catchup_backoff_base: Option<u64>,
    catchup_backoff_upper: Option<u64>,
    catchup_chunk_size: Option<u64>,
    catchup_tx_batch: Option<u64>,
}

impl ConfigBuilder {
    pub fn election_timeout(mut self, ms: u64) -> Self {
        self.election_timeout = Some(ms);
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval = Some(ms);
        self
    }

    pub fn append_batch_delay(mut self, ms: u64) -> Self {
        self.append_batch_delay = Some(ms);
        self
    }

    pub fn max_payload_entries(mut self, n: u64) -> Self {
        self.max_payload_entries = Some(n);
        self
    }

    pub fn replication_lag_threshold(mut self, n: u64) -> Self {
        self.replication_lag_threshold = Some(n);
        self
    }

    pub fn flush_interval(mut self, n: u64) -> Self {
        self.flush_interval = Some(n);
        self
    }

    pub fn log_prune_keep(mut self, n: u64) -> Self {
        self.log_prune_keep = Some(n);
        self
    }

    pub fn in_flight_cache_enabled(mut self, enabled: bool) -> Self {
        self.in_flight_cache_enabled = Some(enabled);
        self
    }

    pub fn in_flight_cache_max_bytes(mut self, bytes: u64) -> Self {
        self.in_flight_cache_max_bytes = Some(bytes);
        self
    }

    pub fn in_flight_cache_max_entries(mut self, n: u64) -> Self {
        self.in_flight_cache_max_entries = Some(n);
        self
    }

    pub fn replication_retry(mut self, base_ms: u64, upper_ms: u64, max_retries: u32) -> Self {
        self.replication_retry_base = Some(base_ms);
        self.replication_retry_upper = Some(upper_ms);
        self.replication_max_retries = Some(max_retries);
        self
    }

    pub fn reconnect_backoff(mut self, base_ms: u64, upper_ms: u64) -> Self {
        self.reconnect_backoff_base = Some(base_ms);
        self.reconnect_backoff_upper = Some(upper_ms);
        self
    }

    pub fn catchup_max_total_time(mut self, ms: u64) -> Self {
        self.catchup_max_total_time = Some(ms);
        self
    }

    pub fn catchup_backoff(mut self, base_ms: u64, upper_ms: u64) -> Self {
        self.catchup_backoff_base = Some(base_ms);
        self.catchup_backoff_upper = Some(upper_ms);
        self
    }

    /// Validate the builder, producing the final configuration.
    pub fn validate(self) -> Result<Arc<Config>, ConfigError> {
        let election_timeout = self.election_timeout.unwrap_or(DEFAULT_ELECTION_TIMEOUT);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if election_timeout < heartbeat_interval * 2 {
            return Err(ConfigError::ElectionTimeoutTooSmall);
        }

        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }

        let replication_retry_base = self.replication_retry_base.unwrap_or(50);
        let replication_retry_upper = self.replication_retry_upper.unwrap_or(5_000);
        let reconnect_backoff_base = self.reconnect_backoff_base.unwrap_or(100);
        let reconnect_backoff_upper = self.reconnect_backoff_upper.unwrap_or(30_000);
        let catchup_backoff_base = self.catchup_backoff_base.unwrap_or(250);
        let catchup_backoff_upper = self.catchup_backoff_upper.unwrap_or(10_000);
        if replication_retry_upper < replication_retry_base
            || reconnect_backoff_upper < reconnect_backoff_base
            || catchup_backoff_upper < catchup_backoff_base
        {
            return Err(ConfigError::InvalidBackoff);
        }

        let in_flight_cache_enabled = self.in_flight_cache_enabled.unwrap_or(true);
        let in_flight_cache_max_bytes = self.in_flight_cache_max_bytes.unwrap_or(2 * 1024 * 1024);
        let in_flight_cache_max_entries = self.in_flight_cache_max_entries.unwrap_or(1024);
        if in_flight_cache_enabled && (in_flight_cache_max_bytes == 0 || in_flight_cache_max_entries == 0) {
            return Err(ConfigError::InvalidCacheBounds);
        }

        Ok(Arc::new(Config {
            cluster_name: self.cluster_name,
            election_timeout,
            heartbeat_interval,
            append_batch_delay: self.append_batch_delay.unwrap_or(DEFAULT_APPEND_BATCH_DELAY),
            max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(1000),
            flush_interval: self.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL),
            log_prune_keep: self.log_prune_keep.unwrap_or(256),
            in_flight_cache_enabled,
            in_flight_cache_max_bytes,
            in_flight_cache_max_entries,
            replication_retry_base,
            replication_retry_upper,
            replication_max_retries: self.replication_max_retries.unwrap_or(10),
            reconnect_backoff_base,
            reconnect_backoff_upper,
            catchup_max_total_time: self.catchup_max_total_time.unwrap_or(600_000),
            catchup_backoff_base,
            catchup_backoff_upper,
            catchup_chunk_size: self.catchup_chunk_size.unwrap_or(32 * 1024),
            catchup_tx_batch: self.catchup_tx_batch.unwrap_or(64),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.election_timeout, DEFAULT_ELECTION_TIMEOUT);
        assert!(config.in_flight_cache_enabled);
    }

    #[test]
    fn election_timeout_must_cover_heartbeats() {
        let res = Config::build("test".into())
            .election_timeout(100)
            .heartbeat_interval(90)
            .validate();
        assert!(matches!(res, Err(ConfigError::ElectionTimeoutTooSmall)));
    }

    #[test]
    fn rand_election_timeout_is_within_range() {
        let config = Config::build("test".into()).validate().unwrap();
        for _ in 0..1000 {
            let t = config.new_rand_election_timeout().as_millis() as u64;
            assert!(t >= config.election_timeout);
            assert!(t <= config.election_timeout * 2);
        }
    }

    #[test]
    fn zero_cache_bounds_are_rejected_when_enabled() {
        let res = Config::build("test".into())
            .in_flight_cache_enabled(true)
            .in_flight_cache_max_bytes(0)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidCacheBounds)));
    }
}
