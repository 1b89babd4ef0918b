/// Configuration management for the Aurora relay
use crate::error::{RelayError, RelayResult};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Hosts under this suffix get the long partner timeout and the bypass header
pub const DEFAULT_PARTNER_HOST_SUFFIX: &str = ".bsky.network";

/// Handle lookups under this suffix carry the bypass header
pub const DEFAULT_HANDLE_BYPASS_SUFFIX: &str = ".bsky.social";

/// Command line and environment options for the relay daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "aurora-relay", version, about = "ATProto relay (Big Graph Service)")]
pub struct Cli {
    /// Database connection URL for relay metadata
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/relay/relay.sqlite")]
    pub db_url: String,

    /// Directory for relay state
    #[arg(long, env = "RELAY_DATA_DIR", default_value = "data/relay")]
    pub data_dir: PathBuf,

    /// PLC directory used to resolve did:plc identities
    #[arg(long, env = "ATP_PLC_HOST", default_value = "https://plc.directory")]
    pub plc_host: String,

    /// Use plain ws:// and http:// when talking to sources
    #[arg(long, env = "RELAY_CRAWL_INSECURE_WS", default_value_t = false)]
    pub crawl_insecure_ws: bool,

    /// Discover new sources from repository references
    #[arg(long, env = "RELAY_SPIDERING", default_value_t = false)]
    pub spidering: bool,

    /// Public API listen address
    #[arg(long, env = "RELAY_API_LISTEN", default_value = "0.0.0.0:2470")]
    pub api_listen: String,

    /// Prometheus metrics listen address
    #[arg(long, env = "RELAY_METRICS_LISTEN", default_value = "0.0.0.0:2471")]
    pub metrics_listen: String,

    /// Store the event log in segment files under this directory instead of the database
    #[arg(long, env = "RELAY_PERSISTER_DIR")]
    pub disk_persister_dir: Option<PathBuf>,

    /// Bearer token for the admin API; admin routes are disabled when unset
    #[arg(long, env = "RELAY_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Resolve handles only through these hosts (comma separated)
    #[arg(long, env = "HANDLE_RESOLVER_HOSTS", value_delimiter = ',')]
    pub handle_resolver_hosts: Vec<String>,

    /// Maximum metadata database connections
    #[arg(long, env = "MAX_METADB_CONNECTIONS", default_value_t = 40)]
    pub max_metadb_connections: u32,

    /// Interval between repository compaction runs, 0 disables
    #[arg(long, env = "RELAY_COMPACT_INTERVAL", default_value = "4h")]
    pub compact_interval: humantime::Duration,

    /// Interval between event log retention passes
    #[arg(long, env = "RELAY_EVENT_TRIM_INTERVAL", default_value = "10m")]
    pub event_trim_interval: humantime::Duration,

    /// Maximum repository fetches in flight across all sources
    #[arg(long, env = "MAX_FETCH_CONCURRENCY", default_value_t = 100)]
    pub max_fetch_concurrency: usize,

    /// Deployment environment label
    #[arg(long, env = "ENVIRONMENT", default_value = "dev")]
    pub env: String,

    /// Value for the x-ratelimit-bypass header sent to partner hosts
    #[arg(long, env = "RELAY_RATE_LIMIT_BYPASS")]
    pub rate_limit_bypass: Option<String>,

    /// Host suffix that receives partner crawl settings
    #[arg(long, env = "RELAY_PARTNER_HOST_SUFFIX", default_value = DEFAULT_PARTNER_HOST_SUFFIX)]
    pub partner_host_suffix: String,

    /// Handle suffix that receives the bypass header during handle resolution
    #[arg(long, env = "RELAY_HANDLE_BYPASS_SUFFIX", default_value = DEFAULT_HANDLE_BYPASS_SUFFIX)]
    pub handle_bypass_suffix: String,

    /// Maximum fetches per repository per hour
    #[arg(long, env = "RELAY_DEFAULT_REPO_LIMIT", default_value_t = 100)]
    pub default_repo_limit: u32,

    /// Concurrent crawl tasks per source
    #[arg(long, env = "RELAY_CONCURRENCY_PER_PDS", default_value_t = 100)]
    pub concurrency_per_pds: usize,

    /// Pending crawl tasks per source before announcements are rejected
    #[arg(long, env = "RELAY_MAX_QUEUE_PER_PDS", default_value_t = 1000)]
    pub max_queue_per_pds: usize,

    /// Attempts per crawl task before a transient failure is given up on
    #[arg(long, env = "RELAY_MAX_CRAWL_ATTEMPTS", default_value_t = 3)]
    pub max_crawl_attempts: u32,

    /// Base delay before retrying a transiently failed crawl
    #[arg(long, env = "RELAY_CRAWL_RETRY_BACKOFF", default_value = "2s")]
    pub crawl_retry_backoff: humantime::Duration,

    /// Maximum DID documents kept in memory
    #[arg(long, env = "RELAY_DID_CACHE_SIZE", default_value_t = 5_000_000)]
    pub did_cache_size: usize,

    /// How long a resolved DID document stays fresh
    #[arg(long, env = "RELAY_DID_CACHE_TTL", default_value = "24h")]
    pub did_cache_ttl: humantime::Duration,

    /// Maximum handles kept in memory
    #[arg(long, env = "RELAY_HANDLE_CACHE_SIZE", default_value_t = 100_000)]
    pub handle_cache_size: usize,

    /// How long a resolved handle stays fresh
    #[arg(long, env = "RELAY_HANDLE_CACHE_TTL", default_value = "1h")]
    pub handle_cache_ttl: humantime::Duration,

    /// How long events stay replayable in the disk event log
    #[arg(long, env = "RELAY_EVENT_PLAYBACK_TTL", default_value = "72h")]
    pub event_playback_ttl: humantime::Duration,

    /// Events per disk log segment
    #[arg(long, env = "RELAY_EVENTS_PER_SEGMENT", default_value_t = 10_000)]
    pub events_per_segment: usize,

    /// Per-subscriber buffered events before the subscriber is dropped
    #[arg(long, env = "RELAY_SUBSCRIBER_BUFFER", default_value_t = 1024)]
    pub subscriber_buffer: usize,

    /// Events read per replay page
    #[arg(long, env = "RELAY_PLAYBACK_BATCH", default_value_t = 500)]
    pub playback_batch: usize,

    /// How long shutdown waits for in-flight crawl tasks
    #[arg(long, env = "RELAY_SHUTDOWN_DRAIN_TIMEOUT", default_value = "30s")]
    pub shutdown_drain_timeout: humantime::Duration,

    /// Emit logs as JSON
    #[arg(long, env = "RELAY_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// Main relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub identity: IdentityConfig,
    pub crawl: CrawlConfig,
    pub firehose: FirehoseConfig,
    pub maintenance: MaintenanceConfig,
}

/// Listener and admin configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_listen: String,
    pub metrics_listen: String,
    pub admin_key: Option<String>,
    pub environment: String,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_url: String,
    pub data_directory: PathBuf,
    pub max_connections: u32,
    pub event_log: EventLogConfig,
}

/// Event log backend selection
#[derive(Debug, Clone)]
pub enum EventLogConfig {
    /// Rows in the metadata database
    Database,
    /// Append-only segment files
    Disk {
        directory: PathBuf,
        retention: Duration,
        events_per_segment: usize,
    },
}

/// Identity resolution configuration
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub plc_host: String,
    pub insecure_did_web: bool,
    pub did_cache_size: usize,
    pub did_cache_ttl: Duration,
    pub handle_cache_size: usize,
    pub handle_cache_ttl: Duration,
    pub handle_resolver_hosts: Vec<String>,
    pub handle_bypass_suffix: String,
    pub rate_limit_bypass: Option<String>,
}

/// Crawl scheduling configuration
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub ssl: bool,
    pub spidering: bool,
    pub concurrency_per_source: usize,
    pub max_queue_per_source: usize,
    pub max_fetch_concurrency: usize,
    pub default_repo_limit: u32,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub drain_timeout: Duration,
    pub partner_host_suffix: String,
    pub rate_limit_bypass: Option<String>,
}

/// Firehose fanout configuration
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    pub subscriber_buffer: usize,
    pub playback_batch: usize,
}

/// Periodic maintenance configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Zero disables scheduled compaction
    pub compact_interval: Duration,
    pub event_trim_interval: Duration,
}

impl RelayConfig {
    /// Fold the flat command line into the nested configuration
    pub fn from_cli(cli: Cli) -> Self {
        let event_log = match cli.disk_persister_dir {
            Some(directory) => EventLogConfig::Disk {
                directory,
                retention: cli.event_playback_ttl.into(),
                events_per_segment: cli.events_per_segment,
            },
            None => EventLogConfig::Database,
        };

        Self {
            service: ServiceConfig {
                api_listen: cli.api_listen,
                metrics_listen: cli.metrics_listen,
                admin_key: cli.admin_key.filter(|k| !k.is_empty()),
                environment: cli.env,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            storage: StorageConfig {
                db_url: cli.db_url,
                data_directory: cli.data_dir,
                max_connections: cli.max_metadb_connections,
                event_log,
            },
            identity: IdentityConfig {
                plc_host: cli.plc_host,
                insecure_did_web: cli.crawl_insecure_ws,
                did_cache_size: cli.did_cache_size,
                did_cache_ttl: cli.did_cache_ttl.into(),
                handle_cache_size: cli.handle_cache_size,
                handle_cache_ttl: cli.handle_cache_ttl.into(),
                handle_resolver_hosts: cli
                    .handle_resolver_hosts
                    .into_iter()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect(),
                handle_bypass_suffix: cli.handle_bypass_suffix,
                rate_limit_bypass: cli.rate_limit_bypass.clone(),
            },
            crawl: CrawlConfig {
                ssl: !cli.crawl_insecure_ws,
                spidering: cli.spidering,
                concurrency_per_source: cli.concurrency_per_pds,
                max_queue_per_source: cli.max_queue_per_pds,
                max_fetch_concurrency: cli.max_fetch_concurrency,
                default_repo_limit: cli.default_repo_limit,
                max_attempts: cli.max_crawl_attempts,
                retry_backoff: cli.crawl_retry_backoff.into(),
                drain_timeout: cli.shutdown_drain_timeout.into(),
                partner_host_suffix: cli.partner_host_suffix,
                rate_limit_bypass: cli.rate_limit_bypass,
            },
            firehose: FirehoseConfig {
                subscriber_buffer: cli.subscriber_buffer,
                playback_batch: cli.playback_batch,
            },
            maintenance: MaintenanceConfig {
                compact_interval: cli.compact_interval.into(),
                event_trim_interval: cli.event_trim_interval.into(),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> RelayResult<()> {
        if self.crawl.concurrency_per_source == 0 {
            return Err(RelayError::Validation(
                "concurrency-per-pds must be at least 1".to_string(),
            ));
        }

        if self.crawl.max_queue_per_source == 0 {
            return Err(RelayError::Validation(
                "max-queue-per-pds must be at least 1".to_string(),
            ));
        }

        if self.crawl.max_fetch_concurrency == 0 {
            return Err(RelayError::Validation(
                "max-fetch-concurrency must be at least 1".to_string(),
            ));
        }

        if self.crawl.max_attempts == 0 {
            return Err(RelayError::Validation(
                "max-crawl-attempts must be at least 1".to_string(),
            ));
        }

        if self.firehose.subscriber_buffer == 0 || self.firehose.playback_batch == 0 {
            return Err(RelayError::Validation(
                "subscriber buffer and playback batch must be non-zero".to_string(),
            ));
        }

        if let EventLogConfig::Disk {
            events_per_segment, ..
        } = &self.storage.event_log
        {
            if *events_per_segment == 0 {
                return Err(RelayError::Validation(
                    "events-per-segment must be at least 1".to_string(),
                ));
            }
        }

        if self.maintenance.event_trim_interval.is_zero() {
            return Err(RelayError::Validation(
                "event-trim-interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_cli(Cli::parse_from(["aurora-relay"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_daemon() {
        let cli = Cli::try_parse_from(["aurora-relay"]).unwrap();
        assert_eq!(cli.concurrency_per_pds, 100);
        assert_eq!(cli.max_queue_per_pds, 1000);
        assert_eq!(cli.did_cache_size, 5_000_000);
        assert_eq!(cli.max_fetch_concurrency, 100);
        assert_eq!(cli.default_repo_limit, 100);
        assert_eq!(
            Duration::from(cli.compact_interval),
            Duration::from_secs(4 * 3600)
        );
        assert_eq!(
            Duration::from(cli.event_playback_ttl),
            Duration::from_secs(72 * 3600)
        );
    }

    #[test]
    fn test_disk_persister_selection() {
        let cli = Cli::try_parse_from([
            "aurora-relay",
            "--disk-persister-dir",
            "/tmp/relay-events",
            "--event-playback-ttl",
            "2h",
        ])
        .unwrap();
        let config = RelayConfig::from_cli(cli);
        match config.storage.event_log {
            EventLogConfig::Disk {
                directory,
                retention,
                ..
            } => {
                assert_eq!(directory, PathBuf::from("/tmp/relay-events"));
                assert_eq!(retention, Duration::from_secs(7200));
            }
            EventLogConfig::Database => panic!("expected disk event log"),
        }
    }

    #[test]
    fn test_compact_interval_zero_disables() {
        let cli =
            Cli::try_parse_from(["aurora-relay", "--compact-interval", "0s"]).unwrap();
        let config = RelayConfig::from_cli(cli);
        assert!(config.maintenance.compact_interval.is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_handle_resolver_hosts_split() {
        let cli = Cli::try_parse_from([
            "aurora-relay",
            "--handle-resolver-hosts",
            "http://pds-a.test, http://pds-b.test",
        ])
        .unwrap();
        let config = RelayConfig::from_cli(cli);
        assert_eq!(
            config.identity.handle_resolver_hosts,
            vec!["http://pds-a.test", "http://pds-b.test"]
        );
    }

    #[test]
    fn test_insecure_ws_disables_ssl() {
        let cli = Cli::try_parse_from(["aurora-relay", "--crawl-insecure-ws"]).unwrap();
        let config = RelayConfig::from_cli(cli);
        assert!(!config.crawl.ssl);
        assert!(config.identity.insecure_did_web);
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = RelayConfig::default();
        config.crawl.max_queue_per_source = 0;
        assert!(config.validate().is_err());
    }
}
