//! Configuration read from the environment
//!
//! Every knob comes from an environment variable; `.env` files are
//! honored in development via `dotenvy` before the first read.

use secrecy::SecretString;
use std::env;
use std::time::Duration;

/// Top-level configuration for the relay
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub cron: CronConfig,
    pub pod: PodIdentity,
}

/// HTTP surface configuration (the API itself lives outside the core)
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub api_key: Option<SecretString>,
}

/// Connection strings for the two databases
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Primary mailstack database
    pub mailstack_dsn: String,
    /// Legacy database, reached only by scheduled jobs
    pub legacy_dsn: Option<String>,
    pub max_connections: u32,
}

/// Object storage credentials for attachment bytes
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub access_key: Option<SecretString>,
    pub secret_key: Option<SecretString>,
}

/// Tuning for the mailbox supervisors and folder synchronizers
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Dial + login deadline
    pub connect_timeout: Duration,
    /// Request/response command deadline
    pub command_timeout: Duration,
    /// Streamed fetch deadline per batch
    pub fetch_timeout: Duration,
    /// Polling cadence when the server lacks IDLE
    pub poll_interval: Duration,
    /// Re-issue IDLE before the server would drop us
    pub idle_logout_timeout: Duration,
    /// Cycle IDLE proactively
    pub idle_poll_interval: Duration,
    /// NOOP keepalive while tailing without server activity
    pub keepalive_interval: Duration,
    /// Force reconnect when the tail sees nothing for this long
    pub stale_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(30),
            idle_logout_timeout: Duration::from_secs(25 * 60),
            idle_poll_interval: Duration::from_secs(20 * 60),
            keepalive_interval: Duration::from_secs(4 * 60),
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Cron expressions for the scheduled jobs, 6 fields with seconds
#[derive(Debug, Clone)]
pub struct CronConfig {
    pub heartbeat: String,
    pub reputation: String,
    pub scheduled_send: String,
    pub orphan_cleanup: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            heartbeat: "0 * * * * *".to_string(),
            reputation: "0 0 3 * * *".to_string(),
            scheduled_send: "*/30 * * * * *".to_string(),
            orphan_cleanup: "0 0 4 * * *".to_string(),
        }
    }
}

/// Pod identity used as the lease holder id in leader election
#[derive(Debug, Clone, Default)]
pub struct PodIdentity {
    pub name: Option<String>,
    pub namespace: Option<String>,
}

impl PodIdentity {
    /// Inside a cluster both fields are injected by the downward API
    pub fn in_cluster(&self) -> bool {
        self.name.is_some() && self.namespace.is_some()
    }
}

impl Config {
    /// Load the full configuration from the environment
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let mailstack_dsn = env::var("MAILSTACK_DATABASE_URL")
            .map_err(|_| "MAILSTACK_DATABASE_URL is required".to_string())?;

        Ok(Self {
            http: HttpConfig {
                port: read_parsed("HTTP_PORT").unwrap_or(8080),
                api_key: read_secret("API_KEY"),
            },
            database: DatabaseConfig {
                mailstack_dsn,
                legacy_dsn: read("LEGACY_DATABASE_URL"),
                max_connections: read_parsed("DATABASE_MAX_CONNECTIONS").unwrap_or(10),
            },
            storage: StorageConfig {
                bucket: read("STORAGE_BUCKET").unwrap_or_default(),
                region: read("STORAGE_REGION").unwrap_or_default(),
                access_key: read_secret("STORAGE_ACCESS_KEY"),
                secret_key: read_secret("STORAGE_SECRET_KEY"),
            },
            sync: SyncConfig::default(),
            cron: CronConfig {
                heartbeat: read("CRON_SCHEDULE_HEARTBEAT")
                    .unwrap_or_else(|| CronConfig::default().heartbeat),
                reputation: read("CRON_SCHEDULE_MAILSTACK_REPUTATION")
                    .unwrap_or_else(|| CronConfig::default().reputation),
                scheduled_send: read("CRON_SCHEDULE_SCHEDULED_SEND")
                    .unwrap_or_else(|| CronConfig::default().scheduled_send),
                orphan_cleanup: read("CRON_SCHEDULE_ORPHAN_CLEANUP")
                    .unwrap_or_else(|| CronConfig::default().orphan_cleanup),
            },
            pod: PodIdentity {
                name: read("POD_NAME"),
                namespace: read("POD_NAMESPACE"),
            },
        })
    }
}

fn read(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn read_secret(key: &str) -> Option<SecretString> {
    read(key).map(SecretString::new)
}

fn read_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    read(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_defaults_match_protocol_deadlines() {
        let sync = SyncConfig::default();
        assert_eq!(sync.connect_timeout, Duration::from_secs(30));
        assert_eq!(sync.fetch_timeout, Duration::from_secs(60));
        assert_eq!(sync.poll_interval, Duration::from_secs(30));
        assert_eq!(sync.idle_logout_timeout, Duration::from_secs(1500));
        assert_eq!(sync.idle_poll_interval, Duration::from_secs(1200));
        assert_eq!(sync.stale_after, Duration::from_secs(1800));
    }

    #[test]
    fn test_pod_identity_detection() {
        let outside = PodIdentity::default();
        assert!(!outside.in_cluster());

        let inside = PodIdentity {
            name: Some("mailstack-0".into()),
            namespace: Some("prod".into()),
        };
        assert!(inside.in_cluster());
    }

    #[test]
    fn test_cron_defaults_have_six_fields() {
        let cron = CronConfig::default();
        for expr in [
            &cron.heartbeat,
            &cron.reputation,
            &cron.scheduled_send,
            &cron.orphan_cleanup,
        ] {
            assert_eq!(expr.split_whitespace().count(), 6, "{}", expr);
        }
    }
}
