use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::core::registry::{ComponentDescriptor, Registry};
use crate::core::retry::RetryPolicy;
use crate::error::{DrError, DrResult};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/drsentinel/config.toml";

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("name pattern is a valid regex")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local backup directory; one subdirectory per environment.
    pub backup_root: PathBuf,
    /// SQLite database holding the restore journal and failover audit log.
    pub state_db: PathBuf,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub retention_days: u32,
    /// Age after which an environment lock file left by a dead process is ignored.
    pub lock_lease_secs: u64,
    pub environments: Vec<EnvironmentConfig>,
    pub components: Vec<ComponentDescriptor>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
    pub upload: UploadConfig,
    pub health: HealthConfig,
    pub timeouts: TimeoutConfig,
    pub failover: FailoverConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Cluster namespace the environment's workloads run in.
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// `kubectl` binary used for every cluster, database, and cache call.
    pub kubectl: String,
    /// kubeconfig context; the current context when unset.
    pub context: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".into(),
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Mount point of the durable off-site volume.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub passphrase_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl HealthConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, Duration::from_secs(self.interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub capture_secs: u64,
    pub restore_secs: u64,
    pub verify_secs: u64,
    pub transfer_secs: u64,
    pub probe_secs: u64,
    pub restart_secs: u64,
}

impl TimeoutConfig {
    pub fn capture(&self) -> Duration {
        Duration::from_secs(self.capture_secs)
    }

    pub fn restore(&self) -> Duration {
        Duration::from_secs(self.restore_secs)
    }

    pub fn verify(&self) -> Duration {
        Duration::from_secs(self.verify_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn restart(&self) -> Duration {
        Duration::from_secs(self.restart_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub dns_api_url: String,
    pub record_name: String,
    pub ttl_secs: u32,
    /// Resync data to the target before cutover when it is not already active.
    pub resync: bool,
    /// Skip the interactive confirmation. Only for automated test harnesses.
    pub test_harness: bool,
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub environment: String,
    /// Value the DNS record carries while this site is active.
    pub endpoint: String,
    pub health_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub slack_webhook: Option<String>,
    pub email: Option<EmailConfig>,
    #[serde(default = "default_notification_timeout")]
    pub timeout_secs: u64,
}

fn default_notification_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// HTTP mail relay accepting `{from, to, subject, text}` JSON.
    pub relay_url: String,
    pub from: String,
    pub to: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/lib/drsentinel/backups"),
            state_db: PathBuf::from("/var/lib/drsentinel/state.db"),
            simulation: false,
            verbose: false,
            json_logs: false,
            retention_days: 30,
            lock_lease_secs: 6 * 60 * 60,
            environments: vec![
                EnvironmentConfig {
                    name: "production".into(),
                    namespace: "rag-production".into(),
                },
                EnvironmentConfig {
                    name: "staging".into(),
                    namespace: "rag-staging".into(),
                },
                EnvironmentConfig {
                    name: "dr".into(),
                    namespace: "rag-dr".into(),
                },
            ],
            components: Registry::default_catalog(),
            cluster: ClusterConfig::default(),
            storage: StorageConfig {
                root: PathBuf::from("/mnt/offsite/drsentinel"),
            },
            encryption: EncryptionConfig {
                enabled: true,
                passphrase_file: Some(PathBuf::from("/etc/drsentinel/passphrase")),
            },
            upload: UploadConfig {
                max_attempts: 5,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 30_000,
            },
            health: HealthConfig {
                interval_secs: 10,
                max_attempts: 30,
            },
            timeouts: TimeoutConfig {
                capture_secs: 30 * 60,
                restore_secs: 60 * 60,
                verify_secs: 10 * 60,
                transfer_secs: 30 * 60,
                probe_secs: 10,
                restart_secs: 10 * 60,
            },
            failover: FailoverConfig {
                dns_api_url: "http://service-discovery.internal:8053".into(),
                record_name: "rag.example.internal".into(),
                ttl_secs: 60,
                resync: true,
                test_harness: false,
                sites: vec![
                    SiteConfig {
                        name: "primary".into(),
                        environment: "production".into(),
                        endpoint: "ingress.primary.example.internal".into(),
                        health_url: "https://ingress.primary.example.internal/healthz".into(),
                    },
                    SiteConfig {
                        name: "standby".into(),
                        environment: "dr".into(),
                        endpoint: "ingress.standby.example.internal".into(),
                        health_url: "https://ingress.standby.example.internal/healthz".into(),
                    },
                ],
            },
            notifications: NotificationConfig {
                slack_webhook: None,
                email: None,
                timeout_secs: default_notification_timeout(),
            },
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `DRSENTINEL_*` environment variables,
    /// and CLI overrides, in that order.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> DrResult<Self> {
        let path = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DRSENTINEL_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .map_err(|e| DrError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DrResult<()> {
        for env in &self.environments {
            validate_name("environment", &env.name)?;
        }
        for site in &self.failover.sites {
            validate_name("site", &site.name)?;
            if self.environment(&site.environment).is_err() {
                return Err(DrError::Config(format!(
                    "site '{}' references undeclared environment '{}'",
                    site.name, site.environment
                )));
            }
        }
        if self.upload.max_attempts == 0 {
            return Err(DrError::Config("upload.max_attempts must be at least 1".into()));
        }
        if self.health.max_attempts == 0 {
            return Err(DrError::Config("health.max_attempts must be at least 1".into()));
        }
        // Surfaces duplicate or malformed component names at load time.
        Registry::new(self.components.clone())?;
        Ok(())
    }

    pub fn environment(&self, name: &str) -> DrResult<&EnvironmentConfig> {
        self.environments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| DrError::Config(format!("environment '{name}' is not declared")))
    }

    pub fn site(&self, name: &str) -> DrResult<&SiteConfig> {
        self.failover
            .sites
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| DrError::Config(format!("site '{name}' is not declared")))
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

pub fn validate_name(what: &str, name: &str) -> DrResult<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(DrError::Config(format!(
            "{what} name '{name}' must be lowercase alphanumerics and dashes"
        )))
    }
}
