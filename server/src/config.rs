use std::{collections::HashMap, env, str::FromStr, time::Duration};

use crate::{error::ConfigError, types::Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    Local,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers_per_topic: usize,
    pub max_attempts: i32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub batch_size: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers_per_topic: 2,
            max_attempts: 5,
            retry_base: Duration::from_millis(2_000),
            retry_max: Duration::from_millis(60_000),
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_millis(60_000),
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workers: usize,
    pub reaper_interval: Duration,
    pub budgets: HashMap<String, Duration>,
    pub default_budget: Duration,
    pub page_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut budgets = HashMap::new();
        budgets.insert("conversations".to_string(), Duration::from_secs(30 * 60));
        budgets.insert("messages".to_string(), Duration::from_secs(10 * 60));
        Self {
            workers: 1,
            reaper_interval: Duration::from_millis(30_000),
            budgets,
            default_budget: Duration::from_secs(15 * 60),
            page_limit: 200,
        }
    }
}

impl SyncConfig {
    pub fn budget_for(&self, job_type: &str) -> Duration {
        self.budgets
            .get(job_type)
            .copied()
            .unwrap_or(self.default_budget)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlatformCredentials {
    pub facebook_app_secret: String,
    pub facebook_verify_token: String,
    pub zalo_oa_secret_key: String,
    pub lazada_app_key: String,
    pub lazada_app_secret: String,
}

#[derive(Debug, Clone)]
pub struct ApiBases {
    pub zalo: String,
    pub facebook: String,
    pub lazada: String,
}

impl Default for ApiBases {
    fn default() -> Self {
        Self {
            zalo: "https://openapi.zalo.me".to_string(),
            facebook: "https://graph.facebook.com/v21.0".to_string(),
            lazada: "https://api.lazada.vn/rest".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub database_max_connections: u32,
    pub log_level: String,
    pub upstream_timeout: Duration,
    pub dedup_capacity: usize,
    pub single_socket_per_user: bool,
    pub fanout: FanoutMode,
    pub enabled_platforms: Vec<Platform>,
    pub credentials: PlatformCredentials,
    pub api_bases: ApiBases,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            store_backend: StoreBackend::Memory,
            database_url: String::new(),
            database_max_connections: 10,
            log_level: "info".to_string(),
            upstream_timeout: Duration::from_millis(10_000),
            dedup_capacity: 4096,
            single_socket_per_user: false,
            fanout: FanoutMode::Local,
            enabled_platforms: Platform::ALL.to_vec(),
            credentials: PlatformCredentials::default(),
            api_bases: ApiBases::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = AppConfig::default();
        let queue_defaults = QueueConfig::default();

        let store_backend = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    message: format!("expected postgres or memory, got '{other}'"),
                })
            }
        };
        let fanout = match get("REALTIME_FANOUT").as_deref() {
            None | Some("local") => FanoutMode::Local,
            Some("postgres") => FanoutMode::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "REALTIME_FANOUT",
                    message: format!("expected local or postgres, got '{other}'"),
                })
            }
        };
        if fanout == FanoutMode::Postgres && store_backend == StoreBackend::Memory {
            return Err(ConfigError::Invalid {
                key: "REALTIME_FANOUT",
                message: "postgres fan-out requires STORE_BACKEND=postgres".to_string(),
            });
        }

        let enabled_platforms = match get("ENABLED_PLATFORMS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| {
                    item.parse::<Platform>()
                        .map_err(|message| ConfigError::Invalid {
                            key: "ENABLED_PLATFORMS",
                            message,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.enabled_platforms.clone(),
        };

        let mut sync = SyncConfig::default();
        for job_type in ["conversations", "messages"] {
            let key = format!("SYNC_BUDGET_{}_SECS", job_type.to_ascii_uppercase());
            if let Some(raw) = get(key.as_str()) {
                let secs = raw.parse::<u64>().map_err(|err| ConfigError::Invalid {
                    key: "SYNC_BUDGET_<TYPE>_SECS",
                    message: format!("{key}: {err}"),
                })?;
                sync.budgets
                    .insert(job_type.to_string(), Duration::from_secs(secs));
            }
        }
        sync.reaper_interval = millis(&get, "SYNC_REAPER_INTERVAL_MS", sync.reaper_interval)?;
        sync.workers = parse_or(&get, "SYNC_WORKERS", sync.workers)?;

        let config = AppConfig {
            port: parse_or(&get, "PORT", defaults.port)?,
            store_backend,
            database_url: get("DATABASE_URL").unwrap_or_else(|| postgres_url_from_parts(&get)),
            database_max_connections: parse_or(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            upstream_timeout: millis(&get, "UPSTREAM_TIMEOUT_MS", defaults.upstream_timeout)?,
            dedup_capacity: parse_or(&get, "DEDUP_CAPACITY", defaults.dedup_capacity)?,
            single_socket_per_user: parse_or(&get, "REALTIME_SINGLE_SOCKET_PER_USER", false)?,
            fanout,
            enabled_platforms,
            credentials: PlatformCredentials {
                facebook_app_secret: get("FACEBOOK_APP_SECRET").unwrap_or_default(),
                facebook_verify_token: get("FACEBOOK_VERIFY_TOKEN").unwrap_or_default(),
                zalo_oa_secret_key: get("ZALO_OA_SECRET_KEY").unwrap_or_default(),
                lazada_app_key: get("LAZADA_APP_KEY").unwrap_or_default(),
                lazada_app_secret: get("LAZADA_APP_SECRET").unwrap_or_default(),
            },
            api_bases: ApiBases {
                zalo: get("ZALO_API_BASE").unwrap_or(defaults.api_bases.zalo),
                facebook: get("FACEBOOK_GRAPH_BASE").unwrap_or(defaults.api_bases.facebook),
                lazada: get("LAZADA_API_BASE").unwrap_or(defaults.api_bases.lazada),
            },
            queue: QueueConfig {
                workers_per_topic: parse_or(
                    &get,
                    "QUEUE_WORKERS_PER_TOPIC",
                    queue_defaults.workers_per_topic,
                )?,
                max_attempts: parse_or(&get, "QUEUE_MAX_ATTEMPTS", queue_defaults.max_attempts)?,
                retry_base: millis(&get, "QUEUE_RETRY_BASE_MS", queue_defaults.retry_base)?,
                retry_max: millis(&get, "QUEUE_RETRY_MAX_MS", queue_defaults.retry_max)?,
                poll_interval: millis(
                    &get,
                    "QUEUE_POLL_INTERVAL_MS",
                    queue_defaults.poll_interval,
                )?,
                visibility_timeout: millis(
                    &get,
                    "QUEUE_VISIBILITY_TIMEOUT_MS",
                    queue_defaults.visibility_timeout,
                )?,
                batch_size: parse_or(&get, "QUEUE_BATCH_SIZE", queue_defaults.batch_size)?,
            },
            sync,
        };
        config.validate()?;
        Ok(config)
    }

    /// Enabled platforms must carry the app-level secrets their adapters need.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for platform in &self.enabled_platforms {
            let missing = match platform {
                Platform::Facebook if self.credentials.facebook_app_secret.is_empty() => {
                    Some("FACEBOOK_APP_SECRET")
                }
                Platform::Facebook if self.credentials.facebook_verify_token.is_empty() => {
                    Some("FACEBOOK_VERIFY_TOKEN")
                }
                Platform::Zalo if self.credentials.zalo_oa_secret_key.is_empty() => {
                    Some("ZALO_OA_SECRET_KEY")
                }
                Platform::Lazada if self.credentials.lazada_app_key.is_empty() => {
                    Some("LAZADA_APP_KEY")
                }
                Platform::Lazada if self.credentials.lazada_app_secret.is_empty() => {
                    Some("LAZADA_APP_SECRET")
                }
                _ => None,
            };
            if let Some(key) = missing {
                return Err(ConfigError::MissingCredential {
                    platform: *platform,
                    key,
                });
            }
        }
        if self.queue.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                key: "QUEUE_MAX_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }
        if self.queue.workers_per_topic == 0 {
            return Err(ConfigError::Invalid {
                key: "QUEUE_WORKERS_PER_TOPIC",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn platform_enabled(&self, platform: Platform) -> bool {
        self.enabled_platforms.contains(&platform)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            key,
            message: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn millis<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let default_ms = default.as_millis() as u64;
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

fn postgres_url_from_parts<G>(get: &G) -> String
where
    G: Fn(&str) -> Option<String>,
{
    let pick = |primary: &str, fallback: &str, default: &str| {
        get(primary)
            .or_else(|| get(fallback))
            .unwrap_or_else(|| default.to_string())
    };
    let host = pick("POSTGRES_HOST", "PGHOST", "localhost");
    let port = pick("POSTGRES_PORT", "PGPORT", "5432");
    let user = pick("POSTGRES_USER", "PGUSER", "postgres");
    let password = pick("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = pick("POSTGRES_DB", "PGDATABASE", "omnichat");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
