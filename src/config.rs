use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub bot: BotConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub token: String,
    /// API base override, used by tests against a mock server.
    pub api_base: String,
    pub request_timeout_seconds: u64,
    /// Upload attachment bytes in the request body instead of passing URLs.
    pub direct_upload: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            request_timeout_seconds: 30,
            direct_upload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.consult-relay/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_retries: i32,
    pub batch_size: i64,
    pub run_lock_seconds: i64,
    pub row_lease_seconds: i64,
    /// Soft-delete finished rows instead of removing them, for forensic
    /// replay.
    pub debug_keep_rows: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            batch_size: 10,
            run_lock_seconds: 120,
            row_lease_seconds: 300,
            debug_keep_rows: false,
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("CONSULT_RELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.consult-relay/consult-relay.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment
    if let Ok(token) = env::var("CONSULT_RELAY_BOT_TOKEN") {
        if !token.trim().is_empty() {
            cfg.bot.token = token;
        }
    }

    if let Ok(base) = env::var("CONSULT_RELAY_API_BASE") {
        if !base.trim().is_empty() {
            cfg.bot.api_base = base;
        }
    }

    if let Ok(url) = env::var("CONSULT_RELAY_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("CONSULT_RELAY_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(v) = env::var("CONSULT_RELAY_MAX_RETRIES") {
        if let Ok(n) = v.trim().parse() {
            cfg.queue.max_retries = n;
        }
    }

    if let Ok(v) = env::var("CONSULT_RELAY_BATCH_SIZE") {
        if let Ok(n) = v.trim().parse() {
            cfg.queue.batch_size = n;
        }
    }

    if let Ok(v) = env::var("CONSULT_RELAY_DEBUG_KEEP_ROWS") {
        cfg.queue.debug_keep_rows = matches!(v.trim(), "1" | "true" | "yes");
    }

    cfg
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}", path.to_string_lossy())
}
