use std::env;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub store_backend: StoreBackend,
    pub default_country_code: String,
    pub jwt_secret: Option<String>,
    pub meta_verify_token: String,
    pub meta_app_secret: String,
    pub verify_meta_signature: bool,
    pub graph_base_url: String,
    pub graph_version: String,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: String::new(),
            db_max_connections: 10,
            store_backend: StoreBackend::Memory,
            default_country_code: "34".to_string(),
            jwt_secret: None,
            meta_verify_token: String::new(),
            meta_app_secret: String::new(),
            verify_meta_signature: false,
            graph_base_url: "https://graph.facebook.com".to_string(),
            graph_version: "v24.0".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

fn env_text(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_first(keys: &[&str], fallback: &str) -> String {
    keys.iter()
        .find_map(|key| env_text(key))
        .unwrap_or_else(|| fallback.to_string())
}

fn resolve_database_url() -> String {
    if let Some(url) = env_text("DATABASE_URL") {
        return url;
    }
    let host = env_first(&["POSTGRES_HOST", "PGHOST"], "localhost");
    let port = env_first(&["POSTGRES_PORT", "PGPORT"], "5432");
    let user = env_first(&["POSTGRES_USER", "PGUSER"], "postgres");
    let password = env_first(&["POSTGRES_PASSWORD", "PGPASSWORD"], "postgres");
    let db = env_first(&["POSTGRES_DB", "PGDATABASE"], "lead_sync");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn parse_store_backend(raw: Option<String>) -> AppResult<StoreBackend> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("postgres") | Some("pg") => Ok(StoreBackend::Postgres),
        Some("memory") => Ok(StoreBackend::Memory),
        Some(other) => Err(AppError::Config(format!(
            "unknown STORE_BACKEND '{other}', expected 'postgres' or 'memory'"
        ))),
    }
}

fn parse_country_code(raw: Option<String>) -> AppResult<String> {
    let code = raw.unwrap_or_else(|| "34".to_string());
    let code = code.trim_start_matches('+').to_string();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Config(format!(
            "DEFAULT_COUNTRY_CODE must be digits, got '{code}'"
        )));
    }
    Ok(code)
}

impl AppConfig {
    /// Reads the process environment (after `.env` has been loaded).
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();

        let port = match env_text("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| AppError::Config(format!("invalid PORT value: {raw}")))?,
            None => defaults.port,
        };
        let db_max_connections = env_text("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.db_max_connections);
        let log_format = match env_text("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            port,
            database_url: resolve_database_url(),
            db_max_connections,
            store_backend: parse_store_backend(env_text("STORE_BACKEND"))?,
            default_country_code: parse_country_code(env_text("DEFAULT_COUNTRY_CODE"))?,
            jwt_secret: env_text("JWT_SECRET"),
            meta_verify_token: env_text("META_VERIFY_TOKEN").unwrap_or_default(),
            meta_app_secret: env_text("META_APP_SECRET").unwrap_or_default(),
            verify_meta_signature: env_text("VERIFY_META_SIGNATURE").as_deref() == Some("true"),
            graph_base_url: env_text("META_GRAPH_BASE_URL")
                .unwrap_or(defaults.graph_base_url)
                .trim_end_matches('/')
                .to_string(),
            graph_version: env_text("META_GRAPH_VERSION").unwrap_or(defaults.graph_version),
            log_format,
        })
    }

    /// Graph API root for the configured version, e.g. `https://graph.facebook.com/v24.0`.
    pub fn graph_api_root(&self) -> String {
        format!("{}/{}", self.graph_base_url, self.graph_version)
    }
}
