//! Configuration management for the KTC upload client and reference backend

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::upload::types::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for chunk parts and assembled files
    pub upload_dir: PathBuf,
    /// Chunk size suggested to clients at init
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// API base URL, e.g. `http://localhost:8080/api`
    pub api_url: String,
    /// Provisional chunk size, the backend may override it
    pub chunk_size: usize,
    pub timeout_secs: u64,
    pub retry: RetryConfig,
    /// Where the CLI keeps the session snapshot between runs
    pub session_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                upload_dir: PathBuf::from("./uploads"),
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
            client: ClientConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_url: "http://localhost:8080/api".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: 30,
            retry: RetryConfig::default(),
            session_file: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 8080)?,
            },
            storage: StorageConfig {
                upload_dir: env::var("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./uploads")),
                chunk_size: parse_var("UPLOAD_SERVER_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            },
            client: ClientConfig {
                api_url: env::var("KTC_API_URL")
                    .unwrap_or_else(|_| "http://localhost:8080/api".to_string()),
                chunk_size: parse_var("UPLOAD_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
                timeout_secs: parse_var("UPLOAD_TIMEOUT_SECS", 30)?,
                retry: RetryConfig {
                    max_attempts: parse_var("UPLOAD_MAX_ATTEMPTS", 3)?,
                    base_delay_ms: parse_var("UPLOAD_BASE_DELAY_MS", 500)?,
                    multiplier: parse_var("UPLOAD_BACKOFF_MULTIPLIER", 2)?,
                },
                session_file: env::var("UPLOAD_SESSION_FILE").ok().map(PathBuf::from),
            },
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = Config::default();
        assert_eq!(config.client.retry.max_attempts, 3);
        assert_eq!(config.client.retry.base_delay_ms, 500);
        assert_eq!(config.client.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.storage.chunk_size, config.client.chunk_size);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("KTC_TEST_PARSE_VAR", "not-a-number");
        let result: Result<u32, _> = parse_var("KTC_TEST_PARSE_VAR", 1);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        env::remove_var("KTC_TEST_PARSE_VAR");

        let fallback: u32 = parse_var("KTC_TEST_PARSE_VAR_UNSET", 7).unwrap();
        assert_eq!(fallback, 7);
    }
}
