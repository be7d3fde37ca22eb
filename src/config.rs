use std::str::FromStr;
use std::time::Duration;

use crate::errors::AppError;

pub const DEFAULT_OLLAMA_PORT: u16 = 11434;
pub const DEFAULT_MODEL: &str = "orca-mini";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HTTP_PORT: u16 = 8080;

/// Where and how to reach the local Ollama server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaConfig {
    pub host: String,
    pub port: u16,
    pub model: String,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two response lines.
    pub read_timeout: Duration,
}

impl OllamaConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_OLLAMA_PORT,
            model: model.into(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ollama: OllamaConfig,
    pub system_prompt: Option<String>,
    pub user_name: String,
    pub database_url: Option<String>,
    pub http_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let ollama = OllamaConfig {
            host: var("OLLAMA_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or(&var, "OLLAMA_PORT", DEFAULT_OLLAMA_PORT)?,
            model: var("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            connect_timeout: Duration::from_secs(parse_or(
                &var,
                "OLLAMA_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?),
            read_timeout: Duration::from_secs(parse_or(
                &var,
                "OLLAMA_READ_TIMEOUT_SECS",
                DEFAULT_READ_TIMEOUT_SECS,
            )?),
        };

        Ok(Self {
            ollama,
            system_prompt: var("LLEMMY_SYSTEM_PROMPT"),
            user_name: var("LLEMMY_USER")
                .or_else(|| var("USER"))
                .unwrap_or_else(|| "user".to_string()),
            database_url: var("DATABASE_URL"),
            http_port: parse_or(&var, "PORT", DEFAULT_HTTP_PORT)?,
        })
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match var(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| AppError::InvalidConfig {
            key: key.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.ollama, OllamaConfig::default());
        assert_eq!(config.ollama.chat_url(), "http://localhost:11434/api/chat");
        assert_eq!(config.user_name, "user");
        assert_eq!(config.http_port, 8080);
        assert!(config.database_url.is_none());
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn reads_every_option() {
        let config = AppConfig::from_lookup(lookup(&[
            ("OLLAMA_HOST", "gpu-box"),
            ("OLLAMA_PORT", "12345"),
            ("OLLAMA_MODEL", "llama3"),
            ("OLLAMA_CONNECT_TIMEOUT_SECS", "3"),
            ("OLLAMA_READ_TIMEOUT_SECS", "30"),
            ("LLEMMY_SYSTEM_PROMPT", "Be brief."),
            ("USER", "bjorn"),
            ("DATABASE_URL", "postgres://localhost/llemmy"),
        ]))
        .unwrap();
        assert_eq!(config.ollama.base_url(), "http://gpu-box:12345");
        assert_eq!(config.ollama.model, "llama3");
        assert_eq!(config.ollama.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.ollama.read_timeout, Duration::from_secs(30));
        assert_eq!(config.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(config.user_name, "bjorn");
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/llemmy"));
    }

    #[test]
    fn llemmy_user_wins_over_login_name() {
        let config =
            AppConfig::from_lookup(lookup(&[("USER", "root"), ("LLEMMY_USER", "ada")])).unwrap();
        assert_eq!(config.user_name, "ada");
    }

    #[test]
    fn rejects_unparsable_numbers() {
        let err = AppConfig::from_lookup(lookup(&[("OLLAMA_PORT", "eleven")])).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig { key, .. } if key == "OLLAMA_PORT"));
    }
}
