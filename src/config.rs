use std::{env, fs, net::SocketAddr, path::PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;
use uuid::Uuid;

use crate::crypto::decode_key;

#[derive(Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub database_path: PathBuf,
    pub encryption_key: [u8; 32],
    pub queue_capacity: usize,
    pub scan_retention_seconds: u64,
    pub external_call_timeout_seconds: u64,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub sql_top_k: usize,
    pub chat_rate_limit_per_minute: u32,
    pub chat_rate_limit_burst: u32,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("api_key_is_fallback", &self.api_key_is_fallback)
            .field("database_path", &self.database_path)
            .field("queue_capacity", &self.queue_capacity)
            .field("scan_retention_seconds", &self.scan_retention_seconds)
            .field("external_call_timeout_seconds", &self.external_call_timeout_seconds)
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .field("llm_model", &self.llm_model)
            .field("sql_top_k", &self.sql_top_k)
            .field("chat_rate_limit_per_minute", &self.chat_rate_limit_per_minute)
            .field("chat_rate_limit_burst", &self.chat_rate_limit_burst)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("SCHEMACHAT_BIND_ADDR")
            .map(|raw| {
                raw.trim()
                    .trim_matches('"')
                    .trim_matches('\'')
                    .to_string()
            })
            .and_then(|raw| raw.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key(&lookup);
        let encryption_key = resolve_encryption_key(&lookup)?;

        let database_path = PathBuf::from(
            non_empty(&lookup, "SCHEMACHAT_DATABASE_PATH")
                .unwrap_or_else(|| "./data/schemachat.db".to_string()),
        );

        let llm_api_key = non_empty(&lookup, "SCHEMACHAT_LLM_API_KEY")
            .or_else(|| non_empty(&lookup, "OPENAI_API_KEY"));
        if llm_api_key.is_none() {
            warn!("No language model API key configured; chat questions will fail to translate");
        }

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            database_path,
            encryption_key,
            queue_capacity: parsed(&lookup, "SCHEMACHAT_QUEUE_CAPACITY").unwrap_or(128),
            scan_retention_seconds: parsed(&lookup, "SCHEMACHAT_SCAN_RETENTION_SECONDS")
                .unwrap_or(60 * 60),
            external_call_timeout_seconds: parsed(
                &lookup,
                "SCHEMACHAT_EXTERNAL_CALL_TIMEOUT_SECONDS",
            )
            .filter(|v| *v > 0)
            .unwrap_or(30),
            llm_base_url: non_empty(&lookup, "SCHEMACHAT_LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            llm_api_key,
            llm_model: non_empty(&lookup, "SCHEMACHAT_LLM_MODEL")
                .unwrap_or_else(|| "gpt-4-turbo-preview".to_string()),
            sql_top_k: parsed(&lookup, "SCHEMACHAT_SQL_TOP_K").unwrap_or(5),
            chat_rate_limit_per_minute: parsed(&lookup, "SCHEMACHAT_CHAT_RATE_LIMIT_PER_MINUTE")
                .unwrap_or(10),
            chat_rate_limit_burst: parsed(&lookup, "SCHEMACHAT_CHAT_RATE_LIMIT_BURST")
                .unwrap_or(5),
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse::<T>().ok())
}

fn resolve_encryption_key(lookup: &impl Fn(&str) -> Option<String>) -> Result<[u8; 32]> {
    let encoded = if let Some(value) = non_empty(lookup, "SCHEMACHAT_ENCRYPTION_KEY") {
        value
    } else if let Some(key_file) = non_empty(lookup, "SCHEMACHAT_ENCRYPTION_KEY_FILE") {
        let raw = fs::read_to_string(&key_file)
            .with_context(|| format!("Failed reading SCHEMACHAT_ENCRYPTION_KEY_FILE at {key_file}"))?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("SCHEMACHAT_ENCRYPTION_KEY_FILE is empty: {key_file}");
        }
        trimmed.to_string()
    } else {
        bail!(
            "SCHEMACHAT_ENCRYPTION_KEY is not set. Run `schemachat-api generate-key` to create one."
        );
    };

    decode_key(&encoded).context("SCHEMACHAT_ENCRYPTION_KEY must be a base64 encoded 32-byte key")
}

fn resolve_api_key(lookup: &impl Fn(&str) -> Option<String>) -> (String, bool) {
    if let Some(value) = non_empty(lookup, "SCHEMACHAT_API_KEY") {
        return (value, false);
    }

    if let Some(key_file) = lookup("SCHEMACHAT_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                warn!(
                    "SCHEMACHAT_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                warn!(
                    "Failed reading SCHEMACHAT_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        warn!("SCHEMACHAT_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::crypto::{encode_key, generate_key};

    fn lookup(vars: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn key_text() -> String {
        encode_key(&generate_key().expect("key"))
    }

    #[test]
    fn defaults_apply_when_only_the_encryption_key_is_set() {
        let config = Config::from_lookup(lookup(&[("SCHEMACHAT_ENCRYPTION_KEY", key_text())]))
            .expect("config");

        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert!(config.api_key_is_fallback);
        assert!(config.api_key.starts_with("fallback-"));
        assert_eq!(config.database_path, PathBuf::from("./data/schemachat.db"));
        assert_eq!(config.queue_capacity, 128);
        assert_eq!(config.scan_retention_seconds, 3_600);
        assert_eq!(config.external_call_timeout_seconds, 30);
        assert_eq!(config.llm_base_url, "https://api.openai.com/v1");
        assert_eq!(config.llm_api_key, None);
        assert_eq!(config.llm_model, "gpt-4-turbo-preview");
        assert_eq!(config.sql_top_k, 5);
        assert_eq!(config.chat_rate_limit_per_minute, 10);
        assert_eq!(config.chat_rate_limit_burst, 5);
    }

    #[test]
    fn missing_or_malformed_encryption_key_fails_startup() {
        let err = Config::from_lookup(lookup(&[])).expect_err("missing key");
        assert!(err.to_string().contains("SCHEMACHAT_ENCRYPTION_KEY"));

        let err = Config::from_lookup(lookup(&[(
            "SCHEMACHAT_ENCRYPTION_KEY",
            "dG9vLXNob3J0".to_string(),
        )]))
        .expect_err("short key");
        assert!(err.to_string().contains("32-byte"));
    }

    #[test]
    fn key_files_are_read_and_trimmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = key_text();
        let key_path = dir.path().join("enc.key");
        std::fs::write(&key_path, format!("{key}\n")).expect("write key");
        let api_path = dir.path().join("api.key");
        std::fs::write(&api_path, "  secret-token \n").expect("write api key");

        let config = Config::from_lookup(lookup(&[
            (
                "SCHEMACHAT_ENCRYPTION_KEY_FILE",
                key_path.to_string_lossy().into_owned(),
            ),
            ("SCHEMACHAT_API_KEY_FILE", api_path.to_string_lossy().into_owned()),
        ]))
        .expect("config");

        assert_eq!(encode_key(&config.encryption_key), key);
        assert_eq!(config.api_key, "secret-token");
        assert!(!config.api_key_is_fallback);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("SCHEMACHAT_ENCRYPTION_KEY", key_text()),
            ("SCHEMACHAT_BIND_ADDR", "\"127.0.0.1:9000\"".to_string()),
            ("SCHEMACHAT_API_KEY", "token".to_string()),
            ("SCHEMACHAT_QUEUE_CAPACITY", "4".to_string()),
            ("SCHEMACHAT_EXTERNAL_CALL_TIMEOUT_SECONDS", "0".to_string()),
            ("OPENAI_API_KEY", "sk-openai".to_string()),
            ("SCHEMACHAT_SQL_TOP_K", "12".to_string()),
        ]))
        .expect("config");

        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.api_key, "token");
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.external_call_timeout_seconds, 30);
        assert_eq!(config.llm_api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.sql_top_k, 12);
        assert!(!format!("{config:?}").contains("sk-openai"));
    }
}
