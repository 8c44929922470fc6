// Environment-driven client configuration, the pod entry point.
//
// Suffixes arrive human-readable here and are hashed before use; callers of
// the direct constructor are expected to pass an already-hashed suffix.
use anyhow::{bail, Context, Result};
use std::time::Duration;

pub const DEFAULT_LIST_KEY_PREFIX: &str = "pod-";
pub const DEFAULT_LIST_KEY_SUFFIX: &str = "list";
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ClientEnvConfig {
    pub redis_address: String,
    pub registration_key: String,
    pub list_key_prefix: String,
    /// Already hashed; only the digest ever reaches the KV store.
    pub list_key_suffix: String,
    pub registration_timeout: Duration,
    pub pop_timeout: Duration,
    pub verbose_register: bool,
}

impl ClientEnvConfig {
    pub fn from_env() -> Result<Self> {
        let redis_host = require_env("REDIS_HOST")?;
        let redis_port = std::env::var("REDIS_PORT")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "6379".to_string());

        let registration_key = require_env("PROXY_REGO_KEY")?;
        let list_key_prefix = require_env("LIST_KEY_PREFIX")?;
        let list_key_suffix = courier_keys::sha1_hex(&require_env("LIST_KEY_SUFFIX")?);

        let registration_timeout =
            match std::env::var("MESSAGE_CLIENT_REGISTRATION_TIMEOUT_SECONDS") {
                Ok(raw) if !raw.is_empty() => {
                    let seconds: u64 = raw.parse().context(
                        "if MESSAGE_CLIENT_REGISTRATION_TIMEOUT_SECONDS is set it must be a valid integer",
                    )?;
                    Duration::from_secs(seconds)
                }
                _ => DEFAULT_REGISTRATION_TIMEOUT,
            };

        // A bad pop timeout falls back to the default instead of failing:
        // the receive loop works either way.
        let pop_timeout = match std::env::var("REDIS_BRPOP_TIMEOUT_SECONDS") {
            Ok(raw) if !raw.is_empty() => match raw.parse::<u64>() {
                Ok(seconds) => {
                    tracing::info!(seconds, "overriding blocking pop timeout");
                    Duration::from_secs(seconds)
                }
                Err(err) => {
                    tracing::warn!(
                        value = %raw,
                        error = %err,
                        default_seconds = DEFAULT_POP_TIMEOUT.as_secs(),
                        "REDIS_BRPOP_TIMEOUT_SECONDS is not a valid integer, using default"
                    );
                    DEFAULT_POP_TIMEOUT
                }
            },
            _ => DEFAULT_POP_TIMEOUT,
        };

        let verbose_register = std::env::var("DEBUG")
            .map(|value| !value.is_empty())
            .unwrap_or(false);

        Ok(Self {
            redis_address: format!("{redis_host}:{redis_port}"),
            registration_key,
            list_key_prefix,
            list_key_suffix,
            registration_timeout,
            pop_timeout,
            verbose_register,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("'{name}' environment variable is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process environment is shared; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_client_env() {
        for name in [
            "REDIS_HOST",
            "REDIS_PORT",
            "PROXY_REGO_KEY",
            "LIST_KEY_PREFIX",
            "LIST_KEY_SUFFIX",
            "MESSAGE_CLIENT_REGISTRATION_TIMEOUT_SECONDS",
            "REDIS_BRPOP_TIMEOUT_SECONDS",
            "DEBUG",
        ] {
            std::env::remove_var(name);
        }
    }

    fn set_required_env() {
        std::env::set_var("REDIS_HOST", "127.0.0.1");
        std::env::set_var("REDIS_PORT", "6379");
        std::env::set_var("PROXY_REGO_KEY", "registrationKey");
        std::env::set_var("LIST_KEY_PREFIX", "listKeyPrefix");
        std::env::set_var("LIST_KEY_SUFFIX", "listKeySuffix");
    }

    #[test]
    fn loads_and_hashes_the_suffix() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_client_env();
        set_required_env();
        std::env::set_var("MESSAGE_CLIENT_REGISTRATION_TIMEOUT_SECONDS", "10");

        let config = ClientEnvConfig::from_env().expect("config");
        assert_eq!(config.redis_address, "127.0.0.1:6379");
        assert_eq!(config.registration_key, "registrationKey");
        assert_eq!(config.list_key_prefix, "listKeyPrefix");
        assert_eq!(config.list_key_suffix, courier_keys::sha1_hex("listKeySuffix"));
        assert_eq!(config.registration_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_registration_timeout_is_fatal() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_client_env();
        set_required_env();
        std::env::set_var("MESSAGE_CLIENT_REGISTRATION_TIMEOUT_SECONDS", "Invalid");

        let err = ClientEnvConfig::from_env().expect_err("invalid timeout");
        assert!(err
            .to_string()
            .contains("MESSAGE_CLIENT_REGISTRATION_TIMEOUT_SECONDS"));
    }

    #[test]
    fn registration_timeout_defaults_to_sixty_seconds() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_client_env();
        set_required_env();

        let config = ClientEnvConfig::from_env().expect("config");
        assert_eq!(config.registration_timeout, DEFAULT_REGISTRATION_TIMEOUT);
        assert_eq!(config.pop_timeout, DEFAULT_POP_TIMEOUT);
        assert!(!config.verbose_register);
    }

    #[test]
    fn missing_required_variable_names_it() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_client_env();

        let err = ClientEnvConfig::from_env().expect_err("missing host");
        assert!(err.to_string().contains("REDIS_HOST"));
    }

    #[test]
    fn invalid_pop_timeout_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        clear_client_env();
        set_required_env();
        std::env::set_var("REDIS_BRPOP_TIMEOUT_SECONDS", "NotANumber");

        let config = ClientEnvConfig::from_env().expect("config");
        assert_eq!(config.pop_timeout, DEFAULT_POP_TIMEOUT);
    }
}
