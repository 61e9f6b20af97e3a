//! Environment-backed configuration for `comms-smoke`.

use std::{env, error::Error, fmt};

use comms_core::Credentials;

const DEFAULT_PROTOCOL: &str = "jabber";
const DEFAULT_USER: &str = "smoke@loopback";
const DEFAULT_PASSWORD: &str = "smoke";
const DEFAULT_SERVER: &str = "loopback";
const DEFAULT_PORT: u16 = 5222;
const DEFAULT_MESSAGE: &str = "hello from comms-smoke";
const DEFAULT_WAIT_MS: u64 = 3_000;

/// What the smoke run logs in with and what it sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    pub credentials: Credentials,
    /// Public channel to open. Without it a private chat with the first
    /// contact is used.
    pub channel: Option<String>,
    pub message: String,
    /// Upper bound for every wait in the run.
    pub wait_ms: u64,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let protocol = trimmed_or("COMMS_PROTOCOL", DEFAULT_PROTOCOL, &mut lookup);
        let user_id = trimmed_or("COMMS_USER", DEFAULT_USER, &mut lookup);
        // Passwords are taken verbatim.
        let password = lookup("COMMS_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.to_owned());
        let server = trimmed_or("COMMS_SERVER", DEFAULT_SERVER, &mut lookup);
        let port = parse_or("COMMS_PORT", DEFAULT_PORT, &mut lookup)?;
        let channel = optional_trimmed("COMMS_CHANNEL", &mut lookup);
        let message = trimmed_or("COMMS_MESSAGE", DEFAULT_MESSAGE, &mut lookup);
        let wait_ms = parse_or("COMMS_WAIT_MS", DEFAULT_WAIT_MS, &mut lookup)?;

        if port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COMMS_PORT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if wait_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COMMS_WAIT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            credentials: Credentials::new(protocol, user_id, password, server, port),
            channel,
            message,
            wait_ms,
        })
    }
}

/// Errors produced while reading the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn trimmed_or<F>(key: &'static str, default: &str, lookup: &mut F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed(key, lookup).unwrap_or_else(|| default.to_owned())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_target_the_loopback_manager() {
        let cfg = config_from_pairs(&[]).expect("defaults are valid");
        assert_eq!(cfg.credentials.protocol, "jabber");
        assert_eq!(cfg.credentials.port, 5222);
        assert_eq!(cfg.channel, None);
        assert_eq!(cfg.wait_ms, DEFAULT_WAIT_MS);
    }

    #[test]
    fn reads_in_world_settings() {
        let cfg = config_from_pairs(&[
            ("COMMS_PROTOCOL", " opensim_udp "),
            ("COMMS_USER", "Test User"),
            ("COMMS_PASSWORD", " spaced "),
            ("COMMS_PORT", "9000"),
            ("COMMS_CHANNEL", "0"),
            ("COMMS_MESSAGE", "hi all"),
        ])
        .expect("valid config");

        assert_eq!(cfg.credentials.protocol, "opensim_udp");
        assert_eq!(cfg.credentials.password, " spaced ");
        assert_eq!(cfg.credentials.port, 9000);
        assert_eq!(cfg.channel.as_deref(), Some("0"));
        assert_eq!(cfg.message, "hi all");
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = config_from_pairs(&[("COMMS_PORT", "70000")]).expect_err("port overflows u16");
        assert!(matches!(err, ConfigError::InvalidValue { key: "COMMS_PORT", .. }));

        let err = config_from_pairs(&[("COMMS_WAIT_MS", "0")]).expect_err("zero wait");
        assert_eq!(err.to_string(), "invalid COMMS_WAIT_MS='0': must be at least 1");
    }
}
