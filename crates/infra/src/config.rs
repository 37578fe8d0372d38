//! Engine configuration loaded from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `HAGGLE_OFFER_TTL_SECS` | `604800` (7 days) |
//! | `HAGGLE_MAX_ROUNDS` | unset (unbounded) |
//! | `HAGGLE_ALLOW_SELF_COUNTER` | `true` |
//! | `HAGGLE_SWEEP_INTERVAL_MS` | `60000` |
//! | `HAGGLE_SWEEP_BATCH_LIMIT` | `500` |
//! | `DATABASE_URL` | unset (in-memory store) |

use std::time::Duration;

use thiserror::Error;

use haggle_negotiation::{DEFAULT_OFFER_TTL_SECONDS, NegotiationRules};

pub const OFFER_TTL_SECS: &str = "HAGGLE_OFFER_TTL_SECS";
pub const MAX_ROUNDS: &str = "HAGGLE_MAX_ROUNDS";
pub const ALLOW_SELF_COUNTER: &str = "HAGGLE_ALLOW_SELF_COUNTER";
pub const SWEEP_INTERVAL_MS: &str = "HAGGLE_SWEEP_INTERVAL_MS";
pub const SWEEP_BATCH_LIMIT: &str = "HAGGLE_SWEEP_BATCH_LIMIT";
pub const DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Expiry reaper scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    pub batch_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(60_000),
            batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineConfig {
    /// Rules stamped onto every negotiation created under this config.
    pub rules: NegotiationRules,
    pub sweep: SweepConfig,
    pub database_url: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let offer_ttl_seconds = match get(OFFER_TTL_SECS) {
            Some(raw) => parse_positive::<i64>(OFFER_TTL_SECS, &raw)?,
            None => DEFAULT_OFFER_TTL_SECONDS,
        };
        let max_rounds = get(MAX_ROUNDS)
            .map(|raw| parse_positive::<u32>(MAX_ROUNDS, &raw))
            .transpose()?;
        let allow_self_counter = match get(ALLOW_SELF_COUNTER) {
            Some(raw) => parse_bool(ALLOW_SELF_COUNTER, &raw)?,
            None => true,
        };

        let defaults = SweepConfig::default();
        let interval = match get(SWEEP_INTERVAL_MS) {
            Some(raw) => Duration::from_millis(parse_positive::<u64>(SWEEP_INTERVAL_MS, &raw)?),
            None => defaults.interval,
        };
        let batch_limit = match get(SWEEP_BATCH_LIMIT) {
            Some(raw) => parse_positive::<usize>(SWEEP_BATCH_LIMIT, &raw)?,
            None => defaults.batch_limit,
        };

        Ok(Self {
            rules: NegotiationRules {
                offer_ttl_seconds,
                max_rounds,
                allow_self_counter,
            },
            sweep: SweepConfig {
                interval,
                batch_limit,
            },
            database_url: get(DATABASE_URL),
        })
    }
}

fn parse_positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr + PartialOrd + Default,
    T::Err: core::fmt::Display,
{
    let invalid = |reason: String| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason,
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| invalid(e.to_string()))?;
    if value <= T::default() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(value)
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.rules.offer_ttl_seconds, 604_800);
        assert_eq!(cfg.rules.max_rounds, None);
        assert!(cfg.rules.allow_self_counter);
        assert_eq!(cfg.sweep.interval, Duration::from_secs(60));
        assert_eq!(cfg.sweep.batch_limit, 500);
        assert_eq!(cfg.database_url, None);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            (OFFER_TTL_SECS, "3600"),
            (MAX_ROUNDS, "5"),
            (ALLOW_SELF_COUNTER, "false"),
            (SWEEP_INTERVAL_MS, "250"),
            (SWEEP_BATCH_LIMIT, "10"),
            (DATABASE_URL, "postgres://localhost/haggle"),
        ]))
        .unwrap();

        assert_eq!(cfg.rules.offer_ttl_seconds, 3600);
        assert_eq!(cfg.rules.max_rounds, Some(5));
        assert!(!cfg.rules.allow_self_counter);
        assert_eq!(cfg.sweep.interval, Duration::from_millis(250));
        assert_eq!(cfg.sweep.batch_limit, 10);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/haggle"));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let err = EngineConfig::from_lookup(lookup(&[(MAX_ROUNDS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: MAX_ROUNDS, .. }));

        assert!(EngineConfig::from_lookup(lookup(&[(OFFER_TTL_SECS, "soon")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[(ALLOW_SELF_COUNTER, "maybe")])).is_err());
    }
}
