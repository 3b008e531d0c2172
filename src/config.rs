use std::collections::HashSet;
use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::EntityKind;

/// Run configuration assembled from environment variables at startup.
/// Everything the orchestrator needs is validated here so a bad setting
/// fails the process before any request is made.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL of the target API, without a trailing slash.
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Which entity family to exercise; selects endpoints and identity field.
    pub kind: EntityKind,
    /// Number of sequential test rounds.
    pub rounds: u64,
    /// Nominal per-entity amplification factor.  The effective query count
    /// per entity depends on the kind; see `runner::queries_per_entity`.
    pub batch_size: u64,
    /// Entity names whose identity mismatches are tolerated (known
    /// duplicate/legacy names that would otherwise count as errors).
    pub ignore: HashSet<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = required_var("SUPERSTRESS_URL")?
            .trim_end_matches('/')
            .to_string();
        let username = required_var("SUPERSTRESS_USERNAME")?;
        let password = required_var("SUPERSTRESS_PASSWORD")?;

        let kind = match env::var("SUPERSTRESS_ENTITY") {
            Ok(raw) => EntityKind::from_str(&raw)?,
            Err(env::VarError::NotPresent) => EntityKind::Dataset,
            Err(err) => return Err(err.into()),
        };

        let rounds = parse_optional_u64("SUPERSTRESS_ROUNDS")?.unwrap_or(3);
        if rounds == 0 {
            return Err(anyhow!("SUPERSTRESS_ROUNDS must be at least 1"));
        }
        let batch_size = parse_optional_u64("SUPERSTRESS_BATCH_SIZE")?.unwrap_or(10);
        if batch_size == 0 {
            return Err(anyhow!("SUPERSTRESS_BATCH_SIZE must be at least 1"));
        }

        let ignore = env::var("SUPERSTRESS_IGNORE")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            base_url,
            username,
            password,
            kind,
            rounds,
            batch_size,
            ignore,
        })
    }
}

fn required_var(var: &str) -> Result<String> {
    let value = env::var(var).with_context(|| format!("{} must be set", var))?;
    if value.trim().is_empty() {
        return Err(anyhow!("{} must not be empty", var));
    }
    Ok(value)
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
