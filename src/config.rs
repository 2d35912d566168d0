use std::env;
use std::str::FromStr;

use tracing::warn;

use crate::engine::{EmitMode, EngineOptions};
use crate::lexer::{STRING_CACHE_CAPACITY, STRING_CACHE_MAX_LEN};
use crate::pool::PoolConfig;
use crate::runtime::DEFAULT_CHUNK_SIZE;

pub const WORKERS_VAR: &str = "JQL_WORKERS";
pub const QUEUE_CAPACITY_VAR: &str = "JQL_QUEUE_CAPACITY";
pub const CACHE_CAPACITY_VAR: &str = "JQL_CACHE_CAPACITY";
pub const CHUNK_SIZE_VAR: &str = "JQL_CHUNK_SIZE";

/// Process-wide defaults, overridable from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub cache_capacity: usize,
    pub chunk_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            workers: pool.size,
            queue_capacity: pool.queue_capacity,
            cache_capacity: STRING_CACHE_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Settings {
    /// Loads `.env` if present, then reads the `JQL_*` variables.
    pub fn from_env() -> Self {
        // A missing .env file is the normal case.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source. Values that do not
    /// parse are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            workers: read(&lookup, WORKERS_VAR, defaults.workers).max(1),
            queue_capacity: read(&lookup, QUEUE_CAPACITY_VAR, defaults.queue_capacity),
            cache_capacity: read(&lookup, CACHE_CAPACITY_VAR, defaults.cache_capacity),
            chunk_size: read(&lookup, CHUNK_SIZE_VAR, defaults.chunk_size).max(1),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig { size: self.workers, queue_capacity: self.queue_capacity }
    }

    pub fn engine_options(&self, emit_mode: EmitMode) -> EngineOptions {
        EngineOptions {
            emit_mode,
            string_cache_capacity: self.cache_capacity,
            string_cache_max_len: STRING_CACHE_MAX_LEN,
        }
    }
}

fn read<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(target: "jql::config", key, value = %raw, "ignoring unparsable setting");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        assert_eq!(Settings::from_lookup(lookup(&[])), Settings::default());
    }

    #[test]
    fn variables_override_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            (WORKERS_VAR, "3"),
            (QUEUE_CAPACITY_VAR, " 16 "),
            (CACHE_CAPACITY_VAR, "0"),
            (CHUNK_SIZE_VAR, "4096"),
        ]));
        assert_eq!(settings.pool_config(), PoolConfig { size: 3, queue_capacity: 16 });
        assert_eq!(settings.chunk_size, 4096);
        let options = settings.engine_options(EmitMode::Raw);
        assert_eq!(options.string_cache_capacity, 0);
        assert_eq!(options.emit_mode, EmitMode::Raw);
    }

    #[test]
    fn bad_values_fall_back() {
        let settings = Settings::from_lookup(lookup(&[(WORKERS_VAR, "many"), (CHUNK_SIZE_VAR, "0")]));
        assert_eq!(settings.workers, Settings::default().workers);
        assert_eq!(settings.chunk_size, 1);
    }
}
