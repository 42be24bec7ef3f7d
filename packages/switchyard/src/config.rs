use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use dotenvy::dotenv;

use crate::error::SwitchyardError;
use crate::sink::DEFAULT_SINK_QUEUE;
use crate::trace::{DEFAULT_META_MAX_BYTES, DEFAULT_TRACE_CAPACITY};

pub const TRACE_CAPACITY_VAR: &str = "SWITCHYARD_TRACE_CAPACITY";
pub const TRACE_META_MAX_BYTES_VAR: &str = "SWITCHYARD_TRACE_META_MAX_BYTES";
pub const TRACE_SINK_VAR: &str = "SWITCHYARD_TRACE_SINK";
pub const SINK_QUEUE_VAR: &str = "SWITCHYARD_SINK_QUEUE";

/// Pipeline configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub trace_capacity: usize,
    pub meta_max_bytes: usize,
    /// JSONL trace sink; no file logging when unset.
    pub trace_sink: Option<PathBuf>,
    pub sink_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            meta_max_bytes: DEFAULT_META_MAX_BYTES,
            trace_sink: None,
            sink_queue: DEFAULT_SINK_QUEUE,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, SwitchyardError> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SwitchyardError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            trace_capacity: positive(&lookup, TRACE_CAPACITY_VAR, defaults.trace_capacity)?,
            meta_max_bytes: positive(&lookup, TRACE_META_MAX_BYTES_VAR, defaults.meta_max_bytes)?,
            trace_sink: lookup(TRACE_SINK_VAR)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            sink_queue: positive(&lookup, SINK_QUEUE_VAR, defaults.sink_queue)?,
        })
    }
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, SwitchyardError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(SwitchyardError::InvalidConfig { key, value: raw }),
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
    fn test_defaults_when_unset() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.trace_capacity, 600);
        assert_eq!(config.meta_max_bytes, 4096);
        assert!(config.trace_sink.is_none());
    }

    #[test]
    fn test_reads_values() {
        let config = PipelineConfig::from_lookup(lookup(&[
            (TRACE_CAPACITY_VAR, "50"),
            (TRACE_META_MAX_BYTES_VAR, " 128 "),
            (TRACE_SINK_VAR, "/tmp/trace.jsonl"),
            (SINK_QUEUE_VAR, "8"),
        ]))
        .unwrap();
        assert_eq!(config.trace_capacity, 50);
        assert_eq!(config.meta_max_bytes, 128);
        assert_eq!(config.trace_sink, Some(PathBuf::from("/tmp/trace.jsonl")));
        assert_eq!(config.sink_queue, 8);
    }

    #[test]
    fn test_blank_sink_path_is_ignored() {
        let config = PipelineConfig::from_lookup(lookup(&[(TRACE_SINK_VAR, "  ")])).unwrap();
        assert!(config.trace_sink.is_none());
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        for bad in ["zero", "-5", "0", ""] {
            let err = PipelineConfig::from_lookup(lookup(&[(TRACE_CAPACITY_VAR, bad)])).unwrap_err();
            match err {
                SwitchyardError::InvalidConfig { key, value } => {
                    assert_eq!(key, TRACE_CAPACITY_VAR);
                    assert_eq!(value, bad);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }
}
