//! Defaults for range queries, overridable through the environment.

use crate::mode::StreamingMode;

/// Byte budget env knob; 0 lets the store pick per-mode sizes.
pub const ENV_TARGET_BYTES: &str = "HOLO_RANGE_TARGET_BYTES";
/// Default streaming mode env knob (e.g. `want_all`, `iterator`).
pub const ENV_STREAMING_MODE: &str = "HOLO_RANGE_STREAMING_MODE";
/// Default row limit env knob; 0 means unlimited.
pub const ENV_ROW_LIMIT: &str = "HOLO_RANGE_ROW_LIMIT";

/// Query defaults applied when a caller does not set them explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    pub target_bytes: usize,
    pub streaming_mode: StreamingMode,
    pub row_limit: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            target_bytes: 0,
            streaming_mode: StreamingMode::Iterator,
            row_limit: 0,
        }
    }
}

impl ScanConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source; unparsable values
    /// are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            target_bytes: parse_env_usize(&lookup, ENV_TARGET_BYTES)
                .unwrap_or(defaults.target_bytes),
            streaming_mode: parse_env_mode(&lookup, ENV_STREAMING_MODE)
                .unwrap_or(defaults.streaming_mode),
            row_limit: parse_env_usize(&lookup, ENV_ROW_LIMIT).unwrap_or(defaults.row_limit),
        }
    }
}

fn parse_env_usize<F>(lookup: &F, var_name: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var_name)?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(var = var_name, value = %raw, error = %err, "ignoring invalid env override");
            None
        }
    }
}

fn parse_env_mode<F>(lookup: &F, var_name: &str) -> Option<StreamingMode>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var_name)?;
    match raw.parse::<StreamingMode>() {
        Ok(mode) => Some(mode),
        Err(err) => {
            tracing::warn!(var = var_name, value = %raw, error = %err, "ignoring invalid env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        assert_eq!(ScanConfig::from_lookup(|_| None), ScanConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = ScanConfig::from_lookup(lookup_from(&[
            (ENV_TARGET_BYTES, "4096"),
            (ENV_STREAMING_MODE, "small"),
            (ENV_ROW_LIMIT, "25"),
        ]));
        assert_eq!(cfg.target_bytes, 4096);
        assert_eq!(cfg.streaming_mode, StreamingMode::Small);
        assert_eq!(cfg.row_limit, 25);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = ScanConfig::from_lookup(lookup_from(&[
            (ENV_TARGET_BYTES, "lots"),
            (ENV_STREAMING_MODE, "turbo"),
        ]));
        assert_eq!(cfg, ScanConfig::default());
    }
}
