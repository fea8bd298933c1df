//! Utility functions and helpers for configuration

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serde helper module for a list of human-readable durations
/// (`[250ms, 1s, 2m]`)
pub mod serde_duration_list {
    use super::*;
    use humantime_serde::Serde;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(durations.iter().map(|d| Serde::from(*d)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let durations: Vec<Serde<Duration>> = Vec::deserialize(deserializer)?;
        Ok(durations.into_iter().map(Serde::into_inner).collect())
    }
}

/// Default functions for serde
pub fn default_true() -> bool {
    true
}

pub fn default_false() -> bool {
    false
}

/// One worker per logical CPU
pub fn default_pool_size() -> usize {
    num_cpus::get().max(1)
}
