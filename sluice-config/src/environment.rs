use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Mutable per-mirror environment map.
///
/// Holds free-form string overrides that can change while a mirror is running;
/// signals deliver updated maps which take effect at the next loop iteration.
/// Typed accessors fall back to the given default when the key is absent or
/// unparsable, so a bad override can never wedge a running mirror.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvMap {
    values: HashMap<String, String>,
}

impl EnvMap {
    /// Key controlling how many destination tables are merged concurrently
    /// within one normalize batch.
    pub const MERGE_PARALLELISM: &'static str = "SLUICE_MERGE_PARALLELISM";
    /// Key controlling the change-buffer in-memory record threshold before
    /// spilling to disk.
    pub const BUFFER_SPILL_THRESHOLD: &'static str = "SLUICE_BUFFER_SPILL_THRESHOLD";
    /// Key overriding the seconds slept between QRep partition waves; falls
    /// back to the mirror's configured `wait_between_batches_secs`.
    pub const QREP_WAIT_BETWEEN_BATCHES: &'static str = "SLUICE_QREP_WAIT_BETWEEN_BATCHES";

    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Replaces the whole map, used when an update-env signal arrives.
    pub fn replace(&mut self, values: HashMap<String, String>) {
        self.values = values;
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    pub fn merge_parallelism(&self) -> usize {
        self.get_usize(Self::MERGE_PARALLELISM, 8)
    }

    pub fn buffer_spill_threshold(&self) -> usize {
        self.get_usize(Self::BUFFER_SPILL_THRESHOLD, 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_fall_back_on_garbage() {
        let mut env = EnvMap::default();
        env.set(EnvMap::MERGE_PARALLELISM, "not-a-number");
        assert_eq!(env.merge_parallelism(), 8);

        env.set(EnvMap::MERGE_PARALLELISM, "3");
        assert_eq!(env.merge_parallelism(), 3);
    }
}
