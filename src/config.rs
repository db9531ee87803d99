//! Ambient configuration: one `serde`+`toml`-deserializable struct per
//! subsystem, each a plain struct with `#[serde(default)]` fields backed by
//! a `Default` impl carrying the tunable's production default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::sealer::SealerConfig;

fn default_index_block_size() -> u64 {
    64 * 1024
}

fn default_max_retry_count() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangelogConfig {
    pub index_block_size: u64,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        ChangelogConfig { index_block_size: default_index_block_size() }
    }
}

fn default_retry_backoff_time() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentReaderConfig {
    pub max_retry_count: u32,
    #[serde(with = "duration_millis")]
    pub retry_backoff_time: Duration,
    #[serde(with = "duration_millis")]
    pub probe_chunk_set_rpc_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub evict_after_successful_access_time: Duration,
    #[serde(with = "duration_millis")]
    pub periodic_update_delay: Duration,
    pub net_queue_size_factor: f64,
    pub disk_queue_size_factor: f64,
}

impl Default for FragmentReaderConfig {
    fn default() -> Self {
        FragmentReaderConfig {
            max_retry_count: default_max_retry_count(),
            retry_backoff_time: default_retry_backoff_time(),
            probe_chunk_set_rpc_timeout: Duration::from_secs(5),
            evict_after_successful_access_time: Duration::from_secs(15 * 60),
            periodic_update_delay: Duration::from_secs(60),
            net_queue_size_factor: 0.5,
            disk_queue_size_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CypressConfig {
    pub max_node_children_count: u64,
    pub max_string_node_length: u64,
}

impl Default for CypressConfig {
    fn default() -> Self {
        CypressConfig { max_node_children_count: 100_000, max_string_node_length: 16 * 1024 * 1024 }
    }
}

/// Root config tying every subsystem's knobs together, deserialized from a
/// single TOML document with one `[section]` table per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub changelog: ChangelogConfig,
    pub sealer: SealerConfigToml,
    pub fragment_reader: FragmentReaderConfig,
    pub cypress: CypressConfig,
}

/// `SealerConfig` uses raw `Duration`s internally; this mirrors it with
/// millisecond fields for TOML round-tripping and converts via `into()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SealerConfigToml {
    pub max_chunk_concurrent_seals: usize,
    pub max_chunks_per_refresh: usize,
    pub chunk_refresh_period_ms: u64,
    pub chunk_seal_backoff_time_ms: u64,
    pub journal_rpc_timeout_ms: u64,
}

impl Default for SealerConfigToml {
    fn default() -> Self {
        let defaults = SealerConfig::default();
        SealerConfigToml {
            max_chunk_concurrent_seals: defaults.max_chunk_concurrent_seals,
            max_chunks_per_refresh: defaults.max_chunks_per_refresh,
            chunk_refresh_period_ms: defaults.chunk_refresh_period.as_millis() as u64,
            chunk_seal_backoff_time_ms: defaults.chunk_seal_backoff_time.as_millis() as u64,
            journal_rpc_timeout_ms: defaults.journal_rpc_timeout.as_millis() as u64,
        }
    }
}

impl From<SealerConfigToml> for SealerConfig {
    fn from(toml: SealerConfigToml) -> Self {
        SealerConfig {
            max_chunk_concurrent_seals: toml.max_chunk_concurrent_seals,
            max_chunks_per_refresh: toml.max_chunks_per_refresh,
            chunk_refresh_period: Duration::from_millis(toml.chunk_refresh_period_ms),
            chunk_seal_backoff_time: Duration::from_millis(toml.chunk_seal_backoff_time_ms),
            journal_rpc_timeout: Duration::from_millis(toml.journal_rpc_timeout_ms),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Loads a [`StorageConfig`] from a TOML file. Errors propagate to the
/// caller (this is a startup-time operation, not an invariant).
pub fn load_config(path: impl AsRef<std::path::Path>) -> anyhow::Result<StorageConfig> {
    let text = std::fs::read_to_string(path)?;
    let config: StorageConfig = toml::from_str(&text)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = StorageConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: StorageConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.changelog.index_block_size, config.changelog.index_block_size);
        assert_eq!(parsed.sealer.max_chunk_concurrent_seals, config.sealer.max_chunk_concurrent_seals);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed: StorageConfig = toml::from_str("[changelog]\nindex_block_size = 4096\n").unwrap();
        assert_eq!(parsed.changelog.index_block_size, 4096);
        assert_eq!(parsed.fragment_reader.max_retry_count, FragmentReaderConfig::default().max_retry_count);
    }
}
