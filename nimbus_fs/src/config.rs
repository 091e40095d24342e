use serde::{Deserialize, Serialize};

/// How sibling names are compared for uniqueness.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NameCollation {
    #[default]
    Binary,
    CaseInsensitive,
}

impl NameCollation {
    /// The key under which `name` is checked for uniqueness.
    pub fn key(&self, name: &str) -> String {
        match self {
            NameCollation::Binary => name.to_owned(),
            NameCollation::CaseInsensitive => name.to_lowercase(),
        }
    }
}

/// Per-pool engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Size of one persisted chunk in bytes.
    pub chunk_size: u32,
    pub collation: NameCollation,
    /// Capacity of the transaction queue channel.
    pub queue_capacity: usize,
    pub node_cache_capacity: u64,
    pub node_cache_ttl_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            collation: NameCollation::Binary,
            queue_capacity: 1024,
            node_cache_capacity: 10_000,
            node_cache_ttl_secs: 300,
        }
    }
}

impl PoolConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub(crate) fn chunk_size(&self) -> u64 {
        u64::from(self.chunk_size.max(1))
    }
}
