//! Orchestrator configuration.

use std::time::Duration;

use crate::cache::{DEFAULT_CAPACITY, RESPONSE_TTL};
use crate::tools::DEFAULT_CALL_TIMEOUT;

/// How the workflow entry chooses between the two paths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryMode {
    /// Force the simple path for every message.
    Simple,
    /// Force the parallel path for every message.
    Parallel,
    /// Let routing analysis decide per message.
    #[default]
    Auto,
}

/// Tunable orchestrator settings. Defaults match production behavior; the
/// `SHOPGRAPH_DB_NAME` environment variable overrides the database name when
/// built via [`WorkflowConfig::from_env`].
#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    pub entry_mode: EntryMode,
    pub enable_persistence: bool,
    pub enable_cache: bool,
    /// SQLite database name, used as `sqlite://{name}` on connect.
    pub sqlite_db_name: String,
    /// Cache key namespace label, bumped to invalidate all entries at once.
    pub phase: String,
    pub response_ttl: Duration,
    pub cache_capacity: usize,
    pub call_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            entry_mode: EntryMode::Auto,
            enable_persistence: true,
            enable_cache: true,
            sqlite_db_name: "shopgraph.db".to_string(),
            phase: "v1".to_string(),
            response_ttl: RESPONSE_TTL,
            cache_capacity: DEFAULT_CAPACITY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `.env` / environment overrides applied.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(name) = std::env::var("SHOPGRAPH_DB_NAME") {
            if !name.trim().is_empty() {
                config.sqlite_db_name = name;
            }
        }
        if let Ok(phase) = std::env::var("SHOPGRAPH_CACHE_PHASE") {
            if !phase.trim().is_empty() {
                config.phase = phase;
            }
        }
        config
    }

    #[must_use]
    pub fn with_entry_mode(mut self, entry_mode: EntryMode) -> Self {
        self.entry_mode = entry_mode;
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.enable_persistence = enabled;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_db_name(mut self, name: impl Into<String>) -> Self {
        self.sqlite_db_name = name.into();
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    #[must_use]
    pub fn with_response_ttl(mut self, ttl: Duration) -> Self {
        self.response_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// SQLite connection URL for the configured database name.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.sqlite_db_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_both_tiers() {
        let config = WorkflowConfig::default();
        assert_eq!(config.entry_mode, EntryMode::Auto);
        assert!(config.enable_persistence);
        assert!(config.enable_cache);
        assert_eq!(config.database_url(), "sqlite://shopgraph.db");
        assert_eq!(config.phase, "v1");
    }

    #[test]
    fn builders_override_fields() {
        let config = WorkflowConfig::new()
            .with_entry_mode(EntryMode::Parallel)
            .with_persistence(false)
            .with_phase("v2")
            .with_cache_capacity(10);
        assert_eq!(config.entry_mode, EntryMode::Parallel);
        assert!(!config.enable_persistence);
        assert_eq!(config.phase, "v2");
        assert_eq!(config.cache_capacity, 10);
    }
}
