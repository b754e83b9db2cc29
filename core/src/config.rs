//! Session engine configuration.
//!
//! Defaults come from the environment (`PARLEY_*` variables) and can be
//! overlaid with a TOML document, e.g.:
//!
//! ```toml
//! max_sessions = 50
//! session_ttl_ms = 1800000
//! max_tokens = 8000
//! compaction = ["middle_removal", "oldest_first"]
//! preserve_prefix = 2
//! preserve_suffix = 4
//! min_tail = 2
//!
//! [default_model]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::CompactionStrategy;
use crate::session::ModelConfig;
use crate::{ParleyError, Result};

const DEFAULT_MAX_SESSIONS: usize = 100;
const DEFAULT_SESSION_TTL_MS: u64 = 60 * 60 * 1000;
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Compaction strategies selectable from configuration, applied in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionKind {
    MiddleRemoval,
    OldestFirst,
}

/// Configuration for the session manager and every conversation context it creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of durably recorded sessions
    pub max_sessions: usize,

    /// Idle time after which a session expires
    pub session_ttl_ms: u64,

    /// Token budget per conversation; enforcement is off when unset
    pub max_tokens: Option<usize>,

    /// Ordered compaction pipeline
    pub compaction: Vec<CompactionKind>,

    /// Leading messages protected by middle removal
    pub preserve_prefix: usize,

    /// Trailing messages protected by middle removal
    pub preserve_suffix: usize,

    /// Floor for oldest-first removal
    pub min_tail: usize,

    /// Evict in-memory sessions idle for this long (metadata stays durable)
    pub idle_eviction_ms: Option<u64>,

    /// Model bound to newly created or rehydrated sessions
    pub default_model: ModelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: env_parse("PARLEY_MAX_SESSIONS").unwrap_or(DEFAULT_MAX_SESSIONS),
            session_ttl_ms: env_parse("PARLEY_SESSION_TTL_MS").unwrap_or(DEFAULT_SESSION_TTL_MS),
            max_tokens: env_parse("PARLEY_MAX_TOKENS"),
            compaction: vec![CompactionKind::MiddleRemoval, CompactionKind::OldestFirst],
            preserve_prefix: 2,
            preserve_suffix: 4,
            min_tail: 2,
            idle_eviction_ms: env_parse("PARLEY_IDLE_EVICTION_MS"),
            default_model: ModelConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file (path via PARLEY_CONFIG or ./parley.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| "parley.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "parley", path = %path, "No TOML config found; using defaults/env");
            return Self::default();
        }
        match std::fs::read_to_string(p) {
            Ok(s) => match Self::from_toml_str(&s) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(target: "parley", error = %e, "Invalid TOML config; using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(target: "parley", error = %e, "Failed to read TOML; using defaults");
                Self::default()
            }
        }
    }

    /// Parse a TOML document; keys that are absent keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| ParleyError::Validation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(ParleyError::Validation(
                "max_sessions must be a positive integer".to_string(),
            ));
        }
        if self.session_ttl_ms == 0 {
            return Err(ParleyError::Validation(
                "session_ttl_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_ms.map(Duration::from_millis)
    }

    /// Background sweep period: a quarter of the TTL, capped at 15 minutes.
    pub fn sweep_interval(&self) -> Duration {
        (self.session_ttl() / 4)
            .min(MAX_SWEEP_INTERVAL)
            .max(Duration::from_millis(1))
    }

    /// Build the runtime compaction pipeline from the configured kinds.
    pub fn compaction_strategies(&self) -> Vec<CompactionStrategy> {
        self.compaction
            .iter()
            .map(|kind| match kind {
                CompactionKind::MiddleRemoval => CompactionStrategy::MiddleRemoval {
                    preserve_prefix: self.preserve_prefix,
                    preserve_suffix: self.preserve_suffix,
                },
                CompactionKind::OldestFirst => CompactionStrategy::OldestFirst {
                    min_tail: self.min_tail,
                },
            })
            .collect()
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse::<T>().ok())
}
