//! Service configuration
//!
//! Defaults, optionally overlaid by a TOML file (`PROPHET_CONFIG_PATH`), then by
//! individual environment variables.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::arbitration::ArbitrationConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: String,
    pub db_path: String,
    pub jwt_secret: String,
    /// Lifetime of tokens minted by [`crate::auth::JwtHandler`].
    pub jwt_expiration_hours: i64,
    pub arbitration: ArbitrationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            db_path: "prophet.db".to_string(),
            jwt_secret: String::new(),
            jwt_expiration_hours: 24,
            arbitration: ArbitrationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// File named by `PROPHET_CONFIG_PATH` (or `prophet.toml`), then env overrides.
    pub fn from_env() -> Self {
        let path =
            env::var("PROPHET_CONFIG_PATH").unwrap_or_else(|_| "prophet.toml".to_string());

        let mut cfg = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default config ({}): {:#}", path, e);
            Self::default()
        });
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg
    }

    /// Overlay values from `lookup`. Unparseable or out-of-range values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = text("PROPHET_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = text("PROPHET_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = text("JWT_SECRET") {
            self.jwt_secret = v;
        }
        self.jwt_expiration_hours = text("JWT_EXPIRATION_HOURS")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(self.jwt_expiration_hours);

        let arb = &mut self.arbitration;
        arb.search_budget = text("ARBITRATION_SEARCH_BUDGET")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(arb.search_budget);
        arb.results_per_query = text("ARBITRATION_RESULTS_PER_QUERY")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(arb.results_per_query);
        arb.max_sources = text("ARBITRATION_MAX_SOURCES")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(arb.max_sources);
        arb.call_timeout_ms = text("ARBITRATION_CALL_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(arb.call_timeout_ms);
        if let Some(v) = text("OPENROUTER_MODEL") {
            arb.model = v;
        }
        arb.temperature = text("ARBITRATION_TEMPERATURE")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(arb.temperature);
        arb.gather_max_tokens = text("ARBITRATION_GATHER_MAX_TOKENS")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(arb.gather_max_tokens);
        arb.decide_max_tokens = text("ARBITRATION_DECIDE_MAX_TOKENS")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(arb.decide_max_tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.arbitration.search_budget, 10);
        assert_eq!(cfg.arbitration.results_per_query, 8);
        assert_eq!(cfg.arbitration.call_timeout_ms, 30_000);
        assert_eq!(cfg.jwt_expiration_hours, 24);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "db_path = \"/tmp/ledger.db\"\n\n[arbitration]\nsearch_budget = 4\nmodel = \"anthropic/claude-3.5-sonnet\""
        )
        .unwrap();

        let cfg = AppConfig::load(file.path()).unwrap();
        assert_eq!(cfg.db_path, "/tmp/ledger.db");
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
        assert_eq!(cfg.arbitration.search_budget, 4);
        assert_eq!(cfg.arbitration.model, "anthropic/claude-3.5-sonnet");
        assert_eq!(cfg.arbitration.max_sources, 10);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load("/nonexistent/prophet.toml").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PROPHET_DB_PATH", "/var/lib/prophet.db"),
            ("JWT_SECRET", "s3cret"),
            ("ARBITRATION_SEARCH_BUDGET", "6"),
            ("ARBITRATION_CALL_TIMEOUT_SECS", "12"),
            ("ARBITRATION_TEMPERATURE", "nan"),
            ("ARBITRATION_MAX_SOURCES", "0"),
            ("PROPHET_LISTEN_ADDR", "  "),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.db_path, "/var/lib/prophet.db");
        assert_eq!(cfg.jwt_secret, "s3cret");
        assert_eq!(cfg.arbitration.search_budget, 6);
        assert_eq!(cfg.arbitration.call_timeout_ms, 12_000);
        // Rejected values keep the previous setting
        assert_eq!(cfg.arbitration.temperature, 0.1);
        assert_eq!(cfg.arbitration.max_sources, 10);
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_huge_timeouts_saturate() {
        let vars: HashMap<&str, &str> = [
            ("ARBITRATION_SEARCH_BUDGET", "18446744073709551615"),
            ("ARBITRATION_CALL_TIMEOUT_SECS", "18446744073709551615"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.arbitration.call_timeout_ms, u64::MAX);
        assert_eq!(cfg.arbitration.search_budget, usize::MAX);
        assert_eq!(cfg.arbitration.loop_timeout(), std::time::Duration::MAX);
    }
}
