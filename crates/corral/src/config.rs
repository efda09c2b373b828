// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Execution control plane for AI coding agent CLIs.
#[derive(Debug, Parser)]
#[command(name = "corral", version, about)]
pub struct Config {
    /// HTTP port to listen on.
    #[arg(long, env = "CORRAL_PORT", default_value = "8791")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "CORRAL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Ring buffer capacity in lines per session.
    #[arg(long, env = "CORRAL_RING_LINES", default_value = "10000")]
    pub ring_lines: usize,

    /// Default session idle timeout in seconds.
    #[arg(long, env = "CORRAL_IDLE_TIMEOUT", default_value = "3600")]
    pub idle_timeout: u64,

    /// Default session max lifetime in seconds.
    #[arg(long, env = "CORRAL_MAX_LIFETIME", default_value = "14400")]
    pub max_lifetime: u64,

    /// SSE heartbeat interval in seconds.
    #[arg(long, env = "CORRAL_HEARTBEAT", default_value = "30")]
    pub heartbeat: u64,

    /// Explicit OpenAI-compatible proxy base URL (e.g. http://127.0.0.1:8317/v1).
    #[arg(long, env = "CORRAL_PROXY_BASE")]
    pub proxy_base: Option<String>,

    /// API key for the proxy.
    #[arg(long, env = "CORRAL_PROXY_KEY")]
    pub proxy_key: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "CORRAL_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CORRAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ring_lines == 0 {
            anyhow::bail!("--ring-lines must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("--log-format must be 'json' or 'text', got '{}'", self.log_format);
        }
        if self.heartbeat == 0 {
            anyhow::bail!("--heartbeat must be positive");
        }
        Ok(())
    }
}

/// Allowed monitor polling intervals in minutes.
pub const POLLING_CHOICES: [u32; 5] = [1, 5, 15, 30, 60];

/// Per-account monitor toggle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountMonitorConfig {
    pub enabled: bool,
}

/// Rate-limit monitor configuration, persisted through the store and
/// validated at the API edge before it reaches the poll job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub polling_minutes: u32,
    pub safety_margin_minutes: f64,
    pub resume_hysteresis_polls: u32,
    /// Keyed by account id string.
    #[serde(default)]
    pub accounts: HashMap<String, AccountMonitorConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            polling_minutes: 5,
            safety_margin_minutes: 5.0,
            resume_hysteresis_polls: 2,
            accounts: HashMap::new(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !POLLING_CHOICES.contains(&self.polling_minutes) {
            anyhow::bail!(
                "polling_minutes must be one of {POLLING_CHOICES:?}, got {}",
                self.polling_minutes
            );
        }
        if self.safety_margin_minutes < 0.0 {
            anyhow::bail!("safety_margin_minutes must be non-negative");
        }
        if self.resume_hysteresis_polls == 0 {
            anyhow::bail!("resume_hysteresis_polls must be at least 1");
        }
        Ok(())
    }

    /// Whether monitoring is enabled for the given account. Accounts absent
    /// from the map default to enabled when monitoring is on globally.
    pub fn account_enabled(&self, account_id: i64) -> bool {
        self.accounts
            .get(&account_id.to_string())
            .map(|c| c.enabled)
            .unwrap_or(true)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
