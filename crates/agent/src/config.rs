// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Configuration for the tether agent.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tether", version, about = "Tether agent: owns this machine's PTYs and talks to the broker.")]
pub struct AgentConfig {
    /// Broker base URL (http:// or https://).
    #[arg(long, default_value = "http://127.0.0.1:8080", env = "TETHER_SERVER_URL")]
    pub server_url: String,

    /// Bearer credential. Overrides --credentials-path.
    #[arg(long, env = "TETHER_TOKEN")]
    pub token: Option<String>,

    /// File holding the bearer credential.
    #[arg(long, env = "TETHER_CREDENTIALS_PATH")]
    pub credentials_path: Option<PathBuf>,

    /// State directory for the stable machine identifier.
    /// Defaults to `$XDG_STATE_HOME/tether`, then `$HOME/.local/state/tether`.
    #[arg(long, env = "TETHER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Initial reconnect delay in seconds.
    #[arg(long, default_value_t = 3, env = "TETHER_RECONNECT_INITIAL")]
    pub reconnect_initial_secs: u64,

    /// Reconnect delay ceiling in seconds.
    #[arg(long, default_value_t = 30, env = "TETHER_RECONNECT_MAX")]
    pub reconnect_max_secs: u64,

    /// Seconds between liveness pings toward the broker.
    #[arg(long, default_value_t = 30, env = "TETHER_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval_secs: u64,

    /// Shell to run for sessions. Defaults to $SHELL, then /bin/sh.
    #[arg(long, env = "TETHER_SHELL")]
    pub shell: Option<String>,

    /// Log level filter when RUST_LOG is unset.
    #[arg(long, default_value = "warn", env = "TETHER_LOG_LEVEL")]
    pub log_level: String,
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.is_none() && self.credentials_path.is_none() {
            anyhow::bail!("either --token or --credentials-path must be specified");
        }
        if self.reconnect_initial_secs == 0 {
            anyhow::bail!("--reconnect-initial-secs must be positive");
        }
        if self.reconnect_max_secs < self.reconnect_initial_secs {
            anyhow::bail!("--reconnect-max-secs must be >= --reconnect-initial-secs");
        }
        Ok(())
    }

    /// The bearer credential, from the flag or the credentials file.
    pub fn resolve_token(&self) -> anyhow::Result<String> {
        if let Some(ref token) = self.token {
            return Ok(token.clone());
        }
        let path = self
            .credentials_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no credential configured"))?;
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read credentials from {}", path.display()))?;
        let token = contents.trim().to_owned();
        if token.is_empty() {
            anyhow::bail!("credentials file {} is empty", path.display());
        }
        Ok(token)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// The shell command for session PTYs.
    pub fn shell_command(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_owned())
    }

    /// Build the agent channel URL from the broker base URL.
    pub fn ws_url(&self, token: &str, machine_id: &str, instance: &str, host: &str, os: &str) -> String {
        let base = self.server_url.trim_end_matches('/');
        let scheme_rest = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{base}")
        };
        format!(
            "{scheme_rest}/ws/desktop?token={token}&machine_id={machine_id}&instance={instance}&host={host}&os={os}"
        )
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
