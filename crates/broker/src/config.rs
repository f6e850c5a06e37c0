// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the tether broker.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tetherd", version, about = "Tether broker: routes PTY streams between agents and viewers.")]
pub struct BrokerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "TETHERD_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "TETHERD_PORT")]
    pub port: u16,

    /// Seconds without traffic or pong before a channel is closed.
    #[arg(long, default_value_t = 60, env = "TETHERD_IDLE_TIMEOUT")]
    pub idle_timeout_secs: u64,

    /// Seconds between liveness pings on an idle channel.
    #[arg(long, default_value_t = 30, env = "TETHERD_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval_secs: u64,

    /// Per-channel outbound queue capacity, in envelopes.
    #[arg(long, default_value_t = 256, env = "TETHERD_OUTBOUND_QUEUE_DEPTH")]
    pub outbound_queue_depth: usize,

    /// Seconds a session's scrollback survives without an append.
    #[arg(long, default_value_t = 7 * 24 * 3600, env = "TETHERD_SCROLLBACK_TTL")]
    pub scrollback_ttl_secs: u64,

    /// Per-session scrollback cap in bytes; oldest bytes are dropped beyond it.
    #[arg(long, default_value_t = 2 * 1024 * 1024, env = "TETHERD_SCROLLBACK_CAP")]
    pub scrollback_cap_bytes: usize,

    /// SQLite database path for agent and session records.
    #[arg(long, default_value = "tetherd.db", env = "TETHERD_DB_PATH")]
    pub db_path: PathBuf,

    /// External token verifier base URL. Tokens are POSTed to `{url}/verify`.
    #[arg(long, env = "TETHERD_AUTH_URL")]
    pub auth_url: Option<String>,

    /// Static token file (JSON) for single-user deployments and tests.
    /// Ignored when --auth-url is set.
    #[arg(long, env = "TETHERD_AUTH_TOKENS")]
    pub auth_tokens_path: Option<PathBuf>,

    /// Credential-fingerprint blacklist file (JSON array of
    /// `{fingerprint, expires_at}`), loaded at startup.
    #[arg(long, env = "TETHERD_BLACKLIST")]
    pub blacklist_path: Option<PathBuf>,

    /// NATS server URL for multi-instance fan-out. Unset = single instance.
    #[arg(long, env = "TETHERD_NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS subject prefix.
    #[arg(long, default_value = "tether", env = "TETHERD_NATS_PREFIX")]
    pub nats_prefix: String,

    /// NATS auth token.
    #[arg(long, env = "TETHERD_NATS_TOKEN")]
    pub nats_token: Option<String>,

    /// Log format (json or text).
    #[arg(long, default_value = "text", env = "TETHERD_LOG_FORMAT")]
    pub log_format: String,
}

impl BrokerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn scrollback_ttl(&self) -> Duration {
        Duration::from_secs(self.scrollback_ttl_secs)
    }

    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_url.is_none() && self.auth_tokens_path.is_none() {
            anyhow::bail!("either --auth-url or --auth-tokens-path must be specified");
        }
        if self.outbound_queue_depth == 0 {
            anyhow::bail!("--outbound-queue-depth must be positive");
        }
        if self.heartbeat_interval_secs >= self.idle_timeout_secs {
            anyhow::bail!("--heartbeat-interval-secs must be shorter than --idle-timeout-secs");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
