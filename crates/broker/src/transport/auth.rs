// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auth boundary: token verification is delegated to an external
//! collaborator; the broker only consumes identities and enforces the
//! credential-fingerprint blacklist.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::Context;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use tether_protocol::{epoch_ms, ErrorCode};

/// Identity behind a viewer token.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerIdentity {
    pub user_id: i64,
}

/// Identity behind an agent token.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentIdentity {
    pub user_id: i64,
    pub desktop_id: i64,
    #[serde(default)]
    pub credential_fingerprint: String,
    /// Credential expiry, epoch ms. Feeds the blacklist entry lifetime.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// SHA-256 fingerprint of an opaque credential, hex-encoded.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Constant-time string comparison to prevent timing side channels.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Static token table for tests and single-user deployments.
///
/// File format:
/// ```json
/// {
///   "viewers": { "<token>": 1 },
///   "agents":  { "<token>": { "user_id": 1, "desktop_id": 7 } }
/// }
/// ```
#[derive(Default)]
pub struct StaticVerifier {
    viewers: HashMap<String, i64>,
    agents: HashMap<String, AgentIdentity>,
}

#[derive(Deserialize)]
struct StaticTokenFile {
    #[serde(default)]
    viewers: HashMap<String, i64>,
    #[serde(default)]
    agents: HashMap<String, AgentIdentity>,
}

impl StaticVerifier {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read token file {}", path.display()))?;
        let parsed: StaticTokenFile =
            serde_json::from_str(&contents).context("parse token file")?;
        Ok(Self { viewers: parsed.viewers, agents: parsed.agents })
    }

    pub fn with_viewer(mut self, token: &str, user_id: i64) -> Self {
        self.viewers.insert(token.to_owned(), user_id);
        self
    }

    pub fn with_agent(mut self, token: &str, user_id: i64, desktop_id: i64) -> Self {
        self.agents.insert(
            token.to_owned(),
            AgentIdentity {
                user_id,
                desktop_id,
                credential_fingerprint: fingerprint(token),
                expires_at: None,
            },
        );
        self
    }

    fn verify_viewer(&self, token: &str) -> Result<ViewerIdentity, ErrorCode> {
        self.viewers
            .iter()
            .find(|(known, _)| constant_time_eq(known, token))
            .map(|(_, user_id)| ViewerIdentity { user_id: *user_id })
            .ok_or(ErrorCode::Unauthorized)
    }

    fn verify_agent(&self, token: &str) -> Result<AgentIdentity, ErrorCode> {
        self.agents
            .iter()
            .find(|(known, _)| constant_time_eq(known, token))
            .map(|(_, identity)| {
                let mut identity = identity.clone();
                if identity.credential_fingerprint.is_empty() {
                    identity.credential_fingerprint = fingerprint(token);
                }
                identity
            })
            .ok_or(ErrorCode::Unauthorized)
    }
}

/// Verifier backed by the external auth service.
///
/// Tokens are POSTed to `{base}/verify` with the role; the service answers
/// `{user_id}` for viewers, `{user_id, desktop_id, credential_fingerprint}`
/// for agents, or a non-2xx status on rejection.
pub struct RemoteVerifier {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteVerifier {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { base_url: base_url.trim_end_matches('/').to_owned(), client }
    }

    async fn post_verify(&self, token: &str, role: &str) -> Result<reqwest::Response, ErrorCode> {
        let body = serde_json::json!({ "token": token, "role": role });
        let response = self
            .client
            .post(format!("{}/verify", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                debug!(err = %e, "auth verifier unreachable");
                ErrorCode::Internal
            })?;
        if !response.status().is_success() {
            return Err(ErrorCode::Unauthorized);
        }
        Ok(response)
    }

    async fn verify_viewer(&self, token: &str) -> Result<ViewerIdentity, ErrorCode> {
        let response = self.post_verify(token, "viewer").await?;
        response.json().await.map_err(|_| ErrorCode::Internal)
    }

    async fn verify_agent(&self, token: &str) -> Result<AgentIdentity, ErrorCode> {
        let response = self.post_verify(token, "agent").await?;
        response.json().await.map_err(|_| ErrorCode::Internal)
    }
}

/// The broker's view of the external auth collaborator.
pub enum TokenVerifier {
    Static(StaticVerifier),
    Remote(RemoteVerifier),
}

impl TokenVerifier {
    pub async fn verify_viewer(&self, token: &str) -> Result<ViewerIdentity, ErrorCode> {
        if token.is_empty() {
            return Err(ErrorCode::Unauthorized);
        }
        match self {
            Self::Static(v) => v.verify_viewer(token),
            Self::Remote(v) => v.verify_viewer(token).await,
        }
    }

    pub async fn verify_agent(&self, token: &str) -> Result<AgentIdentity, ErrorCode> {
        if token.is_empty() {
            return Err(ErrorCode::Unauthorized);
        }
        match self {
            Self::Static(v) => v.verify_agent(token),
            Self::Remote(v) => v.verify_agent(token).await,
        }
    }
}

/// Blacklisted credential fingerprints, each entry expiring with the
/// credential it fingerprints.
#[derive(Default)]
pub struct Blacklist {
    entries: RwLock<HashMap<String, i64>>,
}

#[derive(Deserialize)]
struct BlacklistEntry {
    fingerprint: String,
    expires_at: i64,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read blacklist {}", path.display()))?;
        let parsed: Vec<BlacklistEntry> =
            serde_json::from_str(&contents).context("parse blacklist")?;
        let blacklist = Self::new();
        for entry in parsed {
            blacklist.insert(&entry.fingerprint, entry.expires_at);
        }
        Ok(blacklist)
    }

    pub fn insert(&self, fingerprint: &str, expires_at: i64) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(fingerprint.to_owned(), expires_at);
    }

    /// Whether a fingerprint is currently blacklisted. Expired entries are
    /// pruned on the way through.
    pub fn contains(&self, fingerprint: &str) -> bool {
        let now = epoch_ms();
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|_, expires_at| *expires_at > now);
        entries.contains_key(fingerprint)
    }
}

/// Extract a bearer token from an HTTP Authorization header.
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ")
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
