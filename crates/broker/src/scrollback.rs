// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session scrollback cache.
//!
//! Raw terminal bytes, appended as they arrive and never interpreted. Each
//! buffer is capped (oldest bytes drop off the front) and expires a fixed
//! interval after its last append. Ended sessions archive the buffer and
//! clear it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the sweeper looks for expired buffers.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Buffer {
    data: VecDeque<u8>,
    last_append: Instant,
}

/// Append-only byte log per active session, bounded by TTL and a size cap.
pub struct ScrollbackCache {
    buffers: Mutex<HashMap<i64, Buffer>>,
    ttl: Duration,
    cap: usize,
}

impl ScrollbackCache {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self { buffers: Mutex::new(HashMap::new()), ttl, cap }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Buffer>> {
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append raw bytes to a session's buffer, refreshing its TTL.
    ///
    /// Empty appends are a no-op and do not refresh the TTL.
    pub fn append(&self, session_id: i64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut buffers = self.lock();
        let buffer = buffers
            .entry(session_id)
            .or_insert_with(|| Buffer { data: VecDeque::new(), last_append: Instant::now() });
        buffer.data.extend(bytes.iter().copied());
        if buffer.data.len() > self.cap {
            let excess = buffer.data.len() - self.cap;
            buffer.data.drain(..excess);
        }
        buffer.last_append = Instant::now();
    }

    /// The entire buffered sequence for a session.
    pub fn read_all(&self, session_id: i64) -> Vec<u8> {
        let buffers = self.lock();
        buffers.get(&session_id).map(|b| b.data.iter().copied().collect()).unwrap_or_default()
    }

    /// The last `n` bytes, or everything if the buffer is shorter.
    pub fn read_tail(&self, session_id: i64, n: usize) -> Vec<u8> {
        let buffers = self.lock();
        match buffers.get(&session_id) {
            Some(b) => {
                let skip = b.data.len().saturating_sub(n);
                b.data.iter().skip(skip).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop a session's buffer outright. Called on archive.
    pub fn clear(&self, session_id: i64) {
        self.lock().remove(&session_id);
    }

    /// Atomically take a buffer's contents for archival, removing it.
    pub fn take(&self, session_id: i64) -> Vec<u8> {
        self.lock().remove(&session_id).map(|b| b.data.into_iter().collect()).unwrap_or_default()
    }

    /// Evict buffers idle past the TTL. Returns the evicted session ids.
    pub fn sweep(&self) -> Vec<i64> {
        let now = Instant::now();
        let mut buffers = self.lock();
        let expired: Vec<i64> = buffers
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_append) > self.ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            buffers.remove(id);
        }
        expired
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Run the TTL sweeper until shutdown.
pub async fn run_sweeper(cache: std::sync::Arc<ScrollbackCache>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = cache.sweep();
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "scrollback: evicted expired buffers");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "scrollback_tests.rs"]
mod tests;
