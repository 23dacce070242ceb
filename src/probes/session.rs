// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Aggregation of UDP send-session events into per-socket session records.
//! All mutation happens under the probe's session lock; the clock is
//! injected so expiry and durations are testable.

use std::{collections::HashMap, sync::Arc, time::Instant};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use crate::probes::{crawl_or_partial, proctree_value};
use crate::proctree::ProcessInfo;
use crate::util::int_to_ip;

pub const EXPIRED_ERROR: &str = "session_max_duration_exceeded";

/// Monotonic seconds source.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

static MONOTONIC_START: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_clock() -> Clock {
    Arc::new(|| MONOTONIC_START.elapsed().as_secs())
}

struct Destination {
    daddr: u32,
    dport: u16,
    first_seen: u64,
    msg_count: u64,
}

struct Session {
    pid: u32,
    proctree: Vec<ProcessInfo>,
    error: String,
    // insertion-ordered so records list destinations as first contacted
    destinations: Vec<Destination>,
    last_update: u64,
}

pub struct SessionTracker {
    sessions: HashMap<u64, Session>,
    clock: Clock,
}

impl Default for SessionTracker {
    fn default() -> Self {
        SessionTracker::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        SessionTracker::with_clock(monotonic_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        SessionTracker {
            sessions: HashMap::new(),
            clock,
        }
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A new session on this socket; an existing one is overwritten, the
    /// kernel reuses socket objects.
    pub fn on_start(&mut self, pid: u32, sock: u64, daddr: u32, dport: u16) {
        let now = self.now();
        let (proctree, error) = crawl_or_partial(pid);
        self.sessions.insert(
            sock,
            Session {
                pid,
                proctree,
                error,
                destinations: vec![Destination {
                    daddr,
                    dport,
                    first_seen: now,
                    msg_count: 1,
                }],
                last_update: now,
            },
        );
    }

    pub fn on_continue(&mut self, sock: u64, daddr: u32, dport: u16) {
        let now = self.now();
        let session = match self.sessions.get_mut(&sock) {
            Some(session) => session,
            None => {
                // the kernel saw the start before we did (program reload
                // mid-session); dropping matches what the record would
                // otherwise fabricate
                tracing::debug!(sock, "continue event for untracked session dropped");
                return;
            },
        };
        match session
            .destinations
            .iter_mut()
            .find(|d| d.daddr == daddr && d.dport == dport)
        {
            Some(destination) => destination.msg_count += 1,
            None => session.destinations.push(Destination {
                daddr,
                dport,
                first_seen: now,
                msg_count: 1,
            }),
        }
        session.last_update = now;
    }

    /// Finalize and emit the session record.
    pub fn on_end(&mut self, sock: u64) -> Option<Value> {
        let now = self.now();
        let session = self.sessions.remove(&sock)?;
        let destinations: Vec<Value> = session
            .destinations
            .iter()
            .map(|d| {
                json!({
                    "daddr": int_to_ip(d.daddr).to_string(),
                    "port": d.dport,
                    "duration": now - d.first_seen,
                    "msg_count": d.msg_count,
                })
            })
            .collect();
        Some(json!({
            "pid": session.pid,
            "proctree": proctree_value(&session.proctree),
            "destinations": destinations,
            "error": session.error,
        }))
    }

    /// Mark sessions idle past `max_duration` and return their keys; the
    /// caller injects synthetic end events outside the lock.
    pub fn collect_expired(&mut self, max_duration: u64) -> Vec<u64> {
        let now = self.now();
        let mut expired = Vec::new();
        for (&sock, session) in &mut self.sessions {
            if now.saturating_sub(session.last_update) > max_duration {
                session.error = EXPIRED_ERROR.to_string();
                expired.push(sock);
            }
        }
        expired
    }
}
