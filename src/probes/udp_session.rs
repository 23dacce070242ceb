// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! UDP send-session probe: aggregates kernel session events into one record
//! per socket, emitted at session end or expiry.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use serde_json::Value;
use tokio::sync::mpsc;
use bpf_common::{UdpSessionEvent, UdpSessionKind};
use crate::config::ProbeConfig;
use super::{session::SessionTracker, ProbeError, ProbeKind};

pub const NAME: &str = "udp_session";

pub struct UdpSession {
    tracker: Arc<Mutex<SessionTracker>>,
    session_max_duration: Duration,
}

impl ProbeKind for UdpSession {
    const NAME: &'static str = NAME;
    const PROGRAM_TEMPLATE: &'static str = include_str!("templates/udp_session.c");

    type Event = UdpSessionEvent;

    fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        config.filters()?;
        config.global_port_filter()?;
        Ok(UdpSession {
            tracker: Arc::new(Mutex::new(SessionTracker::new())),
            session_max_duration: Duration::from_secs(config.session_max_duration()?),
        })
    }

    fn template_vars(&self, _config: &ProbeConfig) -> Result<HashMap<String, String>, ProbeError> {
        Ok(HashMap::new())
    }

    fn enrich(&mut self, event: UdpSessionEvent) -> Option<Value> {
        let mut tracker = self.tracker.lock().unwrap();
        match event.kind {
            UdpSessionKind::Start => {
                tracker.on_start(event.pid, event.sock, event.daddr, event.dport);
                None
            },
            UdpSessionKind::Continue => {
                tracker.on_continue(event.sock, event.daddr, event.dport);
                None
            },
            UdpSessionKind::End => tracker.on_end(event.sock),
        }
    }

    /// The expirer: wake up every `session_max_duration`, mark idle
    /// sessions, then inject synthetic end events with the lock released.
    fn spawn_sidecars(&mut self, inject: mpsc::UnboundedSender<UdpSessionEvent>) {
        let tracker = self.tracker.clone();
        let max_duration = self.session_max_duration;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(max_duration).await;
                let expired = tracker
                    .lock()
                    .unwrap()
                    .collect_expired(max_duration.as_secs());
                for sock in expired {
                    let end = UdpSessionEvent {
                        kind: UdpSessionKind::End,
                        pid: 0,
                        sock,
                        daddr: 0,
                        dport: 0,
                    };
                    if inject.send(end).is_err() {
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::{UdpSessionEvent, UdpSessionKind};
    use crate::config::ProbeConfig;
    use crate::probes::ProbeKind;
    use super::UdpSession;

    fn event(kind: UdpSessionKind, sock: u64, daddr: u32, dport: u16) -> UdpSessionEvent {
        UdpSessionEvent {
            kind,
            pid: std::process::id(),
            sock,
            daddr,
            dport,
        }
    }

    #[test]
    fn only_session_end_produces_a_record() {
        let mut probe = UdpSession::from_config(&ProbeConfig::default()).unwrap();
        assert!(probe
            .enrich(event(UdpSessionKind::Start, 1, 0x0a0a0a0a, 1337))
            .is_none());
        assert!(probe
            .enrich(event(UdpSessionKind::Continue, 1, 0x7f000001, 1337))
            .is_none());
        let record = probe.enrich(event(UdpSessionKind::End, 1, 0, 0)).unwrap();

        assert_eq!(record["pid"], std::process::id());
        let destinations = record["destinations"].as_array().unwrap();
        assert_eq!(destinations.len(), 2);
        assert_eq!(destinations[0]["daddr"], "10.10.10.10");
        assert_eq!(destinations[1]["daddr"], "127.0.0.1");
    }

    #[test]
    fn end_without_session_is_swallowed() {
        let mut probe = UdpSession::from_config(&ProbeConfig::default()).unwrap();
        assert!(probe.enrich(event(UdpSessionKind::End, 9, 0, 0)).is_none());
    }

    #[test]
    fn default_session_duration_applies() {
        let probe = UdpSession::from_config(&ProbeConfig::default()).unwrap();
        assert_eq!(probe.session_max_duration.as_secs(), 120);
    }
}
