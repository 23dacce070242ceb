// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Listen-socket probe: kernel events for new listeners, snapshot
//! injection for listeners predating the program.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use bpf_common::NetListenEvent;
use crate::config::ProbeConfig;
use crate::util::{self, int_to_ip, namespace_inode};
use super::{
    crawl_or_partial, proctree_value, snapshot::{self, SnapshotFilter, SnapshotSettings},
    ProbeError, ProbeKind,
};

pub const NAME: &str = "net_listen";

fn protocol_name(protocol: u8) -> &'static str {
    match protocol {
        1 => "icmp",
        6 => "tcp",
        17 => "udp",
        132 => "sctp",
        _ => "unknown",
    }
}

pub struct NetListen {
    trace_tcp: bool,
    trace_udp: bool,
    same_namespace_only: bool,
    own_netns: Option<u64>,
    snapshot_filter: Arc<Mutex<SnapshotFilter>>,
    snapshot_periodicity: Option<Duration>,
}

impl ProbeKind for NetListen {
    const NAME: &'static str = NAME;
    const PROGRAM_TEMPLATE: &'static str = include_str!("templates/net_listen.c");

    type Event = NetListenEvent;

    fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let mut trace_tcp = false;
        let mut trace_udp = false;
        for protocol in config.protocols()? {
            match protocol.as_str() {
                "tcp" => trace_tcp = true,
                "udp" => trace_udp = true,
                other => {
                    return Err(ProbeError::Unsupported(format!(
                        "cannot trace protocol {}",
                        other,
                    )));
                },
            }
        }
        let same_namespace_only = config.same_namespace_only()?;
        let own_netns = util::self_namespace_inode("net").ok();
        if same_namespace_only && own_netns.is_none() {
            return Err(ProbeError::Unsupported(
                "same_namespace_only requires a readable /proc/self/ns/net".to_string(),
            ));
        }
        Ok(NetListen {
            trace_tcp,
            trace_udp,
            same_namespace_only,
            own_netns,
            snapshot_filter: Arc::new(Mutex::new(SnapshotFilter::from_config(config)?)),
            snapshot_periodicity: config.snapshot_periodicity()?.map(Duration::from_secs),
        })
    }

    fn template_vars(&self, _config: &ProbeConfig) -> Result<HashMap<String, String>, ProbeError> {
        let flag = |on: bool| (if on { "1" } else { "0" }).to_string();
        let mut vars = HashMap::new();
        vars.insert("trace_tcp".to_string(), flag(self.trace_tcp));
        vars.insert("trace_udp".to_string(), flag(self.trace_udp));
        Ok(vars)
    }

    fn enrich(&mut self, event: NetListenEvent) -> Option<Value> {
        if self.same_namespace_only {
            let event_ns = namespace_inode(event.pid, "net").ok();
            if event_ns != self.own_netns {
                return None;
            }
        }
        let (tree, error) = crawl_or_partial(event.pid);
        Some(json!({
            "pid": event.pid,
            "port": event.port,
            "proctree": proctree_value(&tree),
            "laddr": int_to_ip(event.laddr).to_string(),
            "protocol": protocol_name(event.protocol),
            "error": error,
        }))
    }

    fn spawn_sidecars(&mut self, inject: mpsc::UnboundedSender<NetListenEvent>) {
        if let Some(periodicity) = self.snapshot_periodicity {
            let settings = SnapshotSettings {
                periodicity,
                trace_tcp: self.trace_tcp,
                trace_udp: self.trace_udp,
                filter: self.snapshot_filter.clone(),
                same_namespace_only: self.same_namespace_only,
                own_netns: self.own_netns,
            };
            tokio::spawn(snapshot::run(settings, inject));
        }
    }

    fn on_hot_swap(&mut self, config: &ProbeConfig) {
        match SnapshotFilter::from_config(config) {
            Ok(filter) => *self.snapshot_filter.lock().unwrap() = filter,
            Err(error) => {
                tracing::error!(error = %error, "snapshot filter not updated on hot swap");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::NetListenEvent;
    use crate::config::ProbeConfig;
    use crate::probes::ProbeKind;
    use super::{protocol_name, NetListen};

    #[test]
    fn unsupported_protocol_is_fatal() {
        let config = ProbeConfig::from_yaml("protocols: [tcp, icmp]\n").unwrap();
        assert!(NetListen::from_config(&config).is_err());
    }

    #[test]
    fn protocols_default_to_tcp() {
        let probe = NetListen::from_config(&ProbeConfig::default()).unwrap();
        assert!(probe.trace_tcp);
        assert!(!probe.trace_udp);
    }

    #[test]
    fn template_flags_follow_protocols() {
        let config = ProbeConfig::from_yaml("protocols: [tcp, udp]\n").unwrap();
        let probe = NetListen::from_config(&config).unwrap();
        let vars = probe.template_vars(&config).unwrap();
        assert_eq!(vars["trace_tcp"], "1");
        assert_eq!(vars["trace_udp"], "1");
    }

    #[test]
    fn protocol_numbers_map_to_names() {
        assert_eq!(protocol_name(6), "tcp");
        assert_eq!(protocol_name(17), "udp");
        assert_eq!(protocol_name(250), "unknown");
    }

    #[test]
    fn enriched_record_names_the_protocol() {
        let mut probe = NetListen::from_config(&ProbeConfig::default()).unwrap();
        let own_pid = std::process::id();
        let record = probe
            .enrich(NetListenEvent {
                pid: own_pid,
                laddr: 0,
                port: 1337,
                protocol: 6,
            })
            .unwrap();
        assert_eq!(record["laddr"], "0.0.0.0");
        assert_eq!(record["port"], 1337);
        assert_eq!(record["protocol"], "tcp");
        assert_eq!(record["proctree"][0]["pid"], own_pid);
    }
}
