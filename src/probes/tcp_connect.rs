// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Outbound TCP connection probe.

use std::collections::HashMap;
use serde_json::{json, Value};
use bpf_common::TcpConnectEvent;
use crate::config::ProbeConfig;
use crate::util::int_to_ip;
use super::{crawl_or_partial, proctree_value, ProbeError, ProbeKind};

pub const NAME: &str = "tcp_connect";

pub struct TcpConnect;

impl ProbeKind for TcpConnect {
    const NAME: &'static str = NAME;
    const PROGRAM_TEMPLATE: &'static str = include_str!("templates/tcp_connect.c");

    type Event = TcpConnectEvent;

    fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        // surface filter mistakes before the kernel program is built
        config.filters()?;
        config.global_port_filter()?;
        Ok(TcpConnect)
    }

    fn template_vars(&self, _config: &ProbeConfig) -> Result<HashMap<String, String>, ProbeError> {
        Ok(HashMap::new())
    }

    fn enrich(&mut self, event: TcpConnectEvent) -> Option<Value> {
        let (tree, error) = crawl_or_partial(event.pid);
        Some(json!({
            "pid": event.pid,
            "proctree": proctree_value(&tree),
            "daddr": int_to_ip(event.daddr).to_string(),
            "saddr": int_to_ip(event.saddr).to_string(),
            "port": event.dport,
            "error": error,
        }))
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::TcpConnectEvent;
    use crate::config::ProbeConfig;
    use crate::probes::ProbeKind;
    use super::TcpConnect;

    #[test]
    fn enriched_record_carries_addresses_and_ancestry() {
        let mut probe = TcpConnect::from_config(&ProbeConfig::default()).unwrap();
        let own_pid = std::process::id();
        let record = probe
            .enrich(TcpConnectEvent {
                pid: own_pid,
                saddr: 0x7f000001,
                daddr: 0x0a010203,
                dport: 80,
            })
            .unwrap();

        assert_eq!(record["pid"], own_pid);
        assert_eq!(record["daddr"], "10.1.2.3");
        assert_eq!(record["saddr"], "127.0.0.1");
        assert_eq!(record["port"], 80);
        assert_eq!(record["error"], "");
        assert_eq!(record["proctree"][0]["pid"], own_pid);
    }

    #[test]
    fn vanished_process_is_embedded_as_error() {
        let mut probe = TcpConnect::from_config(&ProbeConfig::default()).unwrap();
        let record = probe
            .enrich(TcpConnectEvent {
                pid: u32::MAX / 2,
                saddr: 0,
                daddr: 0,
                dport: 1,
            })
            .unwrap();
        assert_ne!(record["error"], "");
        assert_eq!(record["proctree"].as_array().unwrap().len(), 0);
    }
}
