// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Periodic enumeration of already-existing listeners. The kernel program
//! only sees listen operations that happen after it attached; this sidecar
//! fills the gap from `/proc/net`, applying the same filter predicates in
//! userland before injecting synthetic raw events.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use procfs::net::{TcpState, UdpState};
use procfs::process::FDTarget;
use tokio::sync::mpsc;
use bpf_common::{NetListenEvent, PortFilterMode};
use crate::config::ProbeConfig;
use crate::filtering::{self, NetFilter};
use crate::probes::ProbeError;
use crate::util::{self, namespace_inode};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

// avoid amplifying restart storms with an immediate full /proc sweep
const STARTUP_DELAY: Duration = Duration::from_secs(300);

/// The filter predicates mirrored from the kernel maps; shared with the
/// probe so hot swaps reach the next snapshot round.
pub struct SnapshotFilter {
    pub net_filter: NetFilter,
    pub port_mode: PortFilterMode,
    pub ports: HashSet<u16>,
}

impl SnapshotFilter {
    pub fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let (port_specs, port_mode) = config.global_port_filter()?;
        Ok(SnapshotFilter {
            net_filter: NetFilter::new(&config.filters()?)?,
            port_mode,
            ports: filtering::expand_ports(&port_specs)?,
        })
    }
}

#[derive(Clone)]
pub struct SnapshotSettings {
    pub periodicity: Duration,
    pub trace_tcp: bool,
    pub trace_udp: bool,
    pub filter: Arc<Mutex<SnapshotFilter>>,
    pub same_namespace_only: bool,
    pub own_netns: Option<u64>,
}

/// One system socket as found in `/proc/net`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEntry {
    pub pid: Option<u32>,
    pub addr: u32,
    pub port: u16,
    pub protocol: u8,
}

/// Apply the in-kernel predicates to snapshot entries.
pub fn filter_entries(
    settings: &SnapshotSettings,
    entries: Vec<ListenerEntry>,
) -> Vec<NetListenEvent> {
    let filter = settings.filter.lock().unwrap();
    entries
        .into_iter()
        .filter_map(|entry| {
            let pid = entry.pid?;
            if pid == 0 {
                return None;
            }
            match entry.protocol {
                PROTO_TCP if !settings.trace_tcp => return None,
                PROTO_UDP if !settings.trace_udp => return None,
                _ => {},
            }
            match filter.port_mode {
                PortFilterMode::Exclude if filter.ports.contains(&entry.port) => return None,
                PortFilterMode::Include if !filter.ports.contains(&entry.port) => return None,
                _ => {},
            }
            if filter.net_filter.is_filtered(entry.addr, entry.port) {
                return None;
            }
            if settings.same_namespace_only {
                let own = settings.own_netns?;
                if namespace_inode(pid, "net").ok() != Some(own) {
                    return None;
                }
            }
            Some(NetListenEvent {
                pid,
                laddr: entry.addr,
                port: entry.port,
                protocol: entry.protocol,
            })
        })
        .collect()
}

/// System-wide IPv4 listener scan: TCP sockets in LISTEN, UDP sockets that
/// are unconnected datagram receivers.
fn enumerate() -> anyhow::Result<Vec<ListenerEntry>> {
    let mut socket_pids = std::collections::HashMap::new();
    for process in procfs::process::all_processes()? {
        let process = match process {
            Ok(process) => process,
            Err(_) => continue,
        };
        let pid = process.pid();
        let fds = match process.fd() {
            Ok(fds) => fds,
            Err(_) => continue,
        };
        for fd in fds.flatten() {
            if let FDTarget::Socket(inode) = fd.target {
                socket_pids.insert(inode, pid as u32);
            }
        }
    }

    let mut entries = Vec::new();
    for entry in procfs::net::tcp()? {
        if entry.state != TcpState::Listen {
            continue;
        }
        if let std::net::SocketAddr::V4(address) = entry.local_address {
            entries.push(ListenerEntry {
                pid: socket_pids.get(&entry.inode).copied(),
                addr: u32::from(*address.ip()),
                port: address.port(),
                protocol: PROTO_TCP,
            });
        }
    }
    for entry in procfs::net::udp()? {
        if entry.state != UdpState::Close {
            continue;
        }
        if let std::net::SocketAddr::V4(address) = entry.local_address {
            entries.push(ListenerEntry {
                pid: socket_pids.get(&entry.inode).copied(),
                addr: u32::from(*address.ip()),
                port: address.port(),
                protocol: PROTO_UDP,
            });
        }
    }
    Ok(entries)
}

/// Sidecar loop: sleep through the startup window, then scan and inject on
/// every period. The scan runs on the blocking pool, `/proc` walks are not
/// async-friendly.
pub async fn run(settings: SnapshotSettings, inject: mpsc::UnboundedSender<NetListenEvent>) {
    tokio::time::sleep(STARTUP_DELAY).await;
    util::retry_forever("snapshot", move || {
        let settings = settings.clone();
        let inject = inject.clone();
        async move {
            loop {
                let entries = tokio::task::spawn_blocking(enumerate).await??;
                for event in filter_entries(&settings, entries) {
                    if inject.send(event).is_err() {
                        // probe is shutting down
                        return Ok(());
                    }
                }
                tokio::time::sleep(settings.periodicity).await;
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
        time::Duration,
    };
    use bpf_common::PortFilterMode;
    use crate::filtering::{FilterRule, NetFilter};
    use super::{
        filter_entries, ListenerEntry, SnapshotFilter, SnapshotSettings, PROTO_TCP, PROTO_UDP,
    };

    fn settings(ports: &[u16], mode: PortFilterMode) -> SnapshotSettings {
        SnapshotSettings {
            periodicity: Duration::from_secs(10),
            trace_tcp: true,
            trace_udp: true,
            filter: Arc::new(Mutex::new(SnapshotFilter {
                net_filter: NetFilter::new(&[]).unwrap(),
                port_mode: mode,
                ports: ports.iter().copied().collect::<HashSet<u16>>(),
            })),
            same_namespace_only: false,
            own_netns: None,
        }
    }

    fn loopback(pid: Option<u32>, port: u16, protocol: u8) -> ListenerEntry {
        ListenerEntry {
            pid,
            addr: 0x7f000001,
            port,
            protocol,
        }
    }

    #[test]
    fn excluded_ports_and_pidless_sockets_are_dropped() {
        let excluded: Vec<u16> = (1..=100).collect();
        let events = filter_entries(
            &settings(&excluded, PortFilterMode::Exclude),
            vec![
                loopback(Some(111), 1337, PROTO_TCP),
                loopback(Some(112), 80, PROTO_TCP),
                loopback(Some(113), 7331, PROTO_UDP),
                loopback(None, 9999, PROTO_TCP),
            ],
        );
        assert_eq!(
            events.iter().map(|e| e.pid).collect::<Vec<_>>(),
            vec![111, 113],
        );
        assert_eq!(events[0].protocol, PROTO_TCP);
        assert_eq!(events[1].protocol, PROTO_UDP);
    }

    #[test]
    fn protocol_selection_is_honored() {
        let mut tcp_only = settings(&[], PortFilterMode::All);
        tcp_only.trace_udp = false;
        let events = filter_entries(
            &tcp_only,
            vec![
                loopback(Some(1), 80, PROTO_TCP),
                loopback(Some(2), 53, PROTO_UDP),
            ],
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pid, 1);
    }

    #[test]
    fn network_filter_suppresses_snapshot_events() {
        let with_filter = settings(&[], PortFilterMode::All);
        with_filter.filter.lock().unwrap().net_filter = NetFilter::new(&[FilterRule {
            network: "127.0.0.0".parse().unwrap(),
            network_mask: "255.0.0.0".parse().unwrap(),
            except_ports: vec![],
            include_ports: vec![],
        }])
        .unwrap();
        let events = filter_entries(
            &with_filter,
            vec![
                loopback(Some(1), 80, PROTO_TCP),
                ListenerEntry {
                    pid: Some(2),
                    addr: 0x0a000001,
                    port: 80,
                    protocol: PROTO_TCP,
                },
            ],
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pid, 2);
    }
}
