// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Owner of the two kernel-resident filter maps of a probe. All mutation
//! goes through [`FilterMapManager::apply`] under one mutex; writes are
//! additive first and subtractive second, so a concurrent kernel reader may
//! briefly see a superset of the target filter but never a hole.

use std::{collections::HashMap, sync::Mutex};
use thiserror::Error;
use bpf_common::{PortFilterArray, PortFilterMode};
use crate::{
    filtering::{self, FilterError, FilterRule, PortSpec},
    kernel::{KernelError, KernelMap, MapRef},
};

// trie sizing: step above the rule count with headroom, bounded
const LPM_CAPACITY_STEP: usize = 512;
const LPM_CAPACITY_HEADROOM: usize = 128;
const LPM_CAPACITY_MAX: usize = 4096;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub struct FilterMapManager {
    inner: Mutex<Maps>,
}

struct Maps {
    net_filter: MapRef,
    port_filter: MapRef,
}

impl FilterMapManager {
    pub fn new(net_filter: MapRef, port_filter: MapRef) -> Self {
        FilterMapManager {
            inner: Mutex::new(Maps {
                net_filter,
                port_filter,
            }),
        }
    }

    /// Trie capacity to template into the kernel program for a given rule
    /// count.
    pub fn lpm_capacity(rule_count: usize) -> usize {
        let want = rule_count + LPM_CAPACITY_HEADROOM;
        let stepped = (want + LPM_CAPACITY_STEP - 1) / LPM_CAPACITY_STEP * LPM_CAPACITY_STEP;
        stepped.min(LPM_CAPACITY_MAX)
    }

    /// Bring both maps to the state described by `rules` and the global
    /// port set. With `diff` set, only keys that changed are touched;
    /// otherwise every target key is rewritten. Either way stale keys are
    /// removed last.
    pub fn apply(
        &self,
        rules: &[FilterRule],
        ports: &[PortSpec],
        mode: PortFilterMode,
        diff: bool,
    ) -> Result<(), ApplyError> {
        let guard = self.inner.lock().unwrap();
        let net_target: HashMap<Vec<u8>, Vec<u8>> = filtering::build_network_filters(rules)?
            .into_iter()
            .map(|(key, value)| (key.to_bytes().to_vec(), value.to_bytes().to_vec()))
            .collect();
        let port_target = if mode == PortFilterMode::All {
            PortFilterArray::new(PortFilterMode::All)
        } else {
            filtering::build_global_port_filter(ports, mode)?
        };
        Self::apply_net(&guard.net_filter, &net_target, diff)?;
        Self::apply_ports(&guard.port_filter, &port_target, diff)?;
        Ok(())
    }

    fn apply_net(
        net_filter: &MapRef,
        target: &HashMap<Vec<u8>, Vec<u8>>,
        diff: bool,
    ) -> Result<(), KernelError> {
        let mut map = net_filter.lock().unwrap();
        let current = map.keys();
        for (key, value) in target {
            if diff && map.get(key).as_deref() == Some(value.as_slice()) {
                continue;
            }
            map.set(key, value)?;
        }
        for key in current {
            if !target.contains_key(&key) {
                map.delete(&key)?;
            }
        }
        Ok(())
    }

    fn apply_ports(
        port_filter: &MapRef,
        target: &PortFilterArray,
        diff: bool,
    ) -> Result<(), KernelError> {
        let mut map = port_filter.lock().unwrap();
        let current = map.keys();
        let mode_key = 0u32.to_ne_bytes();
        let mode_value = [target.mode() as u8];
        if !diff || map.get(&mode_key).as_deref() != Some(&mode_value[..]) {
            map.set(&mode_key, &mode_value)?;
        }
        for port in target.ports() {
            let key = u32::from(port).to_ne_bytes();
            if diff && map.get(&key).as_deref() == Some(&[1][..]) {
                continue;
            }
            map.set(&key, &[1])?;
        }
        for key in current {
            if key == mode_key {
                continue;
            }
            let port = match slot_port(&key) {
                Some(port) => port,
                None => continue,
            };
            if !target.contains(port) {
                map.delete(&key)?;
            }
        }
        Ok(())
    }
}

fn slot_port(key: &[u8]) -> Option<u16> {
    if key.len() == 4 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(key);
        let slot = u32::from_ne_bytes(bytes);
        if slot > 0 && slot < 0x10000 {
            return Some(slot as u16);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use bpf_common::PortFilterMode;
    use crate::filtering::{FilterRule, PortSpec};
    use crate::kernel::mock::{MapOp, MemoryMap};
    use crate::kernel::MapRef;
    use super::FilterMapManager;

    fn rule(network: &str, mask: &str, except: &[u64]) -> FilterRule {
        FilterRule {
            network: network.parse().unwrap(),
            network_mask: mask.parse().unwrap(),
            except_ports: except.iter().copied().map(PortSpec::Port).collect(),
            include_ports: vec![],
        }
    }

    fn fixture() -> (
        FilterMapManager,
        std::sync::Arc<std::sync::Mutex<MemoryMap>>,
        std::sync::Arc<std::sync::Mutex<MemoryMap>>,
    ) {
        let net = MemoryMap::shared();
        let ports = MemoryMap::shared();
        let net_ref: MapRef = net.clone();
        let ports_ref: MapRef = ports.clone();
        let manager = FilterMapManager::new(net_ref, ports_ref);
        (manager, net, ports)
    }

    fn snapshot(map: &std::sync::Arc<std::sync::Mutex<MemoryMap>>) -> BTreeMap<Vec<u8>, Vec<u8>> {
        map.lock().unwrap().entries().clone()
    }

    #[test]
    fn apply_is_idempotent() {
        let (manager, net, ports) = fixture();
        let rules = [
            rule("10.0.0.0", "255.0.0.0", &[22]),
            rule("192.168.0.0", "255.255.0.0", &[]),
        ];
        let port_spec = [PortSpec::Range("8000-8010".to_string())];

        manager
            .apply(&rules, &port_spec, PortFilterMode::Exclude, false)
            .unwrap();
        let net_before = snapshot(&net);
        let ports_before = snapshot(&ports);
        assert_eq!(net_before.len(), 2);
        // mode slot plus 11 ports
        assert_eq!(ports_before.len(), 12);

        manager
            .apply(&rules, &port_spec, PortFilterMode::Exclude, false)
            .unwrap();
        assert_eq!(snapshot(&net), net_before);
        assert_eq!(snapshot(&ports), ports_before);
    }

    #[test]
    fn diff_touches_only_changed_keys() {
        let (manager, net, _ports) = fixture();
        let kept = rule("10.0.0.0", "255.0.0.0", &[22]);
        let dropped = rule("172.16.0.0", "255.240.0.0", &[]);
        let added = rule("192.168.0.0", "255.255.0.0", &[]);

        manager
            .apply(
                &[kept.clone(), dropped.clone()],
                &[],
                PortFilterMode::All,
                false,
            )
            .unwrap();
        net.lock().unwrap().take_ops();

        manager
            .apply(&[kept, added], &[], PortFilterMode::All, true)
            .unwrap();
        let ops = net.lock().unwrap().take_ops();
        let added_key = crate::filtering::build_network_filters(&[rule(
            "192.168.0.0",
            "255.255.0.0",
            &[],
        )])
        .unwrap()[0]
            .0
            .to_bytes()
            .to_vec();
        let dropped_key = crate::filtering::build_network_filters(&[rule(
            "172.16.0.0",
            "255.240.0.0",
            &[],
        )])
        .unwrap()[0]
            .0
            .to_bytes()
            .to_vec();
        assert_eq!(ops, vec![MapOp::Set(added_key), MapOp::Delete(dropped_key)]);
    }

    #[test]
    fn diff_clears_stale_port_slots() {
        let (manager, _net, ports) = fixture();
        manager
            .apply(
                &[],
                &[PortSpec::Port(80), PortSpec::Port(443)],
                PortFilterMode::Include,
                false,
            )
            .unwrap();
        ports.lock().unwrap().take_ops();

        manager
            .apply(&[], &[PortSpec::Port(443)], PortFilterMode::Include, true)
            .unwrap();
        let ops = ports.lock().unwrap().take_ops();
        assert_eq!(ops, vec![MapOp::Delete(80u32.to_ne_bytes().to_vec())]);
    }

    #[test]
    fn all_mode_resets_port_slots() {
        let (manager, _net, ports) = fixture();
        manager
            .apply(&[], &[PortSpec::Port(80)], PortFilterMode::Exclude, false)
            .unwrap();
        manager.apply(&[], &[], PortFilterMode::All, true).unwrap();
        let entries = snapshot(&ports);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries.get(&0u32.to_ne_bytes().to_vec()).map(Vec::as_slice),
            Some(&[0u8][..]),
        );
    }

    #[test]
    fn capacity_steps_and_caps() {
        assert_eq!(FilterMapManager::lpm_capacity(0), 512);
        assert_eq!(FilterMapManager::lpm_capacity(100), 512);
        assert_eq!(FilterMapManager::lpm_capacity(500), 1024);
        assert_eq!(FilterMapManager::lpm_capacity(100_000), 4096);
    }
}
