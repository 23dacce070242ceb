// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Compiles user filter records into the packed keys and values the kernel
//! maps expect, and provides the equivalent userland predicate used when
//! events are produced outside the kernel programs (snapshots).

use std::{collections::HashSet, net::Ipv4Addr};
use serde::Deserialize;
use thiserror::Error;
use bpf_common::{
    FilterKey, FilterValue, PortFilterArray, PortFilterMode, PortRange, NET_FILTER_MAX_PORT_RANGES,
};
use crate::util::ip_to_int;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("network mask {0} is not contiguous")]
    InvalidMask(Ipv4Addr),
    #[error("invalid port specification: {0}")]
    InvalidPort(String),
    #[error("global port filter cannot run in mode {0:?}")]
    InvalidMode(PortFilterMode),
}

/// One user-facing filter record: a network plus optional port scoping.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterRule {
    pub network: Ipv4Addr,
    pub network_mask: Ipv4Addr,
    #[serde(default)]
    pub except_ports: Vec<PortSpec>,
    #[serde(default)]
    pub include_ports: Vec<PortSpec>,
}

/// Port entry as written in configuration: a bare number or a `"from-to"`
/// range.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortSpec {
    Port(u64),
    Range(String),
}

impl PortSpec {
    /// Clamp to `1..=65535`; a bare port must already be in range, a range
    /// collapsing to nothing after clamping is an error.
    pub fn to_range(&self) -> Result<PortRange, FilterError> {
        match self {
            PortSpec::Port(port) => {
                if (1..=65535).contains(port) {
                    Ok(PortRange {
                        lower: *port as u16,
                        upper: *port as u16,
                    })
                } else {
                    Err(FilterError::InvalidPort(port.to_string()))
                }
            },
            PortSpec::Range(spec) => {
                let mut bounds = spec.splitn(2, '-');
                let lower_in = bounds.next().unwrap_or("");
                let upper_in = bounds.next();
                let parse = |s: &str| {
                    s.trim()
                        .parse::<u64>()
                        .map_err(|_| FilterError::InvalidPort(spec.clone()))
                };
                let lower_in = parse(lower_in)?;
                let upper_in = match upper_in {
                    Some(upper) => parse(upper)?,
                    None => lower_in,
                };
                let lower = lower_in.max(1);
                let upper = upper_in.min(65535);
                if lower > upper {
                    return Err(FilterError::InvalidPort(spec.clone()));
                }
                Ok(PortRange {
                    lower: lower as u16,
                    upper: upper as u16,
                })
            },
        }
    }
}

/// Number of leading one bits of a contiguous netmask.
pub fn netmask_to_prefix_len(mask: Ipv4Addr) -> Result<u32, FilterError> {
    let bits = ip_to_int(mask);
    let ones = bits.count_ones();
    let contiguous = if ones == 0 {
        bits == 0
    } else {
        bits == !0u32 << (32 - ones)
    };
    if contiguous {
        Ok(ones)
    } else {
        Err(FilterError::InvalidMask(mask))
    }
}

fn port_ranges(specs: &[PortSpec]) -> Result<Vec<PortRange>, FilterError> {
    specs.iter().map(PortSpec::to_range).collect()
}

/// Compile filter rules into LPM trie entries. Rules with equal masked
/// network and mask collapse to the same key, the later rule wins.
pub fn build_network_filters(
    rules: &[FilterRule],
) -> Result<Vec<(FilterKey, FilterValue)>, FilterError> {
    let mut entries = Vec::with_capacity(rules.len());
    for rule in rules {
        let prefix_len = netmask_to_prefix_len(rule.network_mask)?;
        let key = FilterKey {
            prefix_len,
            data: ip_to_int(rule.network) & ip_to_int(rule.network_mask),
        };

        let (mode, ranges) = if !rule.except_ports.is_empty() {
            (PortFilterMode::Exclude, port_ranges(&rule.except_ports)?)
        } else if !rule.include_ports.is_empty() {
            (PortFilterMode::Include, port_ranges(&rule.include_ports)?)
        } else {
            (PortFilterMode::All, Vec::new())
        };
        if ranges.len() > NET_FILTER_MAX_PORT_RANGES {
            return Err(FilterError::InvalidPort(format!(
                "{} port ranges supplied, at most {} fit a filter entry",
                ranges.len(),
                NET_FILTER_MAX_PORT_RANGES,
            )));
        }

        let mut value = FilterValue::all();
        value.mode = mode;
        value.range_count = ranges.len() as u8;
        value.ranges[..ranges.len()].copy_from_slice(&ranges);
        entries.push((key, value));
    }
    Ok(entries)
}

/// Expand global port entries into the full 65536-slot array image.
pub fn build_global_port_filter(
    ports: &[PortSpec],
    mode: PortFilterMode,
) -> Result<PortFilterArray, FilterError> {
    if mode == PortFilterMode::All {
        return Err(FilterError::InvalidMode(mode));
    }
    let mut array = PortFilterArray::new(mode);
    for spec in ports {
        let range = spec.to_range()?;
        for port in range.lower..=range.upper {
            array.set(port);
        }
    }
    Ok(array)
}

/// Userland rendering of the in-kernel network filter, applied to events
/// that did not pass through the kernel programs.
pub struct NetFilter {
    rules: Vec<CompiledRule>,
}

struct CompiledRule {
    subnet: u32,
    mask: u32,
    except_ports: HashSet<u16>,
    include_ports: HashSet<u16>,
}

/// Union of the ports named by a list of specs.
pub fn expand_ports(specs: &[PortSpec]) -> Result<HashSet<u16>, FilterError> {
    let mut ports = HashSet::new();
    for spec in specs {
        let range = spec.to_range()?;
        ports.extend(range.lower..=range.upper);
    }
    Ok(ports)
}

impl NetFilter {
    pub fn new(rules: &[FilterRule]) -> Result<Self, FilterError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    subnet: ip_to_int(rule.network) & ip_to_int(rule.network_mask),
                    mask: ip_to_int(rule.network_mask),
                    except_ports: expand_ports(&rule.except_ports)?,
                    include_ports: expand_ports(&rule.include_ports)?,
                })
            })
            .collect::<Result<_, FilterError>>()?;
        Ok(NetFilter { rules })
    }

    /// True when some rule covers the address and does not carve the port
    /// out, i.e. the kernel side would have suppressed this event.
    pub fn is_filtered(&self, addr: u32, port: u16) -> bool {
        self.rules.iter().any(|rule| {
            addr & rule.mask == rule.subnet
                && !rule.except_ports.contains(&port)
                && (rule.include_ports.is_empty() || rule.include_ports.contains(&port))
        })
    }
}
