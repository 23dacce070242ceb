// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Annotates every process-tree entry below init with the audit loginuid
//! and the matching account name.

use std::fs;
use serde_json::Value;
use serde_yaml::Mapping;
use crate::proctree;
use super::{EventPlugin, PluginError};

// unset loginuid reads as unsigned -1
const NO_LOGINUID: u32 = u32::MAX;

pub fn construct(_args: &Mapping) -> Result<Box<dyn EventPlugin>, PluginError> {
    Ok(Box::new(LoginuidMap))
}

struct LoginuidMap;

fn loginuid(pid: u64) -> Option<(u32, String)> {
    let raw = fs::read_to_string(format!("/proc/{}/loginuid", pid)).ok()?;
    let uid = raw.trim().parse::<u32>().ok()?;
    if uid == NO_LOGINUID {
        return None;
    }
    Some((uid, proctree::username(uid)))
}

impl EventPlugin for LoginuidMap {
    fn process(&mut self, mut event: Value) -> Value {
        if let Some(tree) = event.get_mut("proctree").and_then(Value::as_array_mut) {
            // proctree is ordered leaf to init
            for process in tree {
                if process.get("pid").and_then(Value::as_u64) == Some(1) {
                    break;
                }
                let pid = match process.get("pid").and_then(Value::as_u64) {
                    Some(pid) => pid,
                    None => continue,
                };
                if let Some((uid, name)) = loginuid(pid) {
                    process["loginuid"] = uid.into();
                    process["loginname"] = name.into();
                }
            }
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serde_yaml::Mapping;
    use super::{construct, EventPlugin};

    #[test]
    fn init_entry_is_left_alone() {
        let mut plugin = construct(&Mapping::new()).unwrap();
        let event = json!({
            "pid": 1,
            "proctree": [{"pid": 1, "cmdline": "init", "username": "root"}],
        });
        let processed = plugin.process(event.clone());
        assert_eq!(processed, event);
    }

    #[test]
    fn own_process_may_gain_loginuid() {
        let mut plugin = construct(&Mapping::new()).unwrap();
        let own_pid = std::process::id();
        let event = json!({
            "pid": own_pid,
            "proctree": [{"pid": own_pid, "cmdline": "test", "username": "root"}],
        });
        let processed = plugin.process(event);
        let entry = &processed["proctree"][0];
        // the tree entry either got both fields or neither, depending on
        // whether the test process has a loginuid set
        assert_eq!(
            entry.get("loginuid").is_some(),
            entry.get("loginname").is_some(),
        );
    }
}
