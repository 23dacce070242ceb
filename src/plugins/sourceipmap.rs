// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Maps the source address of connection events to a host name through one
//! or more hosts-style files.

use std::{collections::HashMap, fs, path::Path};
use serde_json::Value;
use serde_yaml::Mapping;
use super::{EventPlugin, PluginError};

pub fn construct(args: &Mapping) -> Result<Box<dyn EventPlugin>, PluginError> {
    let attribute_key = args
        .get(&serde_yaml::Value::from("attribute_key"))
        .and_then(serde_yaml::Value::as_str)
        .unwrap_or("source_host")
        .to_string();
    let hostfiles: Vec<String> = args
        .get(&serde_yaml::Value::from("hostfiles"))
        .cloned()
        .map(serde_yaml::from_value)
        .transpose()
        .map_err(|e| PluginError::Config {
            name: "sourceipmap".to_string(),
            reason: format!("hostfiles must be a list of paths: {}", e),
        })?
        .ok_or_else(|| PluginError::Config {
            name: "sourceipmap".to_string(),
            reason: "hostfiles option not supplied".to_string(),
        })?;

    let mut hosts = HashMap::new();
    for file in &hostfiles {
        load_hosts(file, &mut hosts).map_err(|reason| PluginError::Init {
            name: "sourceipmap".to_string(),
            reason,
        })?;
    }
    Ok(Box::new(SourceIpMap {
        attribute_key,
        hosts,
    }))
}

fn load_hosts<P>(path: P, hosts: &mut HashMap<String, String>) -> Result<(), String>
where
    P: AsRef<Path>,
{
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.as_ref().display(), e))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        if let Some(address) = words.next() {
            hosts.insert(address.to_string(), words.collect::<Vec<_>>().join(" "));
        }
    }
    Ok(())
}

struct SourceIpMap {
    attribute_key: String,
    hosts: HashMap<String, String>,
}

impl EventPlugin for SourceIpMap {
    fn process(&mut self, mut event: Value) -> Value {
        let name = match event.get("saddr").and_then(Value::as_str) {
            Some(saddr) => self.hosts.get(saddr).cloned().unwrap_or_default(),
            None => return event,
        };
        event[self.attribute_key.as_str()] = name.into();
        event
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use serde_json::json;
    use serde_yaml::Mapping;
    use super::construct;

    fn args(hostfile: &str) -> Mapping {
        serde_yaml::from_str(&format!("hostfiles: [\"{}\"]\n", hostfile)).unwrap()
    }

    #[test]
    fn maps_known_source_addresses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# local names").unwrap();
        writeln!(file, "127.0.0.1 localhost loopback").unwrap();
        let mut plugin = construct(&args(&file.path().to_string_lossy())).unwrap();

        let mapped = plugin.process(json!({"saddr": "127.0.0.1"}));
        assert_eq!(mapped["source_host"], "localhost loopback");

        let unmapped = plugin.process(json!({"saddr": "10.0.0.1"}));
        assert_eq!(unmapped["source_host"], "");

        let no_saddr = plugin.process(json!({"pid": 1}));
        assert_eq!(no_saddr.get("source_host"), None);
    }

    #[test]
    fn missing_hostfile_fails_initialization() {
        assert!(construct(&args("/nonexistent/hosts")).is_err());
    }

    #[test]
    fn hostfiles_are_required() {
        assert!(construct(&Mapping::new()).is_err());
    }
}
