// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Per-event transformer plugins. The registry is fixed at build time and
//! keyed by name; each plugin declares which probes it supports, checked
//! when the probe instantiates it.

use serde_json::Value;
use serde_yaml::Mapping;
use thiserror::Error;

mod loginuidmap;
mod sourceipmap;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown plugin {0}")]
    Unknown(String),
    #[error("plugin {name} does not support probe {probe}")]
    UnsupportedProbe { name: String, probe: String },
    #[error("bad configuration for plugin {name}: {reason}")]
    Config { name: String, reason: String },
    #[error("plugin {name} failed to initialize: {reason}")]
    Init { name: String, reason: String },
}

/// Transforms an enriched event; the output feeds the next plugin in
/// declaration order.
pub trait EventPlugin: Send {
    fn process(&mut self, event: Value) -> Value;
}

#[derive(Debug, Clone, Copy)]
pub enum ProbeSupport {
    All,
    Probes(&'static [&'static str]),
}

impl ProbeSupport {
    fn supports(&self, probe: &str) -> bool {
        match self {
            ProbeSupport::All => true,
            ProbeSupport::Probes(probes) => probes.contains(&probe),
        }
    }
}

type Constructor = fn(&Mapping) -> Result<Box<dyn EventPlugin>, PluginError>;

pub struct Registration {
    pub name: &'static str,
    pub support: ProbeSupport,
    construct: Constructor,
}

static REGISTRY: &[Registration] = &[
    Registration {
        name: "loginuidmap",
        support: ProbeSupport::All,
        construct: loginuidmap::construct,
    },
    Registration {
        name: "sourceipmap",
        support: ProbeSupport::Probes(&["tcp_connect"]),
        construct: sourceipmap::construct,
    },
];

pub fn registry() -> &'static [Registration] {
    REGISTRY
}

pub fn is_registered(name: &str) -> bool {
    REGISTRY.iter().any(|r| r.name == name)
}

fn bool_arg(args: &Mapping, key: &str, default: bool) -> bool {
    args.get(&serde_yaml::Value::from(key))
        .and_then(serde_yaml::Value::as_bool)
        .unwrap_or(default)
}

/// Instantiate the plugins configured for a probe, in declaration order.
///
/// A plugin with `enabled: false` is skipped silently. A failing
/// constructor drops the plugin when it opted into
/// `unload_on_init_exception`, otherwise the failure is fatal to probe
/// startup.
pub fn load_plugins(
    probe: &str,
    configs: &Mapping,
) -> Result<Vec<Box<dyn EventPlugin>>, PluginError> {
    let mut plugins = Vec::new();
    for (name, args) in configs {
        let name = name.as_str().unwrap_or_default();
        let args = match args.as_mapping() {
            Some(args) => args.clone(),
            None => Mapping::new(),
        };
        if !bool_arg(&args, "enabled", true) {
            continue;
        }
        let unload_on_init_exception = bool_arg(&args, "unload_on_init_exception", false);

        let result = REGISTRY
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| PluginError::Unknown(name.to_string()))
            .and_then(|registration| {
                if !registration.support.supports(probe) {
                    return Err(PluginError::UnsupportedProbe {
                        name: name.to_string(),
                        probe: probe.to_string(),
                    });
                }
                (registration.construct)(&args)
            });
        match result {
            Ok(plugin) => plugins.push(plugin),
            Err(error) if unload_on_init_exception => {
                tracing::error!(plugin = name, error = %error, "plugin dropped on load failure");
            },
            Err(error) => return Err(error),
        }
    }
    Ok(plugins)
}

#[cfg(test)]
mod tests {
    use serde_yaml::Mapping;
    use super::load_plugins;

    fn configs(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn disabled_plugins_are_skipped() {
        let plugins = load_plugins(
            "tcp_connect",
            &configs("loginuidmap:\n  enabled: false\n"),
        )
        .unwrap();
        assert!(plugins.is_empty());
    }

    #[test]
    fn unknown_plugin_is_fatal() {
        assert!(load_plugins("tcp_connect", &configs("nope: {}\n")).is_err());
    }

    #[test]
    fn unknown_plugin_can_be_dropped() {
        let plugins = load_plugins(
            "tcp_connect",
            &configs("nope:\n  unload_on_init_exception: true\n"),
        )
        .unwrap();
        assert!(plugins.is_empty());
    }

    #[test]
    fn probe_support_is_enforced() {
        let error = match load_plugins("net_listen", &configs("sourceipmap:\n  hostfiles: []\n")) {
            Err(e) => e,
            Ok(_) => panic!("expected load_plugins to fail"),
        };
        assert!(matches!(
            error,
            super::PluginError::UnsupportedProbe { .. },
        ));
    }

    #[test]
    fn plugins_load_in_declared_order() {
        let plugins = load_plugins("tcp_connect", &configs("loginuidmap: {}\n")).unwrap();
        assert_eq!(plugins.len(), 1);
    }
}
