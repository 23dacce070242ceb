// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Per-probe configuration: YAML source with `!include` resolution, the
//! named store, and reload classification into hot swaps versus full
//! restarts.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    env, fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use bpf_common::PortFilterMode;
use crate::filtering::{FilterRule, PortSpec};

/// Top-level probe fields that may change without a process re-exec.
pub const HOT_SWAPPABLE: &[&str] = &["filters", "excludeports", "includeports", "container_labels"];

pub const SESSION_MAX_DURATION_DEFAULT: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to fetch remote include {url}: {reason}")]
    RemoteFetch { url: String, reason: String },
}

/// One probe's configuration. The raw mapping is kept as parsed so that
/// unknown keys still participate in change detection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeConfig {
    raw: Mapping,
}

impl ProbeConfig {
    pub fn from_mapping(raw: Mapping) -> Self {
        ProbeConfig { raw }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml)
            .map(ProbeConfig::from_mapping)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn raw(&self) -> &Mapping {
        &self.raw
    }

    fn field<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        self.raw
            .get(key)
            .cloned()
            .map(serde_yaml::from_value)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("field {}: {}", key, e)))
    }

    pub fn filters(&self) -> Result<Vec<FilterRule>, ConfigError> {
        Ok(self.field("filters")?.unwrap_or_default())
    }

    pub fn include_ports(&self) -> Result<Vec<PortSpec>, ConfigError> {
        Ok(self.field("includeports")?.unwrap_or_default())
    }

    pub fn exclude_ports(&self) -> Result<Vec<PortSpec>, ConfigError> {
        Ok(self.field("excludeports")?.unwrap_or_default())
    }

    /// The global port filter: at most one of `includeports` and
    /// `excludeports` may be populated.
    pub fn global_port_filter(&self) -> Result<(Vec<PortSpec>, PortFilterMode), ConfigError> {
        let include = self.include_ports()?;
        let exclude = self.exclude_ports()?;
        match (include.is_empty(), exclude.is_empty()) {
            (false, false) => Err(ConfigError::Invalid(
                "includeports and excludeports are mutually exclusive".to_string(),
            )),
            (false, true) => Ok((include, PortFilterMode::Include)),
            (true, false) => Ok((exclude, PortFilterMode::Exclude)),
            (true, true) => Ok((Vec::new(), PortFilterMode::All)),
        }
    }

    pub fn container_labels(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.field("container_labels")?.unwrap_or_default())
    }

    pub fn plugins(&self) -> Mapping {
        self.raw
            .get("plugins")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default()
    }

    pub fn protocols(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self
            .field("protocols")?
            .unwrap_or_else(|| vec!["tcp".to_string()]))
    }

    pub fn snapshot_periodicity(&self) -> Result<Option<u64>, ConfigError> {
        self.field("snapshot_periodicity")
    }

    pub fn same_namespace_only(&self) -> Result<bool, ConfigError> {
        Ok(self.field("same_namespace_only")?.unwrap_or(false))
    }

    pub fn session_max_duration(&self) -> Result<u64, ConfigError> {
        Ok(self
            .field("session_max_duration")?
            .unwrap_or(SESSION_MAX_DURATION_DEFAULT))
    }

    fn subset(&self, hot: bool) -> Mapping {
        self.raw
            .iter()
            .filter(|(key, _)| {
                key.as_str()
                    .map(|key| HOT_SWAPPABLE.contains(&key) == hot)
                    .unwrap_or(!hot)
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn hot_swappable(&self) -> Mapping {
        self.subset(true)
    }

    pub fn non_hot_swappable(&self) -> Mapping {
        self.subset(false)
    }
}

struct Loaded {
    probes: BTreeMap<String, ProbeConfig>,
    files: BTreeSet<PathBuf>,
}

fn load_value(path: &Path, files: &mut BTreeSet<PathBuf>) -> Result<Value, ConfigError> {
    files.insert(path.to_path_buf());
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_includes(value, base, files)
}

fn resolve_includes(
    value: Value,
    base: &Path,
    files: &mut BTreeSet<PathBuf>,
) -> Result<Value, ConfigError> {
    match value {
        Value::Tagged(tagged) => {
            if tagged.tag.to_string().trim_start_matches('!') != "include" {
                return Err(ConfigError::Invalid(format!(
                    "unsupported yaml tag {}",
                    tagged.tag,
                )));
            }
            let target = tagged
                .value
                .as_str()
                .ok_or_else(|| {
                    ConfigError::Invalid("!include expects a path or url".to_string())
                })?
                .to_string();
            if target.starts_with("http://") || target.starts_with("https://") {
                let local = fetch_remote(&target)?;
                load_value(&local, files)
            } else {
                let path = if Path::new(&target).is_absolute() {
                    PathBuf::from(&target)
                } else {
                    base.join(&target)
                };
                load_value(&path, files)
            }
        },
        Value::Mapping(mapping) => {
            let mut resolved = Mapping::new();
            for (key, value) in mapping {
                resolved.insert(key, resolve_includes(value, base, files)?);
            }
            Ok(Value::Mapping(resolved))
        },
        Value::Sequence(sequence) => Ok(Value::Sequence(
            sequence
                .into_iter()
                .map(|value| resolve_includes(value, base, files))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other),
    }
}

/// Fetch a remote include into the local cache, revalidating with the
/// stored `ETag` when one was served.
fn fetch_remote(url: &str) -> Result<PathBuf, ConfigError> {
    let error = |reason: String| ConfigError::RemoteFetch {
        url: url.to_string(),
        reason,
    };

    let cache_dir = env::temp_dir().join("nettrace-config-cache");
    fs::create_dir_all(&cache_dir).map_err(|e| error(e.to_string()))?;
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let cached = cache_dir.join(format!("{}.yaml", digest));
    let etag_path = cache_dir.join(format!("{}.etag", digest));

    let client = reqwest::blocking::Client::new();
    let mut request = client.get(url);
    let etag = fs::read_to_string(&etag_path).ok();
    if let (Some(etag), true) = (&etag, cached.exists()) {
        request = request.header(reqwest::header::IF_NONE_MATCH, etag.trim());
    }
    let response = request.send().map_err(|e| error(e.to_string()))?;

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(cached);
    }
    if !response.status().is_success() {
        return Err(error(format!("status {}", response.status())));
    }
    let new_etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().map_err(|e| error(e.to_string()))?;
    fs::write(&cached, body).map_err(|e| error(e.to_string()))?;
    match new_etag {
        Some(new_etag) => {
            fs::write(&etag_path, new_etag).map_err(|e| error(e.to_string()))?;
        },
        None => {
            let _ = fs::remove_file(&etag_path);
        },
    }
    Ok(cached)
}

fn parse_file(path: &Path) -> Result<Loaded, ConfigError> {
    let mut files = BTreeSet::new();
    let value = load_value(path, &mut files)?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => {
            return Err(ConfigError::Invalid(
                "top level of the config must be a mapping of probe names".to_string(),
            ));
        },
    };
    let mut probes = BTreeMap::new();
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| ConfigError::Invalid("probe names must be strings".to_string()))?;
        // underscore keys are reserved for anchors and agent internals
        if name.starts_with('_') {
            continue;
        }
        let config = value.as_mapping().cloned().ok_or_else(|| {
            ConfigError::Invalid(format!("probe {} must map to a configuration", name))
        })?;
        probes.insert(name.to_string(), ProbeConfig::from_mapping(config));
    }
    Ok(Loaded { probes, files })
}

fn mtimes(files: &BTreeSet<PathBuf>) -> BTreeMap<PathBuf, Option<SystemTime>> {
    files
        .iter()
        .map(|path| {
            let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
            (path.clone(), mtime)
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    Unchanged,
    HotSwapped(Vec<String>),
    FullRestart,
}

/// Named store of probe configurations plus per-probe hot-swap channels.
pub struct ConfigStore {
    path: PathBuf,
    probes: BTreeMap<String, ProbeConfig>,
    files: BTreeSet<PathBuf>,
    mtimes: BTreeMap<PathBuf, Option<SystemTime>>,
    change_txs: HashMap<String, mpsc::UnboundedSender<ProbeConfig>>,
    change_rxs: HashMap<String, mpsc::UnboundedReceiver<ProbeConfig>>,
}

impl ConfigStore {
    pub fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: Into<PathBuf>,
    {
        let path = path.into();
        let loaded = parse_file(&path)?;
        let mut change_txs = HashMap::new();
        let mut change_rxs = HashMap::new();
        for name in loaded.probes.keys() {
            let (tx, rx) = mpsc::unbounded_channel();
            change_txs.insert(name.clone(), tx);
            change_rxs.insert(name.clone(), rx);
        }
        Ok(ConfigStore {
            path,
            mtimes: mtimes(&loaded.files),
            probes: loaded.probes,
            files: loaded.files,
            change_txs,
            change_rxs,
        })
    }

    pub fn probes(&self) -> &BTreeMap<String, ProbeConfig> {
        &self.probes
    }

    /// The receiving end of a probe's hot-swap channel; each may be taken
    /// once, by the probe worker.
    pub fn take_change_receiver(&mut self, probe: &str) -> Option<mpsc::UnboundedReceiver<ProbeConfig>> {
        self.change_rxs.remove(probe)
    }

    /// Cheap mtime probe before a full reparse.
    pub fn reload_if_changed(&mut self) -> Result<ReloadOutcome, ConfigError> {
        if mtimes(&self.files) == self.mtimes {
            return Ok(ReloadOutcome::Unchanged);
        }
        self.reload()
    }

    /// Reparse the source and classify the difference. Errors leave the
    /// stored configuration untouched, so the running probes keep their
    /// current state.
    pub fn reload(&mut self) -> Result<ReloadOutcome, ConfigError> {
        let loaded = parse_file(&self.path)?;
        self.mtimes = mtimes(&loaded.files);

        if loaded.files != self.files {
            tracing::info!("config include graph changed, requesting restart");
            self.clear();
            return Ok(ReloadOutcome::FullRestart);
        }
        let old_names: Vec<&String> = self.probes.keys().collect();
        let new_names: Vec<&String> = loaded.probes.keys().collect();
        if old_names != new_names {
            tracing::info!("probe set changed, requesting restart");
            self.clear();
            return Ok(ReloadOutcome::FullRestart);
        }

        let mut swapped = Vec::new();
        for (name, new_config) in &loaded.probes {
            let old_config = &self.probes[name];
            if new_config == old_config {
                continue;
            }
            if new_config.non_hot_swappable() != old_config.non_hot_swappable() {
                tracing::info!(probe = name.as_str(), "non-hot-swappable key changed, requesting restart");
                self.clear();
                return Ok(ReloadOutcome::FullRestart);
            }
            swapped.push(name.clone());
        }
        if swapped.is_empty() {
            return Ok(ReloadOutcome::Unchanged);
        }
        for name in &swapped {
            let payload = loaded.probes[name].clone();
            if let Some(tx) = self.change_txs.get(name) {
                // a dropped receiver means the worker died, the watchdog
                // will notice separately
                let _ = tx.send(payload);
            }
            tracing::info!(probe = name.as_str(), "hot-swappable configuration change published");
        }
        self.probes = loaded.probes;
        Ok(ReloadOutcome::HotSwapped(swapped))
    }

    fn clear(&mut self) {
        self.probes.clear();
        self.change_txs.clear();
        self.change_rxs.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use super::{ConfigStore, ProbeConfig, ReloadOutcome};

    const BASE: &str = "---\nudp_session:\n  filters: [{network: 10.0.0.0, network_mask: 255.0.0.0}]\ntcp_connect:\n  filters: []\n  other: true\n_anchors:\n  ignored: true\n";

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn underscore_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.yml", BASE);
        let store = ConfigStore::load(path).unwrap();
        assert_eq!(
            store.probes().keys().collect::<Vec<_>>(),
            vec!["tcp_connect", "udp_session"],
        );
    }

    #[test]
    fn hot_swappable_change_is_published_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.yml", BASE);
        let mut store = ConfigStore::load(&path).unwrap();
        let mut rx = store.take_change_receiver("udp_session").unwrap();

        write(&dir, "config.yml", &BASE.replace("10.0.0.0", "10.1.0.0"));
        assert_eq!(
            store.reload().unwrap(),
            ReloadOutcome::HotSwapped(vec!["udp_session".to_string()]),
        );
        let payload = rx.try_recv().unwrap();
        assert_eq!(
            payload.filters().unwrap()[0].network,
            "10.1.0.0".parse::<std::net::Ipv4Addr>().unwrap(),
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_hot_swappable_change_requests_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.yml", BASE);
        let mut store = ConfigStore::load(&path).unwrap();

        write(&dir, "config.yml", &BASE.replace("other: true", "other: false"));
        assert_eq!(store.reload().unwrap(), ReloadOutcome::FullRestart);
        assert!(store.probes().is_empty());
    }

    #[test]
    fn probe_set_change_requests_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.yml", BASE);
        let mut store = ConfigStore::load(&path).unwrap();

        write(&dir, "config.yml", "---\ntcp_connect:\n  filters: []\n");
        assert_eq!(store.reload().unwrap(), ReloadOutcome::FullRestart);
    }

    #[test]
    fn unchanged_reload_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.yml", BASE);
        let mut store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.reload().unwrap(), ReloadOutcome::Unchanged);
        assert_eq!(store.reload_if_changed().unwrap(), ReloadOutcome::Unchanged);
    }

    #[test]
    fn includes_are_resolved_and_tracked() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "filters.yml", "[{network: 10.0.0.0, network_mask: 255.0.0.0}]");
        let path = write(
            &dir,
            "config.yml",
            "---\ntcp_connect:\n  filters: !include filters.yml\n",
        );
        let mut store = ConfigStore::load(&path).unwrap();
        assert_eq!(
            store.probes()["tcp_connect"].filters().unwrap().len(),
            1,
        );

        // editing the included file only is still a hot swap
        write(&dir, "filters.yml", "[{network: 10.2.0.0, network_mask: 255.255.0.0}]");
        assert_eq!(
            store.reload().unwrap(),
            ReloadOutcome::HotSwapped(vec!["tcp_connect".to_string()]),
        );

        // dropping the include changes the loaded-file set
        write(&dir, "config.yml", "---\ntcp_connect:\n  filters: []\n");
        assert_eq!(store.reload().unwrap(), ReloadOutcome::FullRestart);
    }

    #[test]
    fn port_filter_exclusivity_is_enforced() {
        let config = ProbeConfig::from_yaml("includeports: [80]\nexcludeports: [22]\n").unwrap();
        assert!(config.global_port_filter().is_err());

        let config = ProbeConfig::from_yaml("excludeports: [\"0-100\"]\n").unwrap();
        let (ports, mode) = config.global_port_filter().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(mode, bpf_common::PortFilterMode::Exclude);
    }
}
