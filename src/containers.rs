// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Container discovery through the runtime CLI. Neither containerd nor
//! docker expose a uniform in-process API, so listing, inspection and the
//! event stream all go through subprocesses of the detected CLI.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    path::Path,
    process::{Command, Stdio},
    sync::Mutex,
    thread,
    time::Duration,
};
use lru::LruCache;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::mpsc;
use crate::util::namespace_inode;

// containerd in Kubernetes keeps its task tree here; its presence is the
// only reliable marker short of talking CRI
const CONTAINERD_TASK_ROOT: &str = "/var/run/containerd/io.containerd.runtime.v2.task/k8s.io";

const INSPECT_CACHE_SIZE: usize = 2048;
const MNTNS_CACHE_SIZE: usize = 20480;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Containerd,
}

impl ContainerRuntime {
    pub fn cli(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Containerd => "nerdctl",
        }
    }
}

static RUNTIME: Lazy<ContainerRuntime> = Lazy::new(|| {
    if Path::new(CONTAINERD_TASK_ROOT).exists() {
        ContainerRuntime::Containerd
    } else {
        ContainerRuntime::Docker
    }
});

pub fn detect_runtime() -> ContainerRuntime {
    *RUNTIME
}

struct Caches {
    // container id -> main pid
    inspect: LruCache<String, i32>,
    // container id -> mount namespace inode
    mntns: LruCache<String, i64>,
}

static CACHES: Lazy<Mutex<Caches>> = Lazy::new(|| {
    Mutex::new(Caches {
        inspect: LruCache::new(INSPECT_CACHE_SIZE),
        mntns: LruCache::new(MNTNS_CACHE_SIZE),
    })
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerEventType {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub event_type: ContainerEventType,
    pub id: String,
}

/// Resolved container attribution record; `ns_inode` of 0 with a stop event
/// means plain removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMountNs {
    pub container_id: String,
    pub container_name: String,
    pub ns_inode: u64,
    pub event_type: ContainerEventType,
}

fn cli_output(args: &[&str]) -> Result<String, String> {
    let output = Command::new(detect_runtime().cli())
        .args(args)
        .output()
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(format!(
            "{} {} exited with {}",
            detect_runtime().cli(),
            args.first().unwrap_or(&""),
            output.status,
        ));
    }
    String::from_utf8(output.stdout).map_err(|e| e.to_string())
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter(|clause| !clause.is_empty())
        .map(|clause| {
            let mut parts = clause.splitn(2, '=');
            let key = parts.next().unwrap_or("").to_string();
            let value = parts.next().unwrap_or("").to_string();
            (key, value)
        })
        .collect()
}

fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let mut fields = line.splitn(3, '|');
    Some(ContainerSummary {
        id: fields.next()?.to_string(),
        name: fields.next()?.to_string(),
        labels: parse_labels(fields.next().unwrap_or("")),
    })
}

/// A pattern set is a comma-separated list of `label=glob` clauses (a bare
/// `label` checks presence); all clauses of a set must match.
fn matches_pattern_set(labels: &HashMap<String, String>, set: &str) -> bool {
    set.split(',').filter(|c| !c.is_empty()).all(|clause| {
        let mut parts = clause.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        match parts.next() {
            None => labels.contains_key(key),
            Some(pattern) => match glob::Pattern::new(pattern) {
                Ok(pattern) => labels
                    .get(key)
                    .map(|value| pattern.matches(value))
                    .unwrap_or(false),
                Err(error) => {
                    tracing::warn!(clause, error = %error, "bad label pattern, clause ignored");
                    false
                },
            },
        }
    })
}

fn matches_any(labels: &HashMap<String, String>, patterns: &[String]) -> bool {
    patterns.iter().any(|set| matches_pattern_set(labels, set))
}

/// Running containers whose labels satisfy any of the given pattern sets.
pub fn list_matching(patterns: &[String]) -> Vec<ContainerSummary> {
    let output = match cli_output(&[
        "ps",
        "--no-trunc",
        "--format",
        "{{.ID}}|{{.Names}}|{{.Labels}}",
    ]) {
        Ok(output) => output,
        Err(error) => {
            tracing::error!(error = %error, "failed to list running containers");
            return Vec::new();
        },
    };
    output
        .lines()
        .filter_map(parse_ps_line)
        .filter(|summary| patterns.is_empty() || matches_any(&summary.labels, patterns))
        .collect()
}

fn inspect_main_pid(id: &str) -> Result<i32, String> {
    if let Some(&pid) = CACHES.lock().unwrap().inspect.get(&id.to_string()) {
        return Ok(pid);
    }
    let pid = cli_output(&["inspect", "-f", "{{.State.Pid}}", id])?
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("unparsable pid: {}", e))?;
    if pid > 0 {
        CACHES.lock().unwrap().inspect.put(id.to_string(), pid);
    }
    Ok(pid)
}

/// Mount namespace inode of a container's main process, or -1 when it
/// cannot be resolved. A zero pid means we raced the container start, so
/// one retry after a grace period.
pub fn resolve_mount_ns(id: &str) -> i64 {
    if let Some(&inode) = CACHES.lock().unwrap().mntns.get(&id.to_string()) {
        return inode;
    }
    let mut pid = match inspect_main_pid(id) {
        Ok(pid) => pid,
        Err(error) => {
            tracing::error!(container = id, error = %error, "container inspect failed");
            return -1;
        },
    };
    if pid == 0 {
        thread::sleep(Duration::from_millis(500));
        pid = inspect_main_pid(id).unwrap_or(0);
    }
    if pid <= 0 {
        return -1;
    }
    match namespace_inode(pid as u32, "mnt") {
        Ok(inode) => {
            CACHES
                .lock()
                .unwrap()
                .mntns
                .put(id.to_string(), inode as i64);
            inode as i64
        },
        Err(error) => {
            tracing::error!(container = id, pid, error = %error, "cannot read mount namespace");
            -1
        },
    }
}

fn container_name(id: &str) -> String {
    cli_output(&["inspect", "-f", "{{.Name}}", id])
        .map(|out| out.trim().trim_start_matches('/').to_string())
        .unwrap_or_default()
}

fn container_labels(id: &str) -> HashMap<String, String> {
    cli_output(&["inspect", "-f", "{{json .Config.Labels}}", id])
        .ok()
        .and_then(|out| serde_json::from_str(out.trim()).ok())
        .unwrap_or_default()
}

/// Tail the runtime's event stream, yielding container starts and stops.
/// The subprocess is restarted whenever it dies; the tail thread exits once
/// the receiver is gone.
pub fn stream_events() -> mpsc::UnboundedReceiver<ContainerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("container-events".to_string())
        .spawn(move || loop {
            match tail_events(&tx) {
                TailOutcome::ReceiverGone => break,
                TailOutcome::SubprocessDied(error) => {
                    tracing::warn!(error = %error, "container event stream died, restarting");
                    thread::sleep(Duration::from_secs(1));
                },
            }
        })
        .expect("failed to spawn container event thread");
    rx
}

enum TailOutcome {
    ReceiverGone,
    SubprocessDied(String),
}

fn tail_events(tx: &mpsc::UnboundedSender<ContainerEvent>) -> TailOutcome {
    let child = Command::new(detect_runtime().cli())
        .args(&[
            "events",
            "--filter",
            "type=container",
            "--format",
            "{{.Status}} {{.ID}}",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(error) => return TailOutcome::SubprocessDied(error.to_string()),
    };
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => return TailOutcome::SubprocessDied("no stdout".to_string()),
    };
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                let _ = child.kill();
                return TailOutcome::SubprocessDied(error.to_string());
            },
        };
        if let Some(event) = parse_event_line(&line) {
            if tx.send(event).is_err() {
                let _ = child.kill();
                return TailOutcome::ReceiverGone;
            }
        }
    }
    let _ = child.wait();
    TailOutcome::SubprocessDied("event stream ended".to_string())
}

fn parse_event_line(line: &str) -> Option<ContainerEvent> {
    let mut words = line.split_whitespace();
    let status = words.next()?;
    let id = words.next()?.to_string();
    let event_type = match status {
        "start" => ContainerEventType::Start,
        "stop" | "die" => ContainerEventType::Stop,
        _ => return None,
    };
    Some(ContainerEvent { event_type, id })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub id: String,
    pub name: String,
}

/// Per-probe view of matching containers, keyed by mount namespace inode.
/// Seeded from a full listing and kept current by the event stream.
#[derive(Default)]
pub struct ContainerIndex {
    patterns: Vec<String>,
    by_mntns: HashMap<u64, ContainerIdentity>,
    mntns_by_id: HashMap<String, u64>,
}

impl ContainerIndex {
    pub fn new(patterns: Vec<String>) -> Self {
        ContainerIndex {
            patterns,
            ..ContainerIndex::default()
        }
    }

    pub fn seed(&mut self) {
        self.by_mntns.clear();
        self.mntns_by_id.clear();
        for summary in list_matching(&self.patterns) {
            let inode = resolve_mount_ns(&summary.id);
            if inode > 0 {
                self.insert(summary.id, summary.name, inode as u64);
            }
        }
    }

    fn insert(&mut self, id: String, name: String, inode: u64) {
        self.mntns_by_id.insert(id.clone(), inode);
        self.by_mntns.insert(inode, ContainerIdentity { id, name });
    }

    /// Fold one runtime event into the index, resolving the namespace for
    /// starts of matching containers.
    pub fn on_event(&mut self, event: &ContainerEvent) -> Option<ContainerMountNs> {
        match event.event_type {
            ContainerEventType::Start => {
                if !self.patterns.is_empty()
                    && !matches_any(&container_labels(&event.id), &self.patterns)
                {
                    return None;
                }
                let inode = resolve_mount_ns(&event.id);
                if inode <= 0 {
                    return None;
                }
                let name = container_name(&event.id);
                self.insert(event.id.clone(), name.clone(), inode as u64);
                Some(ContainerMountNs {
                    container_id: event.id.clone(),
                    container_name: name,
                    ns_inode: inode as u64,
                    event_type: ContainerEventType::Start,
                })
            },
            ContainerEventType::Stop => {
                let inode = self.mntns_by_id.remove(&event.id);
                if let Some(inode) = inode {
                    self.by_mntns.remove(&inode);
                }
                Some(ContainerMountNs {
                    container_id: event.id.clone(),
                    container_name: String::new(),
                    ns_inode: inode.unwrap_or(0),
                    event_type: ContainerEventType::Stop,
                })
            },
        }
    }

    pub fn lookup(&self, mntns: u64) -> Option<&ContainerIdentity> {
        self.by_mntns.get(&mntns)
    }

    pub fn is_empty(&self) -> bool {
        self.by_mntns.is_empty()
    }
}
