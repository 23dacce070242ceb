// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! The probe runtime: templating and loading the kernel program, pumping
//! its ring buffer, enriching events, and applying hot-swapped filters.

pub mod net_listen;
pub mod session;
pub mod snapshot;
pub mod tcp_connect;
pub mod udp_session;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use bpf_ring_buffer::RingBufferData;
use bpf_common::EventDecodeError;
use crate::{
    config::{ConfigError, ProbeConfig},
    containers::{self, ContainerIndex},
    filter_maps::{ApplyError, FilterMapManager},
    filtering::FilterError,
    kernel::{
        template::{self, TemplateError},
        Kernel, KernelError, KernelProgram, NET_FILTER_MAP, PORT_FILTER_MAP,
    },
    plugins::{self, EventPlugin, PluginError},
    proctree::{self, ProcessInfo, ProctreeError},
};

/// Probe names with a built-in implementation.
pub const KNOWN_PROBES: &[&str] = &[tcp_connect::NAME, net_listen::NAME, udp_session::NAME];

pub fn is_known_probe(name: &str) -> bool {
    KNOWN_PROBES.contains(&name)
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unsupported probe configuration: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("kernel event channel closed")]
    EventChannelClosed,
}

/// The polymorphic part of a probe: its kernel program, raw event shape and
/// enrichment.
pub trait ProbeKind: Send + Sized + 'static {
    const NAME: &'static str;
    const PROGRAM_TEMPLATE: &'static str;

    type Event: RingBufferData<Error = EventDecodeError> + Send + Unpin + 'static;

    /// Validate the configuration and build the probe state. Unsupported
    /// settings are fatal here, before anything reaches the kernel.
    fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError>;

    /// Probe-specific template variables.
    fn template_vars(&self, config: &ProbeConfig) -> Result<HashMap<String, String>, ProbeError>;

    /// Turn a raw event into an output record, or swallow it.
    fn enrich(&mut self, event: Self::Event) -> Option<Value>;

    /// Launch the probe's sidecars; synthetic raw events go back through
    /// `inject`.
    fn spawn_sidecars(&mut self, inject: mpsc::UnboundedSender<Self::Event>) {
        let _ = inject;
    }

    /// Called after a hot-swap payload was applied to the kernel maps, so
    /// probe-held userland state (snapshot predicates) can follow.
    fn on_hot_swap(&mut self, config: &ProbeConfig) {
        let _ = config;
    }
}

/// Crawl the process tree, degrading to a partial chain plus error string
/// when an ancestor vanished mid-walk.
pub(crate) fn crawl_or_partial(pid: u32) -> (Vec<ProcessInfo>, String) {
    match proctree::crawl(pid) {
        Ok(tree) => (tree, String::new()),
        Err(error) => {
            let ProctreeError::ProcessVanished { partial, .. } = &error;
            (partial.clone(), error.to_string())
        },
    }
}

pub(crate) fn proctree_value(tree: &[ProcessInfo]) -> Value {
    serde_json::to_value(tree).unwrap_or_else(|_| Value::Array(Vec::new()))
}

/// Render a probe's kernel program, with the shared sizing variables merged
/// into the probe-specific ones.
pub fn render_program<P>(kind: &P, config: &ProbeConfig) -> Result<String, ProbeError>
where
    P: ProbeKind,
{
    let mut vars = kind.template_vars(config)?;
    let rules = config.filters()?;
    vars.insert(
        "net_filter_max_size".to_string(),
        FilterMapManager::lpm_capacity(rules.len()).to_string(),
    );
    Ok(template::render(P::PROGRAM_TEMPLATE, &vars)?)
}

/// Render the program of a named probe without touching the kernel, for
/// `--print-and-quit`.
pub fn render_named_program(name: &str, config: &ProbeConfig) -> Result<String, ProbeError> {
    match name {
        tcp_connect::NAME => {
            render_program(&tcp_connect::TcpConnect::from_config(config)?, config)
        },
        net_listen::NAME => render_program(&net_listen::NetListen::from_config(config)?, config),
        udp_session::NAME => {
            render_program(&udp_session::UdpSession::from_config(config)?, config)
        },
        other => Err(ProbeError::Unsupported(format!("unknown probe {}", other))),
    }
}

pub struct Probe<P, K>
where
    P: ProbeKind,
    K: Kernel,
{
    kind: P,
    config: ProbeConfig,
    kernel: K,
    program_text: String,
    plugins: Vec<Box<dyn EventPlugin>>,
    output: mpsc::UnboundedSender<String>,
    telemetry_every: Option<u64>,
    container_index: Arc<Mutex<ContainerIndex>>,
    polls: u64,
}

impl<P, K> Probe<P, K>
where
    P: ProbeKind,
    K: Kernel,
{
    pub fn new(
        config: ProbeConfig,
        kernel: K,
        output: mpsc::UnboundedSender<String>,
        telemetry_every: Option<u64>,
    ) -> Result<Self, ProbeError> {
        let kind = P::from_config(&config)?;
        let plugins = plugins::load_plugins(P::NAME, &config.plugins())?;
        let program_text = render_program(&kind, &config)?;
        let container_index = Arc::new(Mutex::new(ContainerIndex::new(
            config.container_labels()?,
        )));
        Ok(Probe {
            kind,
            config,
            kernel,
            program_text,
            plugins,
            output,
            telemetry_every,
            container_index,
            polls: 0,
        })
    }

    pub fn program_text(&self) -> &str {
        &self.program_text
    }

    fn apply_filters(
        &self,
        maps: &FilterMapManager,
        config: &ProbeConfig,
        diff: bool,
    ) -> Result<(), ProbeError> {
        let rules = config.filters()?;
        let (ports, mode) = config.global_port_filter()?;
        maps.apply(&rules, &ports, mode, diff)?;
        Ok(())
    }

    fn spawn_container_sidecars(&self) {
        let index = self.container_index.clone();
        tokio::task::spawn_blocking(move || index.lock().unwrap().seed());

        let index = self.container_index.clone();
        tokio::spawn(async move {
            let mut events = containers::stream_events();
            while let Some(event) = events.recv().await {
                let index = index.clone();
                let resolved = tokio::task::spawn_blocking(move || {
                    index.lock().unwrap().on_event(&event)
                })
                .await;
                if let Ok(Some(change)) = resolved {
                    tracing::debug!(
                        container = change.container_id.as_str(),
                        inode = change.ns_inode,
                        event = ?change.event_type,
                        "container index updated",
                    );
                }
            }
        });
    }

    fn attribute_container(&self, record: &mut Value) {
        let index = self.container_index.lock().unwrap();
        if index.is_empty() {
            return;
        }
        let pid = match record.get("pid").and_then(Value::as_u64) {
            Some(pid) => pid as u32,
            None => return,
        };
        let inode = match crate::util::namespace_inode(pid, "mnt") {
            Ok(inode) => inode,
            Err(_) => return,
        };
        if let Some(identity) = index.lookup(inode) {
            record["container_id"] = identity.id.clone().into();
            record["container_name"] = identity.name.clone().into();
        }
    }

    fn handle(&mut self, event: P::Event, program: &mut K::Program) {
        self.polls += 1;
        if let Some(mut record) = self.kind.enrich(event) {
            record["timestamp"] = Utc::now()
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into();
            record["probe"] = P::NAME.into();
            self.attribute_container(&mut record);
            for plugin in &mut self.plugins {
                record = plugin.process(record);
            }
            if self.output.send(record.to_string()).is_err() {
                tracing::warn!(probe = P::NAME, "output queue is gone, record dropped");
            }
        }
        if let Some(every) = self.telemetry_every {
            if self.polls % every == 0 {
                let telemetry = json!({
                    "type": "lost_event_telemetry",
                    "probe": P::NAME,
                    "count": program.lost_events(),
                });
                let _ = self.output.send(telemetry.to_string());
            }
        }
    }

    fn hot_swap(&mut self, maps: &FilterMapManager, payload: ProbeConfig) {
        tracing::info!(probe = P::NAME, "hot-swapping filters");
        if let Err(error) = self.apply_filters(maps, &payload, true) {
            // the previous filters stay in place
            tracing::error!(probe = P::NAME, error = %error, "hot swap failed, keeping previous filters");
            return;
        }
        self.kind.on_hot_swap(&payload);
        match payload.container_labels() {
            Ok(labels) => {
                {
                    let mut index = self.container_index.lock().unwrap();
                    *index = ContainerIndex::new(labels);
                }
                let index = self.container_index.clone();
                tokio::task::spawn_blocking(move || index.lock().unwrap().seed());
            },
            Err(error) => {
                tracing::error!(probe = P::NAME, error = %error, "bad container labels in hot swap");
            },
        }
        self.config = payload;
    }

    /// The worker body: load the program, apply the initial filters, then
    /// pump kernel events, injected events and hot-swap payloads until the
    /// kernel side goes away.
    pub async fn run(
        mut self,
        mut hotswap_rx: mpsc::UnboundedReceiver<ProbeConfig>,
    ) -> Result<(), ProbeError> {
        tracing::info!(probe = P::NAME, "loading kernel program");
        let mut program = self.kernel.load(P::NAME, &self.program_text)?;
        let maps = FilterMapManager::new(
            program.map(NET_FILTER_MAP)?,
            program.map(PORT_FILTER_MAP)?,
        );
        self.apply_filters(&maps, &self.config, false)?;
        let mut events = program.take_events()?;

        if !self.config.container_labels()?.is_empty() {
            self.spawn_container_sidecars();
        }

        let (inject_tx, mut inject_rx) = mpsc::unbounded_channel();
        self.kind.spawn_sidecars(inject_tx.clone());
        // keep one sender so a sidecar-less probe never closes the channel
        let _inject_tx = inject_tx;

        tracing::info!(probe = P::NAME, "polling events");
        loop {
            tokio::select! {
                record = events.next() => match record {
                    Some(bytes) => match P::Event::from_rb_slice(&bytes) {
                        Ok(event) => self.handle(event, &mut program),
                        Err(error) => {
                            tracing::error!(probe = P::NAME, error = %error, "undecodable raw event");
                        },
                    },
                    None => return Err(ProbeError::EventChannelClosed),
                },
                event = recv_or_pending(&mut inject_rx) => self.handle(event, &mut program),
                payload = recv_or_pending(&mut hotswap_rx) => self.hot_swap(&maps, payload),
            }
        }
    }
}

/// Receive from a channel, parking forever once it closes so a
/// `select!` loop is not spun by a dropped sender.
async fn recv_or_pending<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    match rx.recv().await {
        Some(value) => value,
        None => futures::future::pending().await,
    }
}

/// Spawn the worker task for a named probe.
pub fn spawn_worker<K>(
    name: &str,
    config: &ProbeConfig,
    kernel: K,
    output: mpsc::UnboundedSender<String>,
    telemetry_every: Option<u64>,
    hotswap_rx: mpsc::UnboundedReceiver<ProbeConfig>,
) -> Result<JoinHandle<()>, ProbeError>
where
    K: Kernel,
{
    fn spawn<P, K>(
        config: &ProbeConfig,
        kernel: K,
        output: mpsc::UnboundedSender<String>,
        telemetry_every: Option<u64>,
        hotswap_rx: mpsc::UnboundedReceiver<ProbeConfig>,
    ) -> Result<JoinHandle<()>, ProbeError>
    where
        P: ProbeKind,
        K: Kernel,
    {
        let probe = Probe::<P, K>::new(config.clone(), kernel, output, telemetry_every)?;
        Ok(tokio::spawn(async move {
            if let Err(error) = probe.run(hotswap_rx).await {
                tracing::error!(probe = P::NAME, error = %error, "probe worker failed");
            }
        }))
    }

    match name {
        tcp_connect::NAME => spawn::<tcp_connect::TcpConnect, K>(
            config,
            kernel,
            output,
            telemetry_every,
            hotswap_rx,
        ),
        net_listen::NAME => {
            spawn::<net_listen::NetListen, K>(config, kernel, output, telemetry_every, hotswap_rx)
        },
        udp_session::NAME => {
            spawn::<udp_session::UdpSession, K>(config, kernel, output, telemetry_every, hotswap_rx)
        },
        other => Err(ProbeError::Unsupported(format!("unknown probe {}", other))),
    }
}
