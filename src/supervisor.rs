// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Process lifecycle: one worker task per probe, a single drain of the
//! shared output queue into the sink, signal translation, and the health
//! watchdog that also drives configuration reloads.

use std::{
    env,
    fs::File,
    io::{self, Write},
    os::unix::io::{AsRawFd, RawFd},
    os::unix::process::CommandExt,
    process::Command,
    time::Duration,
};
use anyhow::bail;
use nix::{
    poll::{poll, PollFd, PollFlags},
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use crate::{
    config::{ConfigStore, ReloadOutcome},
    kernel::Kernel,
    probes,
};

/// Consecutive re-executions tolerated before giving up, to keep a broken
/// config from exec-looping the host.
pub const MAX_RESTARTS: u32 = 100;
const RESTARTS_ENV: &str = "NETTRACE_RESTARTS";

/// The output sink: stdout or a file, opened once by the supervisor.
pub struct Sink {
    writer: Box<dyn Write + Send>,
    fd: RawFd,
}

impl Sink {
    pub fn open(path: &str) -> io::Result<Self> {
        if path == "-" {
            Ok(Sink {
                writer: Box::new(io::stdout()),
                fd: libc::STDOUT_FILENO,
            })
        } else {
            let file = File::create(path)?;
            let fd = file.as_raw_fd();
            Ok(Sink {
                writer: Box::new(file),
                fd,
            })
        }
    }

    fn write_record(&mut self, record: &str) -> io::Result<()> {
        self.writer.write_all(record.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Error conditions reported by the fd without consuming data.
    fn is_broken(&self) -> bool {
        let mut fds = [PollFd::new(self.fd, PollFlags::empty())];
        match poll(&mut fds, 0) {
            Ok(0) => false,
            Ok(_) => fds[0]
                .revents()
                .map(|revents| {
                    revents.intersects(
                        PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL,
                    )
                })
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

pub struct SupervisorOpts {
    pub output_file: String,
    pub health_check_period: Duration,
    /// Emit lost-event telemetry every this many polls; `None` disables.
    pub lost_event_telemetry: Option<u64>,
    pub watch_config: bool,
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

enum Health {
    Sound,
    Fatal,
    Restart,
}

pub struct Supervisor<K>
where
    K: Kernel,
{
    kernel: K,
    store: ConfigStore,
    opts: SupervisorOpts,
}

impl<K> Supervisor<K>
where
    K: Kernel,
{
    pub fn new(kernel: K, store: ConfigStore, opts: SupervisorOpts) -> Self {
        Supervisor {
            kernel,
            store,
            opts,
        }
    }

    /// Run until a termination signal or a fatal condition; resolves to the
    /// process exit code.
    pub async fn run(mut self) -> anyhow::Result<i32> {
        let mut sink = Sink::open(&self.opts.output_file)?;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let mut workers = Vec::new();
        let configured: Vec<_> = self
            .store
            .probes()
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();
        for (name, config) in configured {
            let hotswap_rx = self
                .store
                .take_change_receiver(&name)
                .unwrap_or_else(|| mpsc::unbounded_channel().1);
            let handle = probes::spawn_worker(
                &name,
                &config,
                self.kernel.clone(),
                out_tx.clone(),
                self.opts.lost_event_telemetry,
                hotswap_rx,
            )?;
            workers.push(Worker { name, handle });
        }
        tracing::info!(probes = workers.len(), "supervisor running");

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut health = time::interval(self.opts.health_check_period);
        health.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // the interval fires immediately once, skip that
        health.tick().await;

        let mut exit_code = 0;
        let mut reexec = false;
        loop {
            tokio::select! {
                record = out_rx.recv() => match record {
                    Some(record) => {
                        if let Err(error) = sink.write_record(&record) {
                            tracing::error!(error = %error, "output sink broken");
                            exit_code = 1;
                            break;
                        }
                    },
                    // cannot happen while we hold out_tx
                    None => break,
                },
                _ = sigint.recv() => {
                    tracing::info!("caught SIGINT, exiting");
                    break;
                },
                _ = sigterm.recv() => {
                    tracing::info!("caught SIGTERM, exiting");
                    break;
                },
                _ = sighup.recv() => {
                    tracing::info!("caught SIGHUP, re-executing");
                    reexec = true;
                    break;
                },
                _ = health.tick() => match self.health_check(&workers, &sink) {
                    Health::Sound => {},
                    Health::Fatal => {
                        exit_code = 1;
                        // route through the normal signal path so shutdown
                        // stays uniform
                        let _ = kill(Pid::this(), Signal::SIGTERM);
                    },
                    Health::Restart => {
                        reexec = true;
                        break;
                    },
                },
            }
        }

        for worker in &workers {
            worker.handle.abort();
        }
        if reexec {
            // only returns on failure
            return Err(reexec_error());
        }
        Ok(exit_code)
    }

    fn health_check(&mut self, workers: &[Worker], sink: &Sink) -> Health {
        for worker in workers {
            if worker.handle.is_finished() {
                tracing::error!(probe = worker.name.as_str(), "worker died");
                return Health::Fatal;
            }
        }
        if sink.is_broken() {
            tracing::error!("output sink reports errors");
            return Health::Fatal;
        }
        if self.opts.watch_config {
            // config loading may fetch remote includes, keep it off the
            // async workers
            match tokio::task::block_in_place(|| self.store.reload_if_changed()) {
                Ok(ReloadOutcome::FullRestart) => return Health::Restart,
                Ok(_) => {},
                Err(error) => {
                    tracing::error!(error = %error, "config reload failed, keeping current configuration");
                },
            }
        }
        Health::Sound
    }
}

fn parse_restarts(value: Option<String>) -> u32 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Replace the process image with a fresh copy of ourselves, preserving
/// argv. Returns the error when the exec (or the restart budget) fails.
fn reexec_error() -> anyhow::Error {
    let restarts = parse_restarts(env::var(RESTARTS_ENV).ok());
    if restarts >= MAX_RESTARTS {
        return anyhow::anyhow!("giving up after {} consecutive restarts", restarts);
    }
    let args: Vec<String> = env::args().collect();
    tracing::info!(restarts, "re-executing {}", args.join(" "));
    let error = Command::new(&args[0])
        .args(&args[1..])
        .env(RESTARTS_ENV, (restarts + 1).to_string())
        .exec();
    error.into()
}

/// Fail fast when extra probe or plugin names do not resolve against the
/// built-in registries.
pub fn validate_extra_paths(probes: &[String], plugins: &[String]) -> anyhow::Result<()> {
    for name in probes {
        if !probes::is_known_probe(name) {
            bail!("--extra-probe-path {} does not name a built-in probe", name);
        }
    }
    for name in plugins {
        if !crate::plugins::is_registered(name) {
            bail!("--extra-plugin-path {} does not name a built-in plugin", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use super::{parse_restarts, Sink};

    #[test]
    fn records_are_newline_delimited_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut sink = Sink::open(&path.to_string_lossy()).unwrap();
        sink.write_record("{\"a\":1}").unwrap();
        sink.write_record("{\"b\":2}").unwrap();

        let mut content = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");
        assert!(!sink.is_broken());
    }

    #[test]
    fn restart_counter_parses_with_default() {
        assert_eq!(parse_restarts(None), 0);
        assert_eq!(parse_restarts(Some("17".to_string())), 17);
        assert_eq!(parse_restarts(Some("junk".to_string())), 0);
    }

    #[test]
    fn extra_paths_resolve_against_registries() {
        assert!(super::validate_extra_paths(
            &["tcp_connect".to_string()],
            &["loginuidmap".to_string()],
        )
        .is_ok());
        assert!(super::validate_extra_paths(&["nope".to_string()], &[]).is_err());
        assert!(super::validate_extra_paths(&[], &["nope".to_string()]).is_err());
    }
}
