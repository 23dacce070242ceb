// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Process ancestry from `/proc`: the chain of `(pid, cmdline, username)`
//! from the event's process up to init.

use nix::unistd::{Uid, User};
use procfs::process::Process;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: String,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum ProctreeError {
    #[error("process {pid} vanished while walking ancestry")]
    ProcessVanished {
        pid: u32,
        /// Ancestors resolved before the walk broke off.
        partial: Vec<ProcessInfo>,
    },
}

pub(crate) fn username(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn process_info(pid: u32) -> Option<(ProcessInfo, u32)> {
    let process = Process::new(pid as i32).ok()?;
    let stat = process.stat().ok()?;
    let cmdline = match process.cmdline() {
        Ok(argv) if !argv.is_empty() => argv.join(" "),
        // kernel threads and vanished binaries have no cmdline
        _ => format!("[{}]", stat.comm),
    };
    let uid = process.uid().ok()?;
    Some((
        ProcessInfo {
            pid,
            cmdline,
            username: username(uid),
        },
        stat.ppid as u32,
    ))
}

/// Walk the `ppid` chain starting at `pid` until pid 0. The error carries
/// whatever part of the chain resolved, so callers can still attach it to
/// the event.
pub fn crawl(pid: u32) -> Result<Vec<ProcessInfo>, ProctreeError> {
    let mut tree = Vec::new();
    let mut current = pid;
    while current != 0 {
        match process_info(current) {
            Some((info, ppid)) => {
                tree.push(info);
                current = ppid;
            },
            None => {
                return Err(ProctreeError::ProcessVanished {
                    pid: current,
                    partial: tree,
                });
            },
        }
    }
    Ok(tree)
}
