// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

use std::{
    fs, io,
    future::Future,
    net::Ipv4Addr,
    time::Duration,
};

/// Dotted form of an address held as a host-order integer, `0x0a010203`
/// prints as `10.1.2.3`.
pub fn int_to_ip(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr)
}

pub fn ip_to_int(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Inode of a namespace link under `/proc/<pid>/ns/`, identifying the
/// namespace within the running kernel.
pub fn namespace_inode(pid: u32, kind: &str) -> io::Result<u64> {
    let link = fs::read_link(format!("/proc/{}/ns/{}", pid, kind))?;
    let link = link.to_string_lossy();
    // the link target reads like `net:[4026531992]`
    link.split(&['[', ']'][..])
        .nth(1)
        .and_then(|inode| inode.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unparsable namespace link {}", link),
            )
        })
}

pub fn self_namespace_inode(kind: &str) -> io::Result<u64> {
    namespace_inode(std::process::id(), kind)
}

/// Run a sidecar body forever, logging and restarting it on error instead of
/// letting the task die.
pub async fn retry_forever<F, Fut>(name: &'static str, op: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        match op().await {
            // a clean return means the rest of the probe is shutting down
            Ok(()) => break,
            Err(error) => {
                tracing::error!(sidecar = name, error = %error, "sidecar failed, restarting");
                tokio::time::sleep(Duration::from_secs(1)).await;
            },
        }
    }
}
