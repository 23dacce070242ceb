// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Wire-format contracts shared between the userland agent and the kernel
//! tracing programs, plus the line protocol spoken with the privileged
//! program loader.

mod filter;
pub use self::filter::{
    FilterKey, FilterValue, PortFilterArray, PortFilterMode, PortRange,
    NET_FILTER_MAX_PORT_RANGES, PORT_FILTER_SIZE,
};

mod event;
pub use self::event::{
    EventDecodeError, NetListenEvent, TcpConnectEvent, UdpSessionEvent, UdpSessionKind,
};

mod command;
pub use self::command::Command;

#[cfg(feature = "std")]
mod client;
#[cfg(feature = "std")]
pub use self::client::LoaderClient;
