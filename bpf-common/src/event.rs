// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Raw event layouts produced by the kernel programs.
//!
//! Scalar fields are written in native byte order, addresses and ports in
//! network order as the kernel socket structures hold them. Decoding turns
//! the latter into host-order values, so `daddr` of `10.1.2.3` reads back as
//! `0x0a010203`.

use core::convert::TryFrom;
use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDecodeError {
    SliceTooShort { want: usize, got: usize },
    BadSessionKind(u32),
}

impl fmt::Display for EventDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDecodeError::SliceTooShort { want, got } => {
                write!(f, "event record too short: want {}, got {}", want, got)
            },
            EventDecodeError::BadSessionKind(kind) => {
                write!(f, "unknown udp session event kind {}", kind)
            },
        }
    }
}

fn ne_u32(bytes: &[u8]) -> u32 {
    u32::from_ne_bytes(TryFrom::try_from(&bytes[0..4]).unwrap())
}

fn ne_u64(bytes: &[u8]) -> u64 {
    u64::from_ne_bytes(TryFrom::try_from(&bytes[0..8]).unwrap())
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(TryFrom::try_from(&bytes[0..4]).unwrap())
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes(TryFrom::try_from(&bytes[0..2]).unwrap())
}

fn check_len(slice: &[u8], want: usize) -> Result<(), EventDecodeError> {
    if slice.len() < want {
        Err(EventDecodeError::SliceTooShort {
            want,
            got: slice.len(),
        })
    } else {
        Ok(())
    }
}

/// Outbound TCP connection observed by the `tcp_connect` program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConnectEvent {
    pub pid: u32,
    pub saddr: u32,
    pub daddr: u32,
    pub dport: u16,
}

impl TcpConnectEvent {
    pub const SIZE: usize = 16;

    pub fn to_rb_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.saddr.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.daddr.to_be_bytes());
        bytes[12..14].copy_from_slice(&self.dport.to_be_bytes());
        bytes
    }

    pub fn decode(slice: &[u8]) -> Result<Self, EventDecodeError> {
        check_len(slice, Self::SIZE)?;
        Ok(TcpConnectEvent {
            pid: ne_u32(&slice[0..]),
            saddr: be_u32(&slice[4..]),
            daddr: be_u32(&slice[8..]),
            dport: be_u16(&slice[12..]),
        })
    }
}

/// Listen-socket creation (or snapshot-injected existing listener) observed
/// by the `net_listen` program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetListenEvent {
    pub pid: u32,
    pub laddr: u32,
    pub port: u16,
    pub protocol: u8,
}

impl NetListenEvent {
    pub const SIZE: usize = 12;

    pub fn to_rb_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.laddr.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.port.to_be_bytes());
        bytes[10] = self.protocol;
        bytes
    }

    pub fn decode(slice: &[u8]) -> Result<Self, EventDecodeError> {
        check_len(slice, Self::SIZE)?;
        Ok(NetListenEvent {
            pid: ne_u32(&slice[0..]),
            laddr: be_u32(&slice[4..]),
            port: be_u16(&slice[8..]),
            protocol: slice[10],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UdpSessionKind {
    Start = 1,
    Continue = 2,
    End = 3,
}

/// UDP send-session lifecycle event, keyed by the kernel socket object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSessionEvent {
    pub kind: UdpSessionKind,
    pub pid: u32,
    pub sock: u64,
    pub daddr: u32,
    pub dport: u16,
}

impl UdpSessionEvent {
    pub const SIZE: usize = 24;

    pub fn to_rb_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..4].copy_from_slice(&(self.kind as u32).to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.pid.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.sock.to_ne_bytes());
        bytes[16..20].copy_from_slice(&self.daddr.to_be_bytes());
        bytes[20..22].copy_from_slice(&self.dport.to_be_bytes());
        bytes
    }

    pub fn decode(slice: &[u8]) -> Result<Self, EventDecodeError> {
        check_len(slice, Self::SIZE)?;
        let kind = match ne_u32(&slice[0..]) {
            1 => UdpSessionKind::Start,
            2 => UdpSessionKind::Continue,
            3 => UdpSessionKind::End,
            other => return Err(EventDecodeError::BadSessionKind(other)),
        };
        Ok(UdpSessionEvent {
            kind,
            pid: ne_u32(&slice[4..]),
            sock: ne_u64(&slice[8..]),
            daddr: be_u32(&slice[16..]),
            dport: be_u16(&slice[20..]),
        })
    }
}

#[cfg(feature = "std")]
mod rb {
    use bpf_ring_buffer::RingBufferData;
    use super::{EventDecodeError, NetListenEvent, TcpConnectEvent, UdpSessionEvent};

    impl RingBufferData for TcpConnectEvent {
        type Error = EventDecodeError;

        fn from_rb_slice(slice: &[u8]) -> Result<Self, Self::Error> {
            Self::decode(slice)
        }
    }

    impl RingBufferData for NetListenEvent {
        type Error = EventDecodeError;

        fn from_rb_slice(slice: &[u8]) -> Result<Self, Self::Error> {
            Self::decode(slice)
        }
    }

    impl RingBufferData for UdpSessionEvent {
        type Error = EventDecodeError;

        fn from_rb_slice(slice: &[u8]) -> Result<Self, Self::Error> {
            Self::decode(slice)
        }
    }
}
