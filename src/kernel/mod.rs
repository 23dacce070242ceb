// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Seam to the kernel tracing facility.
//!
//! The facility itself (program compilation, map plumbing, the ring buffer
//! producer) lives in a privileged loader process; the agent talks to it
//! through [`loader::LoaderKernel`]. The probe runtime is generic over
//! [`Kernel`] so tests can drive it with [`mock::MockKernel`] instead.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
};
use futures::Stream;
use thiserror::Error;

pub mod loader;
pub mod mock;
pub mod template;

/// Map names exported by every probe program.
pub const NET_FILTER_MAP: &str = "net_filter";
pub const PORT_FILTER_MAP: &str = "port_filter";

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to load kernel program {name}: {source}")]
    LoadFailed { name: String, source: io::Error },
    #[error("program does not export map {0}")]
    NoSuchMap(String),
    #[error("map write failed: {0}")]
    MapWrite(io::Error),
    #[error("event channel failed: {0}")]
    EventChannel(io::Error),
}

/// One kernel-resident map, keyed and valued by packed bytes.
pub trait KernelMap: Send {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), KernelError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), KernelError>;
    fn keys(&self) -> Vec<Vec<u8>>;
}

pub type MapRef = Arc<Mutex<dyn KernelMap>>;

/// Raw records published by the program's ring buffer.
pub type EventStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A loaded and attached tracing program.
pub trait KernelProgram: Send {
    fn map(&self, name: &str) -> Result<MapRef, KernelError>;

    /// The event channel may be taken once; the event pump is its only
    /// consumer.
    fn take_events(&mut self) -> Result<EventStream, KernelError>;

    /// How many events the kernel failed to publish so far.
    fn lost_events(&mut self) -> u64;
}

pub trait Kernel: Clone + Send + 'static {
    type Program: KernelProgram;

    fn load(&self, name: &str, program_text: &str) -> Result<Self::Program, KernelError>;
}
