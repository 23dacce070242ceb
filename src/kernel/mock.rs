// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! In-memory [`Kernel`] used by the test suites: maps are plain BTree maps
//! recording their mutation log, events are injected through a channel.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use super::{
    EventStream, Kernel, KernelError, KernelMap, KernelProgram, MapRef, NET_FILTER_MAP,
    PORT_FILTER_MAP,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOp {
    Set(Vec<u8>),
    Delete(Vec<u8>),
}

#[derive(Default)]
pub struct MemoryMap {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    ops: Vec<MapOp>,
}

impl MemoryMap {
    pub fn shared() -> Arc<Mutex<MemoryMap>> {
        Arc::new(Mutex::new(MemoryMap::default()))
    }

    pub fn entries(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.entries
    }

    /// Drain the mutation log.
    pub fn take_ops(&mut self) -> Vec<MapOp> {
        std::mem::take(&mut self.ops)
    }
}

impl KernelMap for MemoryMap {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), KernelError> {
        self.ops.push(MapOp::Set(key.to_vec()));
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KernelError> {
        self.ops.push(MapOp::Delete(key.to_vec()));
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.keys().cloned().collect()
    }
}

struct MockEntry {
    program_text: String,
    net_filter: Arc<Mutex<MemoryMap>>,
    port_filter: Arc<Mutex<MemoryMap>>,
    events_tx: mpsc::UnboundedSender<Vec<u8>>,
    lost: Arc<AtomicU64>,
}

#[derive(Clone, Default)]
pub struct MockKernel {
    programs: Arc<Mutex<HashMap<String, MockEntry>>>,
}

impl MockKernel {
    pub fn new() -> Self {
        MockKernel::default()
    }

    fn with_entry<T>(&self, name: &str, f: impl FnOnce(&mut MockEntry) -> T) -> T {
        let mut programs = self.programs.lock().unwrap();
        let entry = programs
            .get_mut(name)
            .unwrap_or_else(|| panic!("no program {} loaded", name));
        f(entry)
    }

    /// Push one raw ring buffer record into the program's event channel.
    pub fn inject(&self, name: &str, record: Vec<u8>) {
        self.with_entry(name, |entry| {
            entry.events_tx.send(record).expect("event channel closed");
        });
    }

    /// Drop the real sender so the probe's pump sees the channel end.
    pub fn close_events(&self, name: &str) {
        self.with_entry(name, |entry| {
            let (dangling, _) = mpsc::unbounded_channel();
            entry.events_tx = dangling;
        });
    }

    pub fn set_lost(&self, name: &str, count: u64) {
        self.with_entry(name, |entry| entry.lost.store(count, Ordering::SeqCst));
    }

    pub fn program_text(&self, name: &str) -> String {
        self.with_entry(name, |entry| entry.program_text.clone())
    }

    pub fn net_filter(&self, name: &str) -> Arc<Mutex<MemoryMap>> {
        self.with_entry(name, |entry| entry.net_filter.clone())
    }

    pub fn port_filter(&self, name: &str) -> Arc<Mutex<MemoryMap>> {
        self.with_entry(name, |entry| entry.port_filter.clone())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.programs.lock().unwrap().contains_key(name)
    }
}

impl Kernel for MockKernel {
    type Program = MockProgram;

    fn load(&self, name: &str, program_text: &str) -> Result<Self::Program, KernelError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let net_filter = MemoryMap::shared();
        let port_filter = MemoryMap::shared();
        let lost = Arc::new(AtomicU64::new(0));
        let entry = MockEntry {
            program_text: program_text.to_string(),
            net_filter: net_filter.clone(),
            port_filter: port_filter.clone(),
            events_tx,
            lost: lost.clone(),
        };
        self.programs
            .lock()
            .unwrap()
            .insert(name.to_string(), entry);
        Ok(MockProgram {
            net_filter,
            port_filter,
            events_rx: Some(events_rx),
            lost,
        })
    }
}

pub struct MockProgram {
    net_filter: Arc<Mutex<MemoryMap>>,
    port_filter: Arc<Mutex<MemoryMap>>,
    events_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    lost: Arc<AtomicU64>,
}

impl KernelProgram for MockProgram {
    fn map(&self, name: &str) -> Result<MapRef, KernelError> {
        match name {
            NET_FILTER_MAP => {
                let map: MapRef = self.net_filter.clone();
                Ok(map)
            },
            PORT_FILTER_MAP => {
                let map: MapRef = self.port_filter.clone();
                Ok(map)
            },
            other => Err(KernelError::NoSuchMap(other.to_string())),
        }
    }

    fn take_events(&mut self) -> Result<EventStream, KernelError> {
        let rx = self.events_rx.take().ok_or_else(|| {
            KernelError::EventChannel(io::Error::new(
                io::ErrorKind::Other,
                "event channel already taken",
            ))
        })?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn lost_events(&mut self) -> u64 {
        self.lost.load(Ordering::SeqCst)
    }
}
