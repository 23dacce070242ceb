// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Production [`Kernel`] implementation backed by the privileged loader
//! process: program text goes out over a unix socket, the ring buffer fd
//! comes back over the same socket, and map mutations are replayed as
//! loader commands. The loader applies every mutation in submission order,
//! so a shadow copy kept on our side stays faithful and gives us map
//! enumeration without a query protocol.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use futures::StreamExt;
use bpf_common::{Command, LoaderClient};
use bpf_ring_buffer::{RingBuffer, RingBufferData};
use super::{
    EventStream, Kernel, KernelError, KernelMap, KernelProgram, MapRef, NET_FILTER_MAP,
    PORT_FILTER_MAP,
};

pub const DEFAULT_LOADER_SOCKET: &str = "/tmp/nettrace-loader.sock";

// must agree with the loader's ring buffer reservation
const RING_BUFFER_SIZE: usize = 0x800000;

struct RawRecord(Vec<u8>);

impl RingBufferData for RawRecord {
    type Error = ();

    fn from_rb_slice(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(RawRecord(slice.to_vec()))
    }
}

#[derive(Clone)]
pub struct LoaderKernel {
    socket: PathBuf,
}

impl LoaderKernel {
    pub fn new<P>(socket: P) -> Self
    where
        P: Into<PathBuf>,
    {
        LoaderKernel {
            socket: socket.into(),
        }
    }
}

impl Kernel for LoaderKernel {
    type Program = LoaderProgram;

    fn load(&self, name: &str, program_text: &str) -> Result<Self::Program, KernelError> {
        let (client, fd) =
            LoaderClient::load(&self.socket, name, program_text).map_err(|source| {
                KernelError::LoadFailed {
                    name: name.to_string(),
                    source,
                }
            })?;
        let ring = RingBuffer::<RawRecord>::new(fd, RING_BUFFER_SIZE)
            .map_err(KernelError::EventChannel)?;
        let events = ring.flat_map(|batch| {
            futures::stream::iter(batch.into_iter().map(|RawRecord(bytes)| bytes))
        });

        let client = Arc::new(Mutex::new(client));
        let maps = [NET_FILTER_MAP, PORT_FILTER_MAP]
            .iter()
            .map(|&map| {
                let shadow: MapRef = Arc::new(Mutex::new(ShadowMap {
                    map,
                    client: client.clone(),
                    entries: HashMap::new(),
                }));
                (map, shadow)
            })
            .collect();

        Ok(LoaderProgram {
            client,
            maps,
            events: Some(Box::pin(events)),
        })
    }
}

pub struct LoaderProgram {
    client: Arc<Mutex<LoaderClient>>,
    maps: HashMap<&'static str, MapRef>,
    events: Option<EventStream>,
}

impl KernelProgram for LoaderProgram {
    fn map(&self, name: &str) -> Result<MapRef, KernelError> {
        self.maps
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::NoSuchMap(name.to_string()))
    }

    fn take_events(&mut self) -> Result<EventStream, KernelError> {
        self.events.take().ok_or_else(|| {
            KernelError::EventChannel(io::Error::new(
                io::ErrorKind::Other,
                "event channel already taken",
            ))
        })
    }

    fn lost_events(&mut self) -> u64 {
        match self.client.lock().unwrap().fetch_lost() {
            Ok(count) => count,
            Err(error) => {
                tracing::warn!(error = %error, "failed to fetch lost event counter");
                0
            },
        }
    }
}

/// Kernel map plus its userland shadow. The agent is the only writer, which
/// keeps the shadow equal to the kernel state.
struct ShadowMap {
    map: &'static str,
    client: Arc<Mutex<LoaderClient>>,
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl ShadowMap {
    fn send(&self, command: Command) -> Result<(), KernelError> {
        self.client
            .lock()
            .unwrap()
            .send_command(command)
            .map_err(KernelError::MapWrite)
    }
}

impl KernelMap for ShadowMap {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), KernelError> {
        self.send(Command::MapSet {
            map: self.map.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KernelError> {
        self.send(Command::MapDelete {
            map: self.map.to_string(),
            key: key.to_vec(),
        })?;
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.keys().cloned().collect()
    }
}
