// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Userspace consumer for the kernel ring buffer.
//!
//! The kernel side reserves 8-byte-aligned slices and publishes them by
//! advancing the producer position; we mirror the consumer position back so
//! the kernel can reclaim space. The buffer memory is mapped twice back to
//! back, so a record never needs to be reassembled across the wrap point.

use std::{
    fmt, io,
    marker::PhantomData,
    mem, ptr, slice,
    os::unix::io::{AsRawFd, RawFd},
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
    task::{Context, Poll},
};
use futures::Stream;
use smallvec::SmallVec;
use tokio::io::{unix::AsyncFd, Interest};

/// Decoded record pulled out of the ring buffer.
pub trait RingBufferData
where
    Self: Sized,
{
    type Error: fmt::Debug;

    fn from_rb_slice(slice: &[u8]) -> Result<Self, Self::Error>;
}

const HEADER_SIZE: usize = 8;
const BUSY_BIT: usize = 1 << 31;
const DISCARD_BIT: usize = 1 << 30;
// stop a single read call from starving the poll loop
const READ_BATCH_LIMIT: usize = 0x1000000;

/// Synchronous view over the mapped ring buffer fd.
pub struct RingBufferSync {
    fd: RawFd,
    mask: usize,
    page_size: usize,
    // first page, mapped read/write, holds the consumer position
    consumer_pos: *mut AtomicUsize,
    // producer page plus the double-mapped data area, mapped read-only
    producer_map: *mut libc::c_void,
    data: *const AtomicUsize,
    pos: usize,
    last_saturation_decile: usize,
}

// raw pointers refer to process-private mappings
unsafe impl Send for RingBufferSync {}

impl AsRawFd for RingBufferSync {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl RingBufferSync {
    /// Map the ring buffer. `max_length` must be a power of two.
    pub fn new(fd: RawFd, max_length: usize) -> io::Result<Self> {
        debug_assert_eq!(max_length & (max_length - 1), 0);

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        let consumer_pos = unsafe {
            let p = libc::mmap(
                ptr::null_mut(),
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if p == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            p as *mut AtomicUsize
        };

        let producer_map = unsafe {
            let p = libc::mmap(
                ptr::null_mut(),
                page_size + max_length * 2,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                page_size as libc::off_t,
            );
            if p == libc::MAP_FAILED {
                let error = io::Error::last_os_error();
                libc::munmap(consumer_pos as *mut _, page_size);
                return Err(error);
            }
            p
        };
        let data = (producer_map as usize + page_size) as *const AtomicUsize;

        log::info!(
            "mapped ring buffer: fd: {}, size: 0x{:x}, page size: 0x{:x}",
            fd,
            max_length,
            page_size,
        );
        Ok(RingBufferSync {
            fd,
            mask: max_length - 1,
            page_size,
            consumer_pos,
            producer_map,
            data,
            pos: 0,
            last_saturation_decile: 0,
        })
    }

    fn producer_pos(&self) -> usize {
        unsafe { &*(self.producer_map as *const AtomicUsize) }.load(Ordering::Acquire)
    }

    fn publish_consumer_pos(&self) {
        unsafe { &*self.consumer_pos }.store(self.pos, Ordering::Release);
    }

    /// Warn once per decile when the buffer fills up, the kernel is about to
    /// drop records past 100%.
    fn note_saturation(&mut self, distance: usize) {
        let decile = distance * 10 / (self.mask + 1);
        if decile > self.last_saturation_decile {
            log::warn!("ring buffer {}0% full", decile);
        }
        self.last_saturation_decile = decile;
    }

    fn record_header(&self, at: usize) -> usize {
        let index = (at & self.mask) / mem::size_of::<AtomicUsize>();
        let header = unsafe { &*self.data.add(index) }.load(Ordering::Acquire);
        header & 0xffffffff
    }

    /// Drain currently published records. Returns `WouldBlock` when the
    /// buffer holds nothing consumable.
    pub fn read<D>(&mut self) -> io::Result<SmallVec<[D; 64]>>
    where
        D: RingBufferData,
    {
        let mut batch = SmallVec::new();
        let mut read_total = 0;

        loop {
            let producer = self.producer_pos();
            if self.pos > producer {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "consumer ran past the producer",
                ));
            }
            if self.pos == producer {
                break;
            }
            self.note_saturation(producer - self.pos);

            let header = self.record_header(self.pos);
            if header & BUSY_BIT != 0 {
                // the kernel is still writing this record
                break;
            }
            let length = header & !DISCARD_BIT;
            let data_offset = (self.pos & self.mask) + HEADER_SIZE;
            self.pos += HEADER_SIZE + (length + 7) / 8 * 8;

            if header & DISCARD_BIT == 0 {
                let record = unsafe {
                    slice::from_raw_parts((self.data as usize + data_offset) as *const u8, length)
                };
                match D::from_rb_slice(record) {
                    Ok(data) => {
                        batch.push(data);
                        read_total += record.len();
                    },
                    Err(error) => log::error!("undecodable ring buffer record: {:?}", error),
                }
            }

            self.publish_consumer_pos();
            if read_total > READ_BATCH_LIMIT {
                break;
            }
        }

        if batch.is_empty() {
            Err(io::Error::new(io::ErrorKind::WouldBlock, ""))
        } else {
            Ok(batch)
        }
    }
}

impl Drop for RingBufferSync {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.consumer_pos as *mut _, self.page_size);
            libc::munmap(self.producer_map, self.page_size + (self.mask + 1) * 2);
        }
    }
}

/// Asynchronous ring buffer consumer, yields batches of decoded records.
pub struct RingBuffer<D> {
    inner: AsyncFd<RingBufferSync>,
    phantom_data: PhantomData<D>,
}

impl<D> RingBuffer<D> {
    pub fn new(fd: RawFd, max_length: usize) -> io::Result<Self> {
        let inner = RingBufferSync::new(fd, max_length)?;
        let inner = AsyncFd::with_interest(inner, Interest::READABLE)?;
        Ok(RingBuffer {
            inner,
            phantom_data: PhantomData,
        })
    }
}

impl<D> Stream for RingBuffer<D>
where
    D: RingBufferData + Unpin,
{
    type Item = SmallVec<[D; 64]>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        loop {
            let mut guard = match self.inner.poll_read_ready_mut(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => {
                    log::error!("ring buffer fd: {}", error);
                    return Poll::Ready(None);
                },
                Poll::Ready(Ok(guard)) => guard,
            };
            match guard.try_io(|inner| inner.get_mut().read()) {
                Ok(Ok(batch)) => return Poll::Ready(Some(batch)),
                Ok(Err(error)) => {
                    log::error!("ring buffer read: {}", error);
                    return Poll::Ready(None);
                },
                // false wakeup or busy record, poll readiness again
                Err(_would_block) => continue,
            }
        }
    }
}
