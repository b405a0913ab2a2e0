// Shared ring layout of an address space graphics blob
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! ```text
//! offset 0            64                         ring_size            ring_size + buffer_size
//! ┌──────────────────┬──────────────────────────┬───────────┬─────────────────────────────┐
//! │ RingConfig       │ reply ring (to guest)    │ unused    │ command ring (to host)      │
//! └──────────────────┴──────────────────────────┴───────────┴─────────────────────────────┘
//! ```

use std::{
    cmp::min,
    fmt,
    mem::size_of,
    num::Wrapping,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use vm_memory::VolatileSlice;

use crate::{blob::BlobMapping, protocol::Caps, Error, Result};

pub const RING_HEADER_SIZE: usize = 64;
/// Smallest reply ring a layout accepts.
pub const MIN_REPLY_SIZE: u32 = 64;

/// Control words at the base of every ring blob.
#[repr(C, align(64))]
pub struct RingConfig {
    /// Bytes ever committed by the guest, wrapping.
    pub guest_write_pos: AtomicU32,
    /// Bytes ever consumed by the host, wrapping.
    pub host_consumed_pos: AtomicU32,
    pub transfer_mode: AtomicU32,
    pub flags: AtomicU32,
    /// Bytes ever written by the host into the reply ring.
    pub reply_write_pos: AtomicU32,
    /// Bytes ever read by the guest from the reply ring.
    pub reply_consumed_pos: AtomicU32,
    pub buffer_size: AtomicU32,
    pub reply_size: AtomicU32,
    _reserved: [u32; 8],
}

const _: () = assert!(size_of::<RingConfig>() == RING_HEADER_SIZE);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TransferMode {
    Idle = 0,
    Active = 1,
    Error = 2,
}

impl TransferMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Active),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

bitflags! {
    /// Hints exchanged between producer and consumer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RingFlags: u32 {
        /// The producer is blocked on a full ring.
        const WAKEUP_WANTED = 1 << 0;
        /// A ping was sent and the consumer has not picked it up yet.
        const PING_IN_FLIGHT = 1 << 1;
        /// The consumer found the ring empty and is about to sleep.
        const CONSUMER_IDLE = 1 << 2;
        /// The host asks the producer to slow down.
        const THROTTLE = 1 << 3;
    }
}

/// Offsets of the regions inside a ring blob.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingLayout {
    ring_size: u32,
    buffer_size: u32,
    reply_size: u32,
    blob_size: u64,
}

impl RingLayout {
    pub fn new(ring_size: u32, buffer_size: u32, blob_size: u64) -> Result<Self> {
        if !buffer_size.is_power_of_two() || buffer_size < 2 {
            return Err(Error::InvalidLayout(format!(
                "buffer size {buffer_size} is not a power of two"
            )));
        }
        let reply_room = (ring_size as usize).saturating_sub(RING_HEADER_SIZE) as u32;
        if reply_room < MIN_REPLY_SIZE {
            return Err(Error::InvalidLayout(format!(
                "ring size {ring_size} leaves no room for replies"
            )));
        }
        if u64::from(ring_size) + u64::from(buffer_size) > blob_size {
            return Err(Error::InvalidLayout(format!(
                "blob of {blob_size} bytes cannot hold {ring_size} + {buffer_size}"
            )));
        }

        Ok(Self {
            ring_size,
            buffer_size,
            // Largest power of two that fits between the header and the buffer.
            reply_size: 1 << reply_room.ilog2(),
            blob_size,
        })
    }

    pub fn from_caps(caps: &Caps) -> Result<Self> {
        Self::new(caps.ring_size, caps.buffer_size, caps.ring_blob_size())
    }

    pub const fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub const fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub const fn reply_size(&self) -> u32 {
        self.reply_size
    }

    pub const fn blob_size(&self) -> u64 {
        self.blob_size
    }

    pub const fn reply_offset(&self) -> usize {
        RING_HEADER_SIZE
    }

    pub const fn buffer_offset(&self) -> usize {
        self.ring_size as usize
    }

    /// Bytes of the mapping actually used by the ring.
    pub const fn used_size(&self) -> usize {
        self.ring_size as usize + self.buffer_size as usize
    }
}

/// One direction of a shared ring: a power of two byte buffer and the two
/// counters coordinating its single producer and single consumer.
pub struct ByteRing<'a> {
    buf: VolatileSlice<'a>,
    write_pos: &'a AtomicU32,
    read_pos: &'a AtomicU32,
}

impl<'a> ByteRing<'a> {
    pub fn size(&self) -> u32 {
        self.buf.len() as u32
    }

    fn index(&self, pos: Wrapping<u32>) -> usize {
        (pos.0 & (self.size() - 1)) as usize
    }

    pub fn write_pos(&self) -> Wrapping<u32> {
        Wrapping(self.write_pos.load(Ordering::Acquire))
    }

    pub fn read_pos(&self) -> Wrapping<u32> {
        Wrapping(self.read_pos.load(Ordering::Acquire))
    }

    /// Committed bytes the consumer has not taken yet.
    pub fn occupancy(&self) -> u32 {
        (self.write_pos() - self.read_pos()).0
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn free(&self) -> u32 {
        self.size().saturating_sub(self.occupancy())
    }

    /// Free bytes reachable from the write position without wrapping.
    pub fn contiguous_free(&self) -> u32 {
        let tail = self.index(self.write_pos());
        min(self.free(), self.size() - tail as u32)
    }

    /// Offset of the write position inside the buffer.
    pub fn tail(&self) -> usize {
        self.index(self.write_pos())
    }

    /// Producer side: copies `data` after the write position, splitting it at
    /// the end of the buffer. Nothing is published.
    pub fn write_tail(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.free() as usize {
            return Err(Error::InvalidLayout(format!(
                "{} bytes do not fit in {} free bytes",
                data.len(),
                self.free()
            )));
        }
        let tail = self.index(self.write_pos());
        let len = min(self.size() as usize - tail, data.len());
        self.buf
            .offset(tail)
            .map_err(|e| Error::InvalidLayout(e.to_string()))?
            .copy_from(&data[..len]);
        // Wrap around to the start of the buffer.
        if len < data.len() {
            self.buf.copy_from(&data[len..]);
        }
        Ok(())
    }

    /// Producer side: makes `n` more bytes visible to the consumer.
    pub fn produce(&self, n: u32) {
        let pos = Wrapping(self.write_pos.load(Ordering::Relaxed)) + Wrapping(n);
        self.write_pos.store(pos.0, Ordering::Release);
    }

    /// Consumer side: copies up to `out.len()` committed bytes, splitting at
    /// the end of the buffer. Nothing is released. Fails if the counters
    /// claim more bytes than the buffer holds.
    pub fn peek(&self, out: &mut [u8]) -> Result<usize> {
        let occupancy = self.occupancy();
        if occupancy > self.size() {
            return Err(Error::ProtocolError(format!(
                "ring claims {occupancy} bytes in a {} byte buffer",
                self.size()
            )));
        }
        let count = min(out.len(), occupancy as usize);
        let head = self.index(self.read_pos());
        let len = min(self.size() as usize - head, count);
        let mut copied = self
            .buf
            .subslice(head, len)
            .map_err(|e| Error::InvalidLayout(e.to_string()))?
            .copy_to(&mut out[..len]);
        if len < count {
            copied += self
                .buf
                .subslice(0, count - len)
                .map_err(|e| Error::InvalidLayout(e.to_string()))?
                .copy_to(&mut out[len..count]);
        }
        if copied != count {
            return Err(Error::InvalidLayout(format!(
                "copied {copied} of {count} ring bytes"
            )));
        }
        Ok(count)
    }

    /// Consumer side: hands `n` bytes back to the producer.
    pub fn consume(&self, n: u32) {
        let pos = Wrapping(self.read_pos.load(Ordering::Relaxed)) + Wrapping(n);
        self.read_pos.store(pos.0, Ordering::Release);
    }

    pub fn pop(&self, out: &mut [u8]) -> Result<usize> {
        let count = self.peek(out)?;
        self.consume(count as u32);
        Ok(count)
    }
}

/// A ring blob mapping seen through its layout.
#[derive(Clone)]
pub struct SharedRing {
    mapping: Arc<BlobMapping>,
    layout: RingLayout,
}

impl fmt::Debug for SharedRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRing")
            .field("layout", &self.layout)
            .field("transfer_mode", &self.transfer_mode())
            .field("flags", &self.flags())
            .finish()
    }
}

impl SharedRing {
    pub fn new(mapping: Arc<BlobMapping>, layout: RingLayout) -> Result<Self> {
        if mapping.size() < layout.used_size() {
            return Err(Error::InvalidLayout(format!(
                "mapping of {} bytes is smaller than the ring ({} bytes)",
                mapping.size(),
                layout.used_size()
            )));
        }
        Ok(Self { mapping, layout })
    }

    /// Lays down a fresh header: both directions empty, transfer active.
    pub fn init(&self) {
        let config = self.config();
        config.guest_write_pos.store(0, Ordering::Relaxed);
        config.host_consumed_pos.store(0, Ordering::Relaxed);
        config.reply_write_pos.store(0, Ordering::Relaxed);
        config.reply_consumed_pos.store(0, Ordering::Relaxed);
        config.flags.store(0, Ordering::Relaxed);
        config
            .buffer_size
            .store(self.layout.buffer_size, Ordering::Relaxed);
        config
            .reply_size
            .store(self.layout.reply_size, Ordering::Relaxed);
        self.set_transfer_mode(TransferMode::Active);
    }

    pub const fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn mapping(&self) -> &Arc<BlobMapping> {
        &self.mapping
    }

    pub fn config(&self) -> &RingConfig {
        // SAFETY: The mapping is page aligned, at least `used_size` bytes long
        // and outlives `self`. `RingConfig` only holds atomics.
        unsafe { &*self.mapping.as_ptr().cast::<RingConfig>() }
    }

    fn region(&self, offset: usize, len: u32) -> VolatileSlice<'_> {
        // SAFETY: `new` checked that every region of the layout lies inside
        // the mapping, which lives as long as `self`.
        unsafe { VolatileSlice::new(self.mapping.as_ptr().add(offset), len as usize) }
    }

    /// Commands flowing from the guest to the host.
    pub fn to_host(&self) -> ByteRing<'_> {
        let config = self.config();
        ByteRing {
            buf: self.region(self.layout.buffer_offset(), self.layout.buffer_size),
            write_pos: &config.guest_write_pos,
            read_pos: &config.host_consumed_pos,
        }
    }

    /// Replies flowing from the host back to the guest.
    pub fn to_guest(&self) -> ByteRing<'_> {
        let config = self.config();
        ByteRing {
            buf: self.region(self.layout.reply_offset(), self.layout.reply_size),
            write_pos: &config.reply_write_pos,
            read_pos: &config.reply_consumed_pos,
        }
    }

    pub fn transfer_mode(&self) -> Option<TransferMode> {
        TransferMode::from_raw(self.config().transfer_mode.load(Ordering::Acquire))
    }

    pub fn set_transfer_mode(&self, mode: TransferMode) {
        self.config()
            .transfer_mode
            .store(mode as u32, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self.transfer_mode(), Some(TransferMode::Active))
    }

    pub fn flags(&self) -> RingFlags {
        RingFlags::from_bits_truncate(self.config().flags.load(Ordering::Acquire))
    }

    /// Sets `flags`, returning the previous value.
    pub fn set_flags(&self, flags: RingFlags) -> RingFlags {
        RingFlags::from_bits_truncate(self.config().flags.fetch_or(flags.bits(), Ordering::SeqCst))
    }

    /// Clears `flags`, returning the previous value.
    pub fn clear_flags(&self, flags: RingFlags) -> RingFlags {
        RingFlags::from_bits_truncate(
            self.config()
                .flags
                .fetch_and(!flags.bits(), Ordering::SeqCst),
        )
    }
}
