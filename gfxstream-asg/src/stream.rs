// Guest side of an address space graphics ring
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    cmp::min,
    fmt, mem, slice,
    sync::{
        atomic::{fence, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};

use crate::{
    blob::BlobResource,
    config::AsgConfig,
    health::{HealthMonitor, StallAction},
    ops::{AddressSpaceOps, PingInfo, VirtGpuOps},
    protocol::{ControlCommand, CreateBlob},
    ring::{RingFlags, RingLayout, SharedRing, TransferMode},
    staging::StagingBuffer,
    virtgpu::Device,
    Error, Result,
};

/// Backoff iterations spent at the cap between two forced pings.
const FORCED_PING_PERIOD: u32 = 16;

/// Counters kept by a stream for diagnostics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Pings handed to the backend that succeeded.
    pub pings: u64,
    /// Pings skipped because one was already in flight.
    pub pings_coalesced: u64,
    pub pings_failed: u64,
    /// Watchdog intervals that expired while waiting on the consumer.
    pub stalls: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

#[derive(Copy, Clone, Debug)]
enum Window {
    None,
    /// Directly in the ring, after the write position.
    InPlace(usize),
    /// In the staging buffer, copied into the ring on commit.
    Staged(usize),
}

/// Producer end of a shared ring.
///
/// Callers obtain a window with `alloc_buffer`, fill it, then publish it with
/// `commit_buffer`. Requests that do not fit contiguously are staged and
/// copied in as the consumer frees space.
pub struct AddressSpaceStream {
    // Declared before `blob` so the mapping goes away before the GEM handle.
    ring: SharedRing,
    blob: Option<BlobResource>,
    ops: Box<dyn AddressSpaceOps>,
    handle: i64,
    resource_id: u32,
    staging: StagingBuffer,
    window: Window,
    health: Arc<HealthMonitor>,
    backoff_initial: Duration,
    backoff_max: Duration,
    stats: StreamStats,
}

impl fmt::Debug for AddressSpaceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpaceStream")
            .field("resource_id", &self.resource_id)
            .field("ring", &self.ring)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl AddressSpaceStream {
    /// Lays down a fresh ring header on `ring` and starts producing into it.
    pub fn new(
        ring: SharedRing,
        mut ops: Box<dyn AddressSpaceOps>,
        resource_id: u32,
        health: Arc<HealthMonitor>,
        config: &AsgConfig,
    ) -> Self {
        ring.init();
        let handle = ops.open();
        debug!(
            "stream {resource_id}: buffer {} bytes, reply {} bytes, handle {handle}",
            ring.layout().buffer_size(),
            ring.layout().reply_size()
        );

        Self {
            ring,
            blob: None,
            ops,
            handle,
            resource_id,
            staging: StagingBuffer::with_capacity(config.staging_initial_capacity),
            window: Window::None,
            health,
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
            stats: StreamStats::default(),
        }
    }

    pub const fn resource_id(&self) -> u32 {
        self.resource_id
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    pub fn blob(&self) -> Option<&BlobResource> {
        self.blob.as_ref()
    }

    pub const fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    /// Stops the stream. Blocked and later calls fail with `StreamClosed`.
    pub fn cancel(&mut self) {
        self.ring.set_transfer_mode(TransferMode::Error);
        self.force_ping();
    }

    fn check_open(&mut self) -> Result<()> {
        if self.ring.is_closed() {
            return Err(Error::StreamClosed);
        }
        if self.ops.is_fatal() {
            error!("stream {}: transport lost", self.resource_id);
            self.ring.set_transfer_mode(TransferMode::Error);
            return Err(Error::StreamClosed);
        }
        Ok(())
    }

    /// Returns a window of at least `min_size` bytes. Whatever is written to
    /// it becomes visible to the consumer with `commit_buffer`.
    pub fn alloc_buffer(&mut self, min_size: usize) -> Result<&mut [u8]> {
        self.window = Window::None;
        self.check_open()?;
        // Bytes left over by an earlier stall go first.
        self.push_staged()?;

        let layout = self.ring.layout();
        if min_size > layout.buffer_size() as usize {
            trace!(
                "stream {}: staging {min_size} bytes, larger than the ring",
                self.resource_id
            );
            return Ok(self.stage(min_size));
        }

        self.wait_for_space(min_size as u32)?;
        let to_host = self.ring.to_host();
        let capacity = to_host.contiguous_free() as usize;
        if capacity < min_size {
            // The request straddles the end of the buffer.
            return Ok(self.stage(min_size));
        }

        let offset = layout.buffer_offset() + to_host.tail();
        self.window = Window::InPlace(capacity);
        // SAFETY: The `capacity` bytes after the write position are free, so
        // the consumer does not look at them until they are produced. The
        // window borrows `self` mutably and cannot outlive the mapping.
        let window = unsafe {
            slice::from_raw_parts_mut(self.ring.mapping().as_ptr().add(offset), capacity)
        };
        Ok(window)
    }

    fn stage(&mut self, size: usize) -> &mut [u8] {
        self.window = Window::Staged(size);
        self.staging.reserve(size)
    }

    /// Publishes the first `size` bytes of the window returned by the last
    /// `alloc_buffer`.
    pub fn commit_buffer(&mut self, size: usize) -> Result<()> {
        let window = mem::replace(&mut self.window, Window::None);
        let capacity = match window {
            Window::None => 0,
            Window::InPlace(capacity) | Window::Staged(capacity) => capacity,
        };
        if size > capacity {
            return Err(Error::InvalidCommit { size, capacity });
        }
        if size == 0 {
            return Ok(());
        }
        self.check_open()?;

        match window {
            Window::InPlace(_) => {
                let was_empty = self.ring.to_host().is_empty();
                self.ring.to_host().produce(size as u32);
                self.stats.bytes_written += size as u64;
                self.notify(was_empty)
            }
            Window::Staged(_) => {
                self.staging.advance(size);
                self.push_staged()
            }
            Window::None => Ok(()),
        }
    }

    /// Pushes any staged bytes left over by an earlier stall into the ring.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        self.push_staged()
    }

    fn push_staged(&mut self) -> Result<()> {
        while !self.staging.is_empty() {
            self.wait_for_space(1)?;
            let (chunk, was_empty) = {
                let to_host = self.ring.to_host();
                let chunk = min(self.staging.pending(), to_host.free() as usize);
                let was_empty = to_host.is_empty();
                // One logical advance per chunk, split at the end of the buffer.
                to_host.write_tail(&self.staging.pending_bytes()[..chunk])?;
                to_host.produce(chunk as u32);
                (chunk, was_empty)
            };
            self.staging.drain(chunk);
            self.stats.bytes_written += chunk as u64;
            self.notify(was_empty)?;
        }
        Ok(())
    }

    /// Copies `data` into the ring and commits it.
    pub fn write_fully(&mut self, data: &[u8]) -> Result<()> {
        let window = self.alloc_buffer(data.len())?;
        window[..data.len()].copy_from_slice(data);
        self.commit_buffer(data.len())
    }

    /// Reads exactly `out.len()` reply bytes, waiting for the consumer to
    /// produce them.
    pub fn read_fully(&mut self, out: &mut [u8]) -> Result<()> {
        self.flush()?;
        let mut done = 0;
        while done < out.len() {
            done += self.ring.to_guest().pop(&mut out[done..])?;
            if done < out.len() {
                self.wait_until(|ring| !ring.to_guest().is_empty())?;
            }
        }
        self.stats.bytes_read += out.len() as u64;
        Ok(())
    }

    /// Wakes the consumer if it may be asleep, unless a ping is already on
    /// its way.
    fn notify(&mut self, was_empty: bool) -> Result<()> {
        // Pairs with the fence the consumer issues between announcing that it
        // goes idle and looking at the write position one last time.
        fence(Ordering::SeqCst);
        if !was_empty && !self.ring.flags().contains(RingFlags::CONSUMER_IDLE) {
            return Ok(());
        }
        let prev = self.ring.set_flags(RingFlags::PING_IN_FLIGHT);
        if prev.contains(RingFlags::PING_IN_FLIGHT) {
            self.stats.pings_coalesced += 1;
            return Ok(());
        }
        self.ping()
    }

    fn force_ping(&mut self) {
        self.ring.clear_flags(RingFlags::PING_IN_FLIGHT);
        self.ring.set_flags(RingFlags::PING_IN_FLIGHT);
        if let Err(e) = self.ping() {
            debug!("stream {}: forced ping failed: {e}", self.resource_id);
        }
    }

    fn ping(&mut self) -> Result<()> {
        let info = PingInfo {
            resource_id: self.resource_id,
        };
        if self.ops.ping(self.handle, info) {
            self.stats.pings += 1;
            return Ok(());
        }

        self.stats.pings_failed += 1;
        self.ring.clear_flags(RingFlags::PING_IN_FLIGHT);
        if self.ops.is_fatal() {
            error!("stream {}: ping failed, closing", self.resource_id);
            self.ring.set_transfer_mode(TransferMode::Error);
            return Err(Error::StreamClosed);
        }
        // The writer falls back to waiting on the consumer position.
        warn!("stream {}: ping failed", self.resource_id);
        Ok(())
    }

    fn wait_for_space(&mut self, needed: u32) -> Result<()> {
        if self.ring.to_host().free() >= needed {
            return Ok(());
        }
        self.ring.set_flags(RingFlags::WAKEUP_WANTED);
        self.notify(true)?;
        self.wait_until(|ring| ring.to_host().free() >= needed)?;
        self.ring.clear_flags(RingFlags::WAKEUP_WANTED);
        Ok(())
    }

    /// Waits with exponential backoff until `ready` holds. Every watchdog
    /// interval without progress is reported to the health monitor.
    fn wait_until<F>(&mut self, ready: F) -> Result<()>
    where
        F: Fn(&SharedRing) -> bool,
    {
        let start = Instant::now();
        let watchdog = self.health.watchdog();
        let mut deadline = start + watchdog;
        let mut backoff = self.backoff_initial;
        let mut at_cap = 0;
        let mut attempt = 0;

        loop {
            self.check_open()?;
            if ready(&self.ring) {
                return Ok(());
            }

            thread::sleep(backoff);
            if backoff < self.backoff_max {
                backoff = min(backoff * 2, self.backoff_max);
            } else {
                at_cap += 1;
                // A consumer that missed its ping never comes back on its own.
                if at_cap % FORCED_PING_PERIOD == 0 && !self.ring.to_host().is_empty() {
                    self.force_ping();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.stats.stalls += 1;
                let waited = now - start;
                match self.health.report_stall(self.resource_id, waited, attempt) {
                    StallAction::Retry => {
                        attempt += 1;
                        deadline = now + watchdog;
                    }
                    StallAction::Fail => return Err(Error::StreamStalled(waited)),
                }
            }
        }
    }

    /// Waits, at most one watchdog interval, for the consumer to take
    /// everything committed so far.
    fn drain(&mut self) {
        if let Err(e) = self.flush() {
            warn!("stream {}: dropping staged bytes: {e}", self.resource_id);
            return;
        }
        let deadline = Instant::now() + self.health.watchdog();
        let mut backoff = self.backoff_initial;
        while !self.ring.to_host().is_empty() && !self.ring.is_closed() {
            if Instant::now() >= deadline {
                warn!(
                    "stream {}: {} bytes never consumed",
                    self.resource_id,
                    self.ring.to_host().occupancy()
                );
                return;
            }
            thread::sleep(backoff);
            backoff = min(backoff * 2, self.backoff_max);
        }
    }
}

impl Drop for AddressSpaceStream {
    fn drop(&mut self) {
        if !self.ring.is_closed() {
            self.drain();
            self.ring.set_transfer_mode(TransferMode::Idle);
            // Let the consumer notice.
            self.force_ping();
        }
        self.ops.close(self.handle);
        info!(
            "stream {} closed: {} bytes written, {} pings ({} coalesced, {} failed)",
            self.resource_id,
            self.stats.bytes_written,
            self.stats.pings,
            self.stats.pings_coalesced,
            self.stats.pings_failed
        );
    }
}

/// Creates a stream backed by a ring blob of the virtio-gpu `device`.
pub fn create_virtio_gpu_stream(
    device: &Arc<Device>,
    health: Arc<HealthMonitor>,
) -> Result<AddressSpaceStream> {
    let layout = RingLayout::from_caps(&device.caps())?;
    let blob = device.create_blob(&CreateBlob::host3d_mappable(layout.blob_size()))?;

    let cmd = ControlCommand::ContextCreate {
        resource_id: blob.resource_id(),
    };
    device.exec_buffer(&cmd.encode(), Some(&blob))?;
    blob.wait()?;
    let ring = SharedRing::new(blob.map()?, layout)?;

    let ops = Box::new(VirtGpuOps::new(device.clone()));
    let mut stream =
        AddressSpaceStream::new(ring, ops, blob.resource_id(), health, device.config());
    info!(
        "created stream on resource {} ({} byte blob)",
        blob.resource_id(),
        layout.blob_size()
    );
    stream.blob = Some(blob);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use assert_matches::assert_matches;
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        ops::MockAddressSpaceOps,
        testutils::{init_logging, test_config, Loopback},
    };

    fn ordered(range: std::ops::Range<u8>) -> Vec<u8> {
        range.collect()
    }

    #[test]
    fn test_fill_and_drain() {
        init_logging();
        let mut loopback = Loopback::new(64, &test_config());

        loopback.stream.write_fully(&ordered(0..64)).unwrap();
        assert_eq!(loopback.host.to_host().free(), 0);
        let mut received = loopback.drain(32);

        loopback.stream.write_fully(&ordered(64..96)).unwrap();
        received.extend(loopback.drain(64));
        assert_eq!(received, ordered(0..96));
        assert!(loopback.host.to_host().is_empty());
        assert_eq!(loopback.stream.stats().bytes_written, 96);
    }

    #[test]
    fn test_full_size_write_across_the_end() {
        let mut loopback = Loopback::new(64, &test_config());
        loopback.stream.write_fully(&[0xff; 40]).unwrap();
        loopback.drain(40);

        // Contiguous space ends 24 bytes in, so the write is staged and split.
        loopback.stream.write_fully(&ordered(0..64)).unwrap();
        assert_eq!(loopback.host.to_host().occupancy(), 64);
        assert_eq!(loopback.drain(64), ordered(0..64));
    }

    #[test]
    fn test_oversized_write_waits_for_consumer() {
        init_logging();
        let config = AsgConfig {
            watchdog_ms: 2000,
            ..test_config()
        };
        let mut loopback = Loopback::new(64, &config);
        let host = loopback.host.clone();
        let consumer = thread::spawn(move || {
            let wait_full = |ring: &SharedRing| {
                let start = Instant::now();
                while ring.to_host().occupancy() < 64 {
                    assert!(start.elapsed() < Duration::from_secs(5));
                    thread::yield_now();
                }
            };
            wait_full(&host);
            thread::sleep(Duration::from_millis(20));
            let held_back = host.to_host().occupancy();

            // Room for exactly one more byte.
            let mut received = vec![0; 1];
            host.to_host().pop(&mut received).unwrap();
            wait_full(&host);
            let mut rest = vec![0; 64];
            let count = host.to_host().pop(&mut rest).unwrap();
            received.extend_from_slice(&rest[..count]);
            (held_back, received)
        });

        let data = ordered(0..65);
        loopback.stream.write_fully(&data).unwrap();
        let (held_back, received) = consumer.join().unwrap();
        assert_eq!(held_back, 64);
        assert_eq!(received, data);
    }

    #[test]
    fn test_pings_coalesced_without_consumer() {
        let mut loopback = Loopback::new(64, &test_config());
        for i in 0..10 {
            loopback.stream.write_fully(&[i]).unwrap();
        }
        let stats = loopback.stream.stats();
        assert!(stats.pings <= 2, "{stats:?}");
        assert!(loopback.doorbell.wait_timeout(Duration::ZERO).unwrap());
        assert!(loopback
            .host
            .flags()
            .contains(RingFlags::PING_IN_FLIGHT));
    }

    #[test]
    fn test_ping_after_consumer_idles() {
        let mut loopback = Loopback::new(64, &test_config());
        loopback.stream.write_fully(&[1]).unwrap();
        loopback.drain(1);

        // What a consumer does before going to sleep.
        loopback.host.set_flags(RingFlags::CONSUMER_IDLE);
        loopback.host.clear_flags(RingFlags::PING_IN_FLIGHT);
        loopback.stream.write_fully(&[2]).unwrap();
        loopback.stream.write_fully(&[3]).unwrap();
        assert_eq!(loopback.stream.stats().pings, 2);
        assert_eq!(loopback.stream.stats().pings_coalesced, 1);
    }

    #[test]
    fn test_failing_backend_stalls() {
        init_logging();
        let mut ops = MockAddressSpaceOps::new();
        ops.expect_open().times(1).return_const(7i64);
        let mut calls = 0;
        ops.expect_ping().returning(move |handle, info| {
            assert_eq!(handle, 7);
            assert_eq!(info.resource_id, 1);
            calls += 1;
            calls <= 5
        });
        ops.expect_is_fatal().return_const(false);
        ops.expect_close().with(eq(7)).times(1).return_const(());

        let config = test_config();
        let mut loopback = Loopback::with_ops(64, Box::new(ops), &config);
        for i in 0..8 {
            loopback.stream.write_fully(&[i; 8]).unwrap();
            assert_eq!(loopback.drain(8), vec![i; 8]);
            loopback.host.clear_flags(RingFlags::PING_IN_FLIGHT);
        }
        let stats = loopback.stream.stats();
        assert_eq!(stats.pings, 5);
        assert_eq!(stats.pings_failed, 3);

        loopback.stream.write_fully(&[0; 64]).unwrap();
        assert_matches!(
            loopback.stream.alloc_buffer(1),
            Err(Error::StreamStalled(waited)) if waited >= config.watchdog()
        );
        assert_eq!(loopback.health.stalls(), 1);
        assert!(loopback.stream.stats().stalls >= 1);
    }

    #[test]
    fn test_fatal_backend_closes() {
        let mut ops = MockAddressSpaceOps::new();
        ops.expect_open().return_const(0i64);
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        ops.expect_ping().returning(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            false
        });
        let flag = lost.clone();
        ops.expect_is_fatal()
            .returning(move || flag.load(Ordering::SeqCst));
        ops.expect_close().return_const(());

        let mut loopback = Loopback::with_ops(64, Box::new(ops), &test_config());
        assert_matches!(loopback.stream.write_fully(&[1]), Err(Error::StreamClosed));
        assert!(lost.load(Ordering::SeqCst));
        assert_eq!(loopback.host.transfer_mode(), Some(TransferMode::Error));
        assert_matches!(loopback.stream.alloc_buffer(1), Err(Error::StreamClosed));
    }

    #[test]
    fn test_invalid_commit() {
        let mut loopback = Loopback::new(64, &test_config());
        assert_matches!(
            loopback.stream.commit_buffer(1),
            Err(Error::InvalidCommit { size: 1, capacity: 0 })
        );

        let capacity = loopback.stream.alloc_buffer(8).unwrap().len();
        assert_eq!(capacity, 64);
        assert_matches!(
            loopback.stream.commit_buffer(65),
            Err(Error::InvalidCommit { size: 65, capacity: 64 })
        );
        // The failed commit used up the window.
        assert_matches!(loopback.stream.commit_buffer(1), Err(Error::InvalidCommit { .. }));
        assert!(loopback.host.to_host().is_empty());

        loopback.stream.alloc_buffer(8).unwrap();
        loopback.stream.commit_buffer(0).unwrap();
        assert!(loopback.host.to_host().is_empty());
    }

    #[test]
    fn test_partial_commit() {
        let mut loopback = Loopback::new(64, &test_config());
        let window = loopback.stream.alloc_buffer(4).unwrap();
        window[..4].copy_from_slice(&[9, 8, 7, 6]);
        loopback.stream.commit_buffer(3).unwrap();
        assert_eq!(loopback.drain(64), vec![9, 8, 7]);
    }

    #[test]
    fn test_staged_write_larger_than_ring() {
        let mut loopback = Loopback::new(64, &test_config());
        let host = loopback.host.clone();
        let consumer = thread::spawn(move || {
            let mut received = Vec::new();
            let mut buf = [0; 64];
            while received.len() < 200 {
                let count = host.to_host().pop(&mut buf).unwrap();
                received.extend_from_slice(&buf[..count]);
                thread::yield_now();
            }
            received
        });

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let window = loopback.stream.alloc_buffer(data.len()).unwrap();
        assert_eq!(window.len(), 200);
        window.copy_from_slice(&data);
        loopback.stream.commit_buffer(data.len()).unwrap();
        assert_eq!(consumer.join().unwrap(), data);
    }

    #[test]
    fn test_read_reply() {
        let mut loopback = Loopback::new(64, &test_config());
        let host = loopback.host.clone();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            host.to_guest().write_tail(&[0xa1, 0xa2]).unwrap();
            host.to_guest().produce(2);
        });

        let mut reply = [0; 2];
        loopback.stream.read_fully(&mut reply).unwrap();
        producer.join().unwrap();
        assert_eq!(reply, [0xa1, 0xa2]);
        assert_eq!(loopback.stream.stats().bytes_read, 2);
    }

    #[test]
    fn test_cancel() {
        let mut loopback = Loopback::new(64, &test_config());
        loopback.stream.cancel();
        assert!(loopback.stream.is_closed());
        assert_matches!(loopback.stream.alloc_buffer(1), Err(Error::StreamClosed));
        assert_matches!(loopback.stream.read_fully(&mut [0]), Err(Error::StreamClosed));
    }

    #[test]
    fn test_drop_closes() {
        let mut ops = MockAddressSpaceOps::new();
        ops.expect_open().return_const(3i64);
        ops.expect_ping().return_const(true);
        ops.expect_is_fatal().return_const(false);
        ops.expect_close().with(eq(3)).times(1).return_const(());

        let Loopback { stream, host, .. } =
            Loopback::with_ops(64, Box::new(ops), &test_config());
        assert_eq!(host.transfer_mode(), Some(TransferMode::Active));
        drop(stream);
        assert_eq!(host.transfer_mode(), Some(TransferMode::Idle));
    }
}
