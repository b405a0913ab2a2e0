// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::sync::Arc;

use crate::{
    blob::BlobMapping,
    config::AsgConfig,
    consumer::Decoder,
    health::HealthMonitor,
    ops::{AddressSpaceOps, Doorbell, LoopbackOps},
    ring::{RingLayout, SharedRing},
    stream::AddressSpaceStream,
    Result,
};

const TEST_RING_SIZE: u32 = 4096;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short timeouts so failing waits end quickly.
pub fn test_config() -> AsgConfig {
    AsgConfig {
        watchdog_ms: 50,
        consumer_idle_timeout_ms: 5,
        ..AsgConfig::default()
    }
}

/// A ring over anonymous memory. The header is left zeroed.
pub fn anonymous_ring(buffer_size: u32) -> SharedRing {
    let layout = RingLayout::new(
        TEST_RING_SIZE,
        buffer_size,
        u64::from(TEST_RING_SIZE + buffer_size),
    )
    .unwrap();
    let mapping = BlobMapping::anonymous(layout.used_size()).unwrap();
    SharedRing::new(Arc::new(mapping), layout).unwrap()
}

/// Replies to every byte `b` with `0xa0 | b`.
pub struct EchoDecoder;

impl Decoder for EchoDecoder {
    fn decode(&mut self, data: &[u8], reply: &mut Vec<u8>) -> Result<usize> {
        reply.extend(data.iter().map(|b| 0xa0 | b));
        Ok(data.len())
    }
}

/// A stream and a host view of the same ring, with no consumer running.
pub struct Loopback {
    pub stream: AddressSpaceStream,
    pub host: SharedRing,
    pub doorbell: Arc<Doorbell>,
    pub health: Arc<HealthMonitor>,
}

impl Loopback {
    pub fn new(buffer_size: u32, config: &AsgConfig) -> Self {
        let doorbell = Arc::new(Doorbell::new().unwrap());
        let ops = Box::new(LoopbackOps::new(doorbell.clone()));
        Self::build(buffer_size, ops, doorbell, config)
    }

    pub fn with_ops(buffer_size: u32, ops: Box<dyn AddressSpaceOps>, config: &AsgConfig) -> Self {
        let doorbell = Arc::new(Doorbell::new().unwrap());
        Self::build(buffer_size, ops, doorbell, config)
    }

    fn build(
        buffer_size: u32,
        ops: Box<dyn AddressSpaceOps>,
        doorbell: Arc<Doorbell>,
        config: &AsgConfig,
    ) -> Self {
        let ring = anonymous_ring(buffer_size);
        let health = Arc::new(HealthMonitor::from_config(config));
        let stream = AddressSpaceStream::new(ring.clone(), ops, 1, health.clone(), config);
        Self {
            stream,
            host: ring,
            doorbell,
            health,
        }
    }

    /// Takes up to `len` bytes out of the ring, as the host would.
    pub fn drain(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        let count = self.host.to_host().pop(&mut out).unwrap();
        out.truncate(count);
        out
    }
}
