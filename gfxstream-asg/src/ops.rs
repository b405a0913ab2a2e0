// Transport backends for address space streams
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{io, os::fd::AsRawFd, sync::Arc, time::Duration};

use log::{debug, trace, warn};
use vmm_sys_util::{
    epoll::{ControlOperation, Epoll, EpollEvent, EventSet},
    eventfd::{EventFd, EFD_NONBLOCK},
};

use crate::{protocol::ControlCommand, virtgpu::Device, Error, Result};

/// Handle returned by backends that open implicitly through the device.
pub const IMPLICIT_HANDLE: i64 = -(libc::EINVAL as i64);

/// What a ping tells the consumer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PingInfo {
    /// Host resource holding the ring.
    pub resource_id: u32,
}

/// The notification side of a transport.
#[cfg_attr(test, mockall::automock)]
pub trait AddressSpaceOps: Send {
    /// Returns a backend specific handle for `close` and `ping`.
    fn open(&mut self) -> i64;

    fn close(&mut self, handle: i64);

    /// Wakes the consumer of the ring. `false` means the consumer may not be
    /// scheduled and the writer has to wait for it on its own.
    fn ping(&mut self, handle: i64, info: PingInfo) -> bool;

    /// The transport is gone for good and pinging again is pointless.
    fn is_fatal(&self) -> bool {
        false
    }
}

/// Pings through `CONTEXT_PING` execbuffers on a virtio-gpu device.
pub struct VirtGpuOps {
    device: Arc<Device>,
}

impl VirtGpuOps {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl AddressSpaceOps for VirtGpuOps {
    fn open(&mut self) -> i64 {
        IMPLICIT_HANDLE
    }

    fn close(&mut self, _handle: i64) {}

    fn ping(&mut self, _handle: i64, info: PingInfo) -> bool {
        let cmd = ControlCommand::ContextPing {
            resource_id: info.resource_id,
        };
        match self.device.exec_buffer(&cmd.encode(), None) {
            Ok(()) => true,
            Err(e) => {
                warn!("ping for resource {} failed: {e}", info.resource_id);
                false
            }
        }
    }

    fn is_fatal(&self) -> bool {
        self.device.is_lost()
    }
}

/// Wakeup primitive a sleeping consumer blocks on.
#[derive(Debug)]
pub struct Doorbell {
    evt: EventFd,
    epoll: Epoll,
}

impl Doorbell {
    pub fn new() -> Result<Self> {
        let evt = EventFd::new(EFD_NONBLOCK).map_err(Error::Io)?;
        let epoll = Epoll::new().map_err(Error::Io)?;
        epoll
            .ctl(
                ControlOperation::Add,
                evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, 0),
            )
            .map_err(Error::Io)?;
        Ok(Self { evt, epoll })
    }

    pub fn ring(&self) -> Result<()> {
        self.evt.write(1).map_err(Error::Io)
    }

    /// Blocks until rung or until `timeout` passed. Returns true if rung.
    /// Rings that happened while nobody waited are collapsed into one.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut events = [EpollEvent::default()];
        match self.epoll.wait(timeout_ms, &mut events) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(Error::Io(e)),
        }
        match self.evt.read() {
            Ok(count) => {
                trace!("doorbell: {count} rings");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Pings a consumer in the same process through its doorbell.
pub struct LoopbackOps {
    doorbell: Arc<Doorbell>,
}

impl LoopbackOps {
    pub fn new(doorbell: Arc<Doorbell>) -> Self {
        Self { doorbell }
    }
}

impl AddressSpaceOps for LoopbackOps {
    fn open(&mut self) -> i64 {
        self.doorbell.evt.as_raw_fd().into()
    }

    fn close(&mut self, handle: i64) {
        debug!("loopback: closing handle {handle}");
    }

    fn ping(&mut self, _handle: i64, info: PingInfo) -> bool {
        if let Err(e) = self.doorbell.ring() {
            warn!("loopback ping for resource {} failed: {e}", info.resource_id);
            return false;
        }
        true
    }
}
