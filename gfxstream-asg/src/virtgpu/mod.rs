// Access to the virtio-gpu character device
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod linux;
pub mod stub;

use std::{
    collections::HashMap,
    fmt,
    os::fd::OwnedFd,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, LazyLock, Mutex,
    },
};

use log::{debug, error, info};

use crate::{
    blob::{BlobMapping, BlobResource, ExternalHandle},
    config::AsgConfig,
    protocol::{Capset, Caps, CreateBlob},
    Error, Result,
};

/// Kernel side identity of a blob.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobHandles {
    /// GEM handle, local to the device file.
    pub blob_handle: u32,
    /// Host resource id.
    pub res_handle: u32,
    pub size: u64,
}

/// Operations a virtio-gpu driver must provide.
///
/// The real implementation issues ioctls against a render node, the stub
/// keeps everything in process. Tests replace it with a mock.
#[cfg_attr(test, mockall::automock)]
pub trait VirtGpuBackend: Send + Sync {
    /// Capset data queried when the device was opened.
    fn caps(&self) -> Caps;

    /// Corresponds to `DRM_IOCTL_VIRTGPU_RESOURCE_CREATE_BLOB`.
    fn create_blob(&self, spec: &CreateBlob) -> Result<BlobHandles>;

    /// Corresponds to `DRM_IOCTL_VIRTGPU_WAIT`.
    fn wait(&self, blob_handle: u32) -> Result<()>;

    /// Corresponds to `DRM_IOCTL_VIRTGPU_MAP` followed by `mmap`.
    fn map(&self, blob_handle: u32, size: usize) -> Result<BlobMapping>;

    /// Corresponds to `DRM_IOCTL_PRIME_HANDLE_TO_FD`.
    fn export(&self, blob_handle: u32) -> Result<OwnedFd>;

    /// Corresponds to `DRM_IOCTL_PRIME_FD_TO_HANDLE` and `DRM_IOCTL_VIRTGPU_RESOURCE_INFO`.
    fn import(&self, fd: OwnedFd) -> Result<BlobHandles>;

    /// Corresponds to `DRM_IOCTL_VIRTGPU_EXECBUFFER`.
    fn exec_buffer(&self, cmd: &[u8], blob_handle: Option<u32>, ring_idx: u32) -> Result<()>;

    /// Corresponds to `DRM_IOCTL_GEM_CLOSE`.
    fn close(&self, blob_handle: u32) -> Result<()>;
}

/// One opened virtio-gpu device bound to a capset.
pub struct Device {
    capset: Capset,
    caps: Caps,
    backend: Box<dyn VirtGpuBackend>,
    config: AsgConfig,
    lost: AtomicBool,
    // The kernel serialises execbuffers anyway, keep submissions ordered.
    exec_lock: Mutex<()>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("capset", &self.capset)
            .field("caps", &self.caps)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(
        capset: Capset,
        backend: Box<dyn VirtGpuBackend>,
        config: AsgConfig,
    ) -> Arc<Self> {
        let caps = backend.caps();
        info!(
            "virtio-gpu device for {capset}: ring size {}, buffer size {}, blob alignment {}",
            caps.ring_size, caps.buffer_size, caps.blob_alignment
        );

        Arc::new(Self {
            capset,
            caps,
            backend,
            config,
            lost: AtomicBool::new(false),
            exec_lock: Mutex::new(()),
        })
    }

    /// Opens the render node named by `config` through the kernel driver.
    pub fn open(capset: Capset, config: AsgConfig) -> Result<Arc<Self>> {
        let backend = linux::LinuxVirtGpu::open(Path::new(&config.render_node), capset)?;
        Ok(Self::new(capset, Box::new(backend), config))
    }

    /// Process wide instance for `capset`, opened on first use.
    pub fn instance(capset: Capset) -> Result<Arc<Self>> {
        DeviceRegistry::global().get_or_open(capset, || {
            let config = AsgConfig::load(None)?;
            Self::open(capset, config)
        })
    }

    pub const fn capset(&self) -> Capset {
        self.capset
    }

    pub const fn caps(&self) -> Caps {
        self.caps
    }

    pub const fn config(&self) -> &AsgConfig {
        &self.config
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Marks the device lost, as if the kernel reported it.
    pub fn inject_device_lost(&self) {
        error!("virtio-gpu device for {} marked lost", self.capset);
        self.lost.store(true, Ordering::Release);
    }

    pub fn create_blob(self: &Arc<Self>, spec: &CreateBlob) -> Result<BlobResource> {
        BlobResource::create(self, spec)
    }

    pub fn import_blob(self: &Arc<Self>, handle: ExternalHandle) -> Result<BlobResource> {
        BlobResource::import(self, handle)
    }

    /// Submits one command. When `blob` is given the kernel fences the
    /// submission against that resource.
    pub fn exec_buffer(&self, cmd: &[u8], blob: Option<&BlobResource>) -> Result<()> {
        let blob_handle = blob.map(BlobResource::blob_handle);
        // Acquire the lock. Panics if poisoned because the state is invalid in that
        // case, and recovery would not make sense in this context.
        let _guard = self.exec_lock.lock().unwrap();
        self.with_backend(|backend| backend.exec_buffer(cmd, blob_handle, 0))
    }

    /// Runs `op` unless the device is lost. A `DeviceLost` result makes the
    /// loss sticky.
    pub(crate) fn with_backend<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn VirtGpuBackend) -> Result<T>,
    {
        if self.is_lost() {
            return Err(Error::DeviceLost);
        }
        let ret = op(self.backend.as_ref());
        if let Err(Error::DeviceLost) = ret {
            self.inject_device_lost();
        }
        ret
    }
}

/// Caches one `Device` per capset.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<Capset, Arc<Device>>>,
}

static DEVICES: LazyLock<DeviceRegistry> = LazyLock::new(DeviceRegistry::default);

impl DeviceRegistry {
    pub fn global() -> &'static Self {
        &DEVICES
    }

    /// Returns the device opened for `capset`, calling `open` the first time.
    pub fn get_or_open<F>(&self, capset: Capset, open: F) -> Result<Arc<Device>>
    where
        F: FnOnce() -> Result<Arc<Device>>,
    {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.get(&capset) {
            return Ok(device.clone());
        }
        let device = open()?;
        debug!("Registered virtio-gpu device for {capset}");
        devices.insert(capset, device.clone());
        Ok(device)
    }

    pub fn get(&self, capset: Capset) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&capset).cloned()
    }

    /// Drops every cached device.
    pub fn clear(&self) {
        self.devices.lock().unwrap().clear();
    }
}
