// Linux virtio-gpu DRM bindings
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::{File, OpenOptions},
    os::{
        fd::{AsFd, AsRawFd, FromRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
    ptr,
};

use log::{error, info, warn};
use vmm_sys_util::{
    errno::Error as IoError,
    ioctl::{ioctl_with_mut_ref, ioctl_with_ref},
    ioctl_iow_nr, ioctl_iowr_nr,
};

use super::{BlobHandles, VirtGpuBackend};
use crate::{
    blob::BlobMapping,
    protocol::{Capset, Caps, CreateBlob},
    Error, Result,
};

const DRM_IOCTL_BASE: u32 = 0x64;
const DRM_COMMAND_BASE: u32 = 0x40;

const DRM_VIRTGPU_MAP: u32 = 0x01;
const DRM_VIRTGPU_EXECBUFFER: u32 = 0x02;
const DRM_VIRTGPU_GETPARAM: u32 = 0x03;
const DRM_VIRTGPU_RESOURCE_INFO: u32 = 0x05;
const DRM_VIRTGPU_WAIT: u32 = 0x08;
const DRM_VIRTGPU_GET_CAPS: u32 = 0x09;
const DRM_VIRTGPU_RESOURCE_CREATE_BLOB: u32 = 0x0a;
const DRM_VIRTGPU_CONTEXT_INIT: u32 = 0x0b;

pub const VIRTGPU_PARAM_3D_FEATURES: u64 = 1;
pub const VIRTGPU_PARAM_CAPSET_QUERY_FIX: u64 = 2;
pub const VIRTGPU_PARAM_RESOURCE_BLOB: u64 = 3;
pub const VIRTGPU_PARAM_HOST_VISIBLE: u64 = 4;
pub const VIRTGPU_PARAM_CROSS_DEVICE: u64 = 5;
pub const VIRTGPU_PARAM_CONTEXT_INIT: u64 = 6;
pub const VIRTGPU_PARAM_SUPPORTED_CAPSET_IDS: u64 = 7;
pub const VIRTGPU_PARAM_CREATE_GUEST_HANDLE: u64 = 8;

pub const VIRTGPU_CONTEXT_PARAM_CAPSET_ID: u64 = 0x0001;
pub const VIRTGPU_CONTEXT_PARAM_NUM_RINGS: u64 = 0x0002;

pub const VIRTGPU_EXECBUF_RING_IDX: u32 = 0x04;

const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
const DRM_RDWR: u32 = libc::O_RDWR as u32;

/// Number of fence rings requested for every context.
const NUM_RINGS: u64 = 2;

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_map {
    pub offset: u64,
    pub handle: u32,
    pub pad: u32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_execbuffer {
    pub flags: u32,
    pub size: u32,
    pub command: u64,
    pub bo_handles: u64,
    pub num_bo_handles: u32,
    pub fence_fd: i32,
    pub ring_idx: u32,
    pub syncobj_stride: u32,
    pub num_in_syncobjs: u32,
    pub num_out_syncobjs: u32,
    pub in_syncobjs: u64,
    pub out_syncobjs: u64,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_getparam {
    pub param: u64,
    pub value: u64,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_resource_info {
    pub bo_handle: u32,
    pub res_handle: u32,
    pub size: u32,
    pub blob_mem: u32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_3d_wait {
    pub handle: u32,
    pub flags: u32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_get_caps {
    pub cap_set_id: u32,
    pub cap_set_ver: u32,
    pub addr: u64,
    pub size: u32,
    pub pad: u32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_resource_create_blob {
    pub blob_mem: u32,
    pub blob_flags: u32,
    pub bo_handle: u32,
    pub res_handle: u32,
    pub size: u64,
    pub pad: u32,
    pub cmd_size: u32,
    pub cmd: u64,
    pub blob_id: u64,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_context_set_param {
    pub param: u64,
    pub value: u64,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_virtgpu_context_init {
    pub num_params: u32,
    pub pad: u32,
    pub ctx_set_params: u64,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

ioctl_iow_nr!(DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_BASE, 0x09, drm_gem_close);
ioctl_iowr_nr!(DRM_IOCTL_PRIME_HANDLE_TO_FD, DRM_IOCTL_BASE, 0x2d, drm_prime_handle);
ioctl_iowr_nr!(DRM_IOCTL_PRIME_FD_TO_HANDLE, DRM_IOCTL_BASE, 0x2e, drm_prime_handle);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_MAP,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_MAP,
    drm_virtgpu_map
);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_EXECBUFFER,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_EXECBUFFER,
    drm_virtgpu_execbuffer
);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_GETPARAM,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_GETPARAM,
    drm_virtgpu_getparam
);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_RESOURCE_INFO,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_RESOURCE_INFO,
    drm_virtgpu_resource_info
);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_WAIT,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_WAIT,
    drm_virtgpu_3d_wait
);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_GET_CAPS,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_GET_CAPS,
    drm_virtgpu_get_caps
);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_RESOURCE_CREATE_BLOB,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_RESOURCE_CREATE_BLOB,
    drm_virtgpu_resource_create_blob
);
ioctl_iowr_nr!(
    DRM_IOCTL_VIRTGPU_CONTEXT_INIT,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_VIRTGPU_CONTEXT_INIT,
    drm_virtgpu_context_init
);

/// Translates the errno of a failed ioctl into the crate error taxonomy.
pub(crate) fn ioctl_error(op: &'static str, err: IoError) -> Error {
    match err.errno() {
        libc::ENOMEM | libc::ENOSPC => Error::OutOfMemory,
        libc::EBUSY => Error::Busy,
        libc::ENODEV | libc::ENXIO | libc::EIO => {
            error!("{op} failed, device lost: {err}");
            Error::DeviceLost
        }
        _ => {
            error!("{op} failed: {err}");
            Error::Ioctl(op, err)
        }
    }
}

/// Values of the virtgpu params, `None` when the kernel does not know one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtGpuParams {
    pub features_3d: Option<u64>,
    pub capset_query_fix: Option<u64>,
    pub resource_blob: Option<u64>,
    pub host_visible: Option<u64>,
    pub cross_device: Option<u64>,
    pub context_init: Option<u64>,
    pub supported_capset_ids: Option<u64>,
    pub create_guest_handle: Option<u64>,
}

impl VirtGpuParams {
    fn enabled(value: Option<u64>) -> bool {
        value.is_some_and(|v| v != 0)
    }

    /// Whether the device can back an address space graphics ring.
    pub fn supports_rings(&self) -> bool {
        Self::enabled(self.resource_blob)
            && Self::enabled(self.host_visible)
            && Self::enabled(self.context_init)
    }

    pub fn supports_capset(&self, capset: Capset) -> bool {
        self.supported_capset_ids
            .is_some_and(|ids| ids & (1 << capset.id()) != 0)
    }
}

/// A virtio-gpu render node. This structure can only be initialized on
/// guests where `/dev/dri/renderD128` (or the configured node) is available.
#[derive(Debug)]
pub struct LinuxVirtGpu {
    file: File,
    params: VirtGpuParams,
    caps: Caps,
}

impl LinuxVirtGpu {
    pub fn open(path: &Path, capset: Capset) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| {
                error!("Failed to open render node {}: {e}", path.display());
                Error::Io(e)
            })?;

        let mut dev = Self {
            file,
            params: VirtGpuParams::default(),
            caps: Caps::host_default(capset),
        };
        dev.params = dev.query_params();
        if !dev.params.supports_rings() {
            error!(
                "{} lacks blob or context support: {:?}",
                path.display(),
                dev.params
            );
            return Err(Error::Unsupported("virtio-gpu without host visible blobs"));
        }
        if !dev.params.supports_capset(capset) {
            warn!("{} does not advertise capset {capset}", path.display());
        }

        match dev.query_caps(capset) {
            Ok(caps) => dev.caps = caps,
            Err(e) => warn!("Using default {capset} caps, querying them failed: {e}"),
        }
        dev.context_init(capset)?;
        info!("Opened {} for {capset}", path.display());

        Ok(dev)
    }

    pub const fn params(&self) -> VirtGpuParams {
        self.params
    }

    fn get_param(&self, param: u64) -> Option<u64> {
        let mut value: u64 = 0;
        let mut get_param = drm_virtgpu_getparam {
            param,
            value: ptr::addr_of_mut!(value) as u64,
        };

        // SAFETY: Safe as the file is a valid render node and `value` outlives
        // the call.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.file, DRM_IOCTL_VIRTGPU_GETPARAM(), &mut get_param)
        };
        if ret < 0 {
            warn!("virtgpu param {param} not available: {}", IoError::last());
            return None;
        }
        Some(value)
    }

    fn query_params(&self) -> VirtGpuParams {
        VirtGpuParams {
            features_3d: self.get_param(VIRTGPU_PARAM_3D_FEATURES),
            capset_query_fix: self.get_param(VIRTGPU_PARAM_CAPSET_QUERY_FIX),
            resource_blob: self.get_param(VIRTGPU_PARAM_RESOURCE_BLOB),
            host_visible: self.get_param(VIRTGPU_PARAM_HOST_VISIBLE),
            cross_device: self.get_param(VIRTGPU_PARAM_CROSS_DEVICE),
            context_init: self.get_param(VIRTGPU_PARAM_CONTEXT_INIT),
            supported_capset_ids: self.get_param(VIRTGPU_PARAM_SUPPORTED_CAPSET_IDS),
            create_guest_handle: self.get_param(VIRTGPU_PARAM_CREATE_GUEST_HANDLE),
        }
    }

    fn query_caps(&self, capset: Capset) -> Result<Caps> {
        let mut raw = vec![0u8; capset.caps_size()];
        let mut get_caps = drm_virtgpu_get_caps {
            cap_set_id: capset.id(),
            cap_set_ver: 0,
            addr: raw.as_mut_ptr() as u64,
            size: raw.len() as u32,
            pad: 0,
        };

        // SAFETY: Safe as the file is a valid render node and `raw` holds
        // `size` bytes.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.file, DRM_IOCTL_VIRTGPU_GET_CAPS(), &mut get_caps)
        };
        if ret < 0 {
            return Err(ioctl_error("get_caps", IoError::last()));
        }
        Caps::from_bytes(capset, &raw)
    }

    fn context_init(&self, capset: Capset) -> Result<()> {
        let params = [
            drm_virtgpu_context_set_param {
                param: VIRTGPU_CONTEXT_PARAM_NUM_RINGS,
                value: NUM_RINGS,
            },
            drm_virtgpu_context_set_param {
                param: VIRTGPU_CONTEXT_PARAM_CAPSET_ID,
                value: u64::from(capset.id()),
            },
        ];
        let mut init = drm_virtgpu_context_init {
            num_params: params.len() as u32,
            pad: 0,
            ctx_set_params: params.as_ptr() as u64,
        };

        // SAFETY: Safe as the file is a valid render node and `params`
        // outlives the call.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.file, DRM_IOCTL_VIRTGPU_CONTEXT_INIT(), &mut init)
        };
        if ret < 0 {
            return Err(ioctl_error("context_init", IoError::last()));
        }
        Ok(())
    }

    fn resource_info(&self, bo_handle: u32) -> Result<drm_virtgpu_resource_info> {
        let mut info = drm_virtgpu_resource_info {
            bo_handle,
            ..Default::default()
        };

        // SAFETY: Safe as the file is a valid render node.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.file, DRM_IOCTL_VIRTGPU_RESOURCE_INFO(), &mut info)
        };
        if ret < 0 {
            return Err(ioctl_error("resource_info", IoError::last()));
        }
        Ok(info)
    }
}

impl VirtGpuBackend for LinuxVirtGpu {
    fn caps(&self) -> Caps {
        self.caps
    }

    fn create_blob(&self, spec: &CreateBlob) -> Result<BlobHandles> {
        let mut create = drm_virtgpu_resource_create_blob {
            blob_mem: spec.blob_mem.raw(),
            blob_flags: spec.flags.bits(),
            size: spec.size,
            blob_id: spec.blob_id,
            ..Default::default()
        };

        // SAFETY: Safe as the file is a valid render node.
        let ret = unsafe {
            ioctl_with_mut_ref(
                &self.file,
                DRM_IOCTL_VIRTGPU_RESOURCE_CREATE_BLOB(),
                &mut create,
            )
        };
        if ret < 0 {
            return Err(ioctl_error("resource_create_blob", IoError::last()));
        }

        Ok(BlobHandles {
            blob_handle: create.bo_handle,
            res_handle: create.res_handle,
            size: spec.size,
        })
    }

    fn wait(&self, blob_handle: u32) -> Result<()> {
        let mut wait = drm_virtgpu_3d_wait {
            handle: blob_handle,
            flags: 0,
        };

        // SAFETY: Safe as the file is a valid render node.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, DRM_IOCTL_VIRTGPU_WAIT(), &mut wait) };
        if ret < 0 {
            return Err(ioctl_error("wait", IoError::last()));
        }
        Ok(())
    }

    fn map(&self, blob_handle: u32, size: usize) -> Result<BlobMapping> {
        let mut map = drm_virtgpu_map {
            handle: blob_handle,
            ..Default::default()
        };

        // SAFETY: Safe as the file is a valid render node.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, DRM_IOCTL_VIRTGPU_MAP(), &mut map) };
        if ret < 0 {
            return Err(ioctl_error("map", IoError::last()));
        }
        BlobMapping::from_fd(self.file.as_fd(), map.offset, size)
    }

    fn export(&self, blob_handle: u32) -> Result<OwnedFd> {
        let mut prime = drm_prime_handle {
            handle: blob_handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };

        // SAFETY: Safe as the file is a valid render node.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.file, DRM_IOCTL_PRIME_HANDLE_TO_FD(), &mut prime)
        };
        if ret < 0 {
            return Err(ioctl_error("prime_handle_to_fd", IoError::last()));
        }
        // SAFETY: The kernel just handed us this descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }

    fn import(&self, fd: OwnedFd) -> Result<BlobHandles> {
        let mut prime = drm_prime_handle {
            fd: fd.as_raw_fd(),
            ..Default::default()
        };

        // SAFETY: Safe as the file is a valid render node and `fd` is open.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.file, DRM_IOCTL_PRIME_FD_TO_HANDLE(), &mut prime)
        };
        // The GEM handle keeps the buffer alive, the descriptor is done either way.
        drop(fd);
        if ret < 0 {
            return Err(ioctl_error("prime_fd_to_handle", IoError::last()));
        }

        let info = self.resource_info(prime.handle)?;
        Ok(BlobHandles {
            blob_handle: prime.handle,
            res_handle: info.res_handle,
            size: u64::from(info.size),
        })
    }

    fn exec_buffer(&self, cmd: &[u8], blob_handle: Option<u32>, ring_idx: u32) -> Result<()> {
        let handles = blob_handle.map(|handle| [handle]);
        let mut exec = drm_virtgpu_execbuffer {
            flags: if ring_idx != 0 {
                VIRTGPU_EXECBUF_RING_IDX
            } else {
                0
            },
            size: cmd.len() as u32,
            command: cmd.as_ptr() as u64,
            fence_fd: -1,
            ring_idx,
            ..Default::default()
        };
        if let Some(handles) = handles.as_ref() {
            exec.bo_handles = handles.as_ptr() as u64;
            exec.num_bo_handles = 1;
        }

        // SAFETY: Safe as the file is a valid render node, `cmd` and `handles`
        // outlive the call.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.file, DRM_IOCTL_VIRTGPU_EXECBUFFER(), &mut exec)
        };
        if ret < 0 {
            return Err(ioctl_error("execbuffer", IoError::last()));
        }
        Ok(())
    }

    fn close(&self, blob_handle: u32) -> Result<()> {
        let close = drm_gem_close {
            handle: blob_handle,
            pad: 0,
        };

        // SAFETY: Safe as the file is a valid render node.
        let ret = unsafe { ioctl_with_ref(&self.file, DRM_IOCTL_GEM_CLOSE(), &close) };
        if ret < 0 {
            return Err(ioctl_error("gem_close", IoError::last()));
        }
        Ok(())
    }
}
