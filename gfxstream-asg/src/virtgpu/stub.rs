// In-process virtio-gpu emulation
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::HashMap,
    ffi::CStr,
    fs::File,
    io,
    os::{
        fd::{AsFd, FromRawFd, OwnedFd},
        unix::fs::MetadataExt,
    },
    sync::{Arc, Mutex},
};

use log::{debug, trace, warn};

use super::{BlobHandles, VirtGpuBackend};
use crate::{
    blob::BlobMapping,
    protocol::{BlobFlags, Capset, Caps, ControlCommand, CreateBlob},
    Error, Result,
};

const MEMFD_NAME: &CStr = c"gfxstream-blob";

/// Host side receiver of the control commands submitted to the stub.
#[cfg_attr(test, mockall::automock)]
pub trait HostControl: Send + Sync {
    /// A guest bound the ring blob `resource_id`. `mapping` is the host view
    /// of its memory.
    fn context_create(&self, resource_id: u32, mapping: BlobMapping) -> Result<()>;

    /// A guest asked the consumer of `resource_id` to look at its ring.
    fn context_ping(&self, resource_id: u32) -> Result<()>;
}

struct StubResource {
    file: Arc<File>,
    size: u64,
    flags: BlobFlags,
}

struct StubBlob {
    res_handle: u32,
}

#[derive(Default)]
struct StubState {
    next_blob_handle: u32,
    next_res_handle: u32,
    blobs: HashMap<u32, StubBlob>,
    resources: HashMap<u32, StubResource>,
}

impl StubState {
    fn new_blob(&mut self, res_handle: u32) -> u32 {
        self.next_blob_handle += 1;
        self.blobs
            .insert(self.next_blob_handle, StubBlob { res_handle });
        self.next_blob_handle
    }

    fn resource_of(&self, blob_handle: u32) -> Result<&StubResource> {
        self.blobs
            .get(&blob_handle)
            .and_then(|blob| self.resources.get(&blob.res_handle))
            .ok_or_else(|| Error::InvalidResource(format!("unknown blob handle {blob_handle}")))
    }
}

/// A virtio-gpu device emulated in process. Blobs are memfds, control
/// commands go straight to a `HostControl`.
pub struct StubVirtGpu {
    caps: Caps,
    host: Mutex<Option<Arc<dyn HostControl>>>,
    state: Mutex<StubState>,
}

impl StubVirtGpu {
    pub fn new(capset: Capset) -> Self {
        Self::with_caps(Caps::host_default(capset))
    }

    pub fn with_caps(caps: Caps) -> Self {
        Self {
            caps,
            host: Mutex::new(None),
            state: Mutex::new(StubState::default()),
        }
    }

    /// Routes control commands to `host`.
    pub fn attach_host(&self, host: Arc<dyn HostControl>) {
        *self.host.lock().unwrap() = Some(host);
    }

    /// Host view of the resource `res_handle`.
    pub fn map_resource(&self, res_handle: u32) -> Result<BlobMapping> {
        let state = self.state.lock().unwrap();
        let resource = state
            .resources
            .get(&res_handle)
            .ok_or_else(|| Error::InvalidResource(format!("unknown resource {res_handle}")))?;
        map_file(&resource.file, resource.size)
    }

    /// Number of live GEM handles.
    pub fn live_blobs(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    fn create_memfd(size: u64) -> Result<File> {
        // SAFETY: The name is a valid nul terminated string and the result is
        // checked before use.
        let fd = unsafe { libc::memfd_create(MEMFD_NAME.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        // SAFETY: `fd` was just created and nothing else owns it.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size).map_err(|e| {
            warn!("Failed to size stub blob to {size} bytes: {e}");
            Error::OutOfMemory
        })?;
        Ok(file)
    }
}

fn map_file(file: &File, size: u64) -> Result<BlobMapping> {
    let size = usize::try_from(size)
        .map_err(|_| Error::InvalidResource("blob too large to map".into()))?;
    BlobMapping::from_fd(file.as_fd(), 0, size)
}

impl VirtGpuBackend for StubVirtGpu {
    fn caps(&self) -> Caps {
        self.caps
    }

    fn create_blob(&self, spec: &CreateBlob) -> Result<BlobHandles> {
        let file = Self::create_memfd(spec.size)?;
        let mut state = self.state.lock().unwrap();
        state.next_res_handle += 1;
        let res_handle = state.next_res_handle;
        state.resources.insert(
            res_handle,
            StubResource {
                file: Arc::new(file),
                size: spec.size,
                flags: spec.flags,
            },
        );
        let blob_handle = state.new_blob(res_handle);
        trace!("stub: created blob {blob_handle} for resource {res_handle}");

        Ok(BlobHandles {
            blob_handle,
            res_handle,
            size: spec.size,
        })
    }

    fn wait(&self, blob_handle: u32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .resource_of(blob_handle)
            .map(|_| ())
    }

    fn map(&self, blob_handle: u32, size: usize) -> Result<BlobMapping> {
        let state = self.state.lock().unwrap();
        let resource = state.resource_of(blob_handle)?;
        if !resource.flags.contains(BlobFlags::MAPPABLE) {
            return Err(Error::NotMappable);
        }
        map_file(&resource.file, size as u64)
    }

    fn export(&self, blob_handle: u32) -> Result<OwnedFd> {
        let state = self.state.lock().unwrap();
        let resource = state.resource_of(blob_handle)?;
        let file = resource.file.try_clone().map_err(Error::Io)?;
        Ok(OwnedFd::from(file))
    }

    fn import(&self, fd: OwnedFd) -> Result<BlobHandles> {
        let file = File::from(fd);
        let meta = file.metadata().map_err(Error::Io)?;
        let mut state = self.state.lock().unwrap();

        let known = state.resources.iter().find_map(|(res_handle, resource)| {
            resource
                .file
                .metadata()
                .ok()
                .filter(|m| m.dev() == meta.dev() && m.ino() == meta.ino())
                .map(|_| *res_handle)
        });
        let res_handle = match known {
            Some(res_handle) => res_handle,
            None => {
                state.next_res_handle += 1;
                let res_handle = state.next_res_handle;
                state.resources.insert(
                    res_handle,
                    StubResource {
                        file: Arc::new(file),
                        size: meta.len(),
                        flags: BlobFlags::MAPPABLE | BlobFlags::SHAREABLE,
                    },
                );
                res_handle
            }
        };
        let blob_handle = state.new_blob(res_handle);

        Ok(BlobHandles {
            blob_handle,
            res_handle,
            size: meta.len(),
        })
    }

    fn exec_buffer(&self, cmd: &[u8], blob_handle: Option<u32>, _ring_idx: u32) -> Result<()> {
        let cmd = ControlCommand::decode(cmd)?;
        if let Some(blob_handle) = blob_handle {
            self.state.lock().unwrap().resource_of(blob_handle)?;
        }
        let Some(host) = self.host.lock().unwrap().clone() else {
            trace!("stub: no host attached, dropping {cmd:?}");
            return Ok(());
        };

        match cmd {
            ControlCommand::ContextCreate { resource_id } => {
                let mapping = self.map_resource(resource_id)?;
                host.context_create(resource_id, mapping)
            }
            ControlCommand::ContextPing { resource_id }
            | ControlCommand::ContextPingWithResponse { resource_id } => {
                host.context_ping(resource_id)
            }
        }
    }

    fn close(&self, blob_handle: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let blob = state
            .blobs
            .remove(&blob_handle)
            .ok_or_else(|| Error::InvalidResource(format!("unknown blob handle {blob_handle}")))?;
        // The resource goes away with its last GEM handle.
        if !state
            .blobs
            .values()
            .any(|other| other.res_handle == blob.res_handle)
        {
            state.resources.remove(&blob.res_handle);
            debug!("stub: released resource {}", blob.res_handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use mockall::predicate::eq;

    use super::*;

    fn create(stub: &StubVirtGpu, size: u64) -> BlobHandles {
        stub.create_blob(&CreateBlob::host3d_mappable(size)).unwrap()
    }

    #[test]
    fn test_control_commands_reach_host() {
        let stub = StubVirtGpu::new(Capset::GfxstreamVulkan);
        let blob = create(&stub, 4096);

        let mut host = MockHostControl::new();
        host.expect_context_create()
            .withf(move |res, mapping| *res == blob.res_handle && mapping.size() == 4096)
            .times(1)
            .returning(|_, _| Ok(()));
        host.expect_context_ping()
            .with(eq(blob.res_handle))
            .times(2)
            .returning(|_| Ok(()));
        stub.attach_host(Arc::new(host));

        let create_cmd = ControlCommand::ContextCreate {
            resource_id: blob.res_handle,
        };
        stub.exec_buffer(&create_cmd.encode(), Some(blob.blob_handle), 0)
            .unwrap();
        let ping = ControlCommand::ContextPing {
            resource_id: blob.res_handle,
        };
        stub.exec_buffer(&ping.encode(), None, 0).unwrap();
        let ping = ControlCommand::ContextPingWithResponse {
            resource_id: blob.res_handle,
        };
        stub.exec_buffer(&ping.encode(), None, 0).unwrap();
    }

    #[test]
    fn test_exec_without_host() {
        let stub = StubVirtGpu::new(Capset::GfxstreamGles);
        let ping = ControlCommand::ContextPing { resource_id: 1 };
        stub.exec_buffer(&ping.encode(), None, 0).unwrap();
        assert_matches!(
            stub.exec_buffer(&[0xde, 0xad, 0, 0], None, 0),
            Err(Error::ProtocolError(_))
        );
        assert_matches!(
            stub.exec_buffer(&ping.encode(), Some(42), 0),
            Err(Error::InvalidResource(_))
        );
    }

    #[test]
    fn test_host_and_guest_views_share_memory() {
        let stub = StubVirtGpu::new(Capset::GfxstreamVulkan);
        let blob = create(&stub, 8192);
        let guest = stub.map(blob.blob_handle, 8192).unwrap();
        let host = stub.map_resource(blob.res_handle).unwrap();

        // SAFETY: Both mappings are 8192 bytes long.
        unsafe {
            guest.as_ptr().add(8191).write(7);
            assert_eq!(host.as_ptr().add(8191).read(), 7);
        }
    }

    #[test]
    fn test_close_releases_resource() {
        let stub = StubVirtGpu::new(Capset::GfxstreamVulkan);
        let blob = create(&stub, 4096);
        let fd = stub.export(blob.blob_handle).unwrap();
        let imported = stub.import(fd).unwrap();
        assert_eq!(imported.res_handle, blob.res_handle);
        assert_eq!(stub.live_blobs(), 2);

        stub.close(blob.blob_handle).unwrap();
        stub.map_resource(blob.res_handle).unwrap();
        stub.close(imported.blob_handle).unwrap();
        assert_matches!(
            stub.map_resource(blob.res_handle),
            Err(Error::InvalidResource(_))
        );
        assert_matches!(stub.close(blob.blob_handle), Err(Error::InvalidResource(_)));
        assert_eq!(stub.live_blobs(), 0);
    }

    #[test]
    fn test_map_not_mappable() {
        let stub = StubVirtGpu::new(Capset::GfxstreamVulkan);
        let blob = stub
            .create_blob(&CreateBlob {
                flags: BlobFlags::SHAREABLE,
                ..CreateBlob::host3d_mappable(4096)
            })
            .unwrap();
        assert_matches!(stub.map(blob.blob_handle, 4096), Err(Error::NotMappable));
    }
}
