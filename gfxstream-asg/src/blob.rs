// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fmt, io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::{self, NonNull},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use log::{debug, error, warn};

use crate::{
    protocol::{BlobFlags, CreateBlob},
    virtgpu::{BlobHandles, Device},
    Error, Result,
};

const WAIT_BUSY_SLEEP: Duration = Duration::from_micros(100);

/// A read-write shared mapping. Unmapped on drop.
pub struct BlobMapping {
    addr: NonNull<u8>,
    size: usize,
}

// SAFETY: The mapping is plain shared memory. Concurrent access is
// coordinated by the ring counters, not by this type.
unsafe impl Send for BlobMapping {}
// SAFETY: See above.
unsafe impl Sync for BlobMapping {}

impl fmt::Debug for BlobMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobMapping")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .finish()
    }
}

impl BlobMapping {
    /// Maps `size` bytes of `fd` starting at `offset`.
    pub fn from_fd(fd: BorrowedFd<'_>, offset: u64, size: usize) -> Result<Self> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| Error::Mmap(io::Error::from(io::ErrorKind::InvalidInput)))?;
        // SAFETY: We pass a null hint, so the kernel picks a fresh range and no
        // existing memory is affected. The result is checked below.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        Self::from_raw(addr, size)
    }

    /// Anonymous shared memory, used for in-process rings.
    pub fn anonymous(size: usize) -> Result<Self> {
        // SAFETY: Same as in `from_fd`, without a backing file.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_raw(addr, size)
    }

    fn from_raw(addr: *mut libc::c_void, size: usize) -> Result<Self> {
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            error!("mmap of {size} bytes failed: {err}");
            return Err(Error::Mmap(err));
        }
        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or(Error::Mmap(io::Error::from(io::ErrorKind::AddrNotAvailable)))?;
        Ok(Self { addr, size })
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for BlobMapping {
    fn drop(&mut self) {
        // SAFETY: The range was mapped by us and is unmapped exactly once.
        let ret = unsafe { libc::munmap(self.addr.as_ptr().cast(), self.size) };
        if ret != 0 {
            error!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// A transferable handle of an exported blob.
#[derive(Debug)]
pub struct ExternalHandle {
    fd: OwnedFd,
}

impl ExternalHandle {
    pub const fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for ExternalHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// One host visible virtio-gpu blob.
pub struct BlobResource {
    device: Arc<Device>,
    handles: BlobHandles,
    mappable: bool,
    mapping: Mutex<Option<Arc<BlobMapping>>>,
}

impl fmt::Debug for BlobResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobResource")
            .field("handles", &self.handles)
            .field("mappable", &self.mappable)
            .finish_non_exhaustive()
    }
}

impl BlobResource {
    /// Creates the blob. The host is not guaranteed to have bound it until
    /// `wait` returns or a control command referencing it completes.
    pub fn create(device: &Arc<Device>, spec: &CreateBlob) -> Result<Self> {
        let alignment = u64::from(device.caps().blob_alignment);
        if spec.size == 0 || spec.size % alignment != 0 {
            return Err(Error::InvalidResource(format!(
                "blob size {} is not a non-zero multiple of {alignment}",
                spec.size
            )));
        }

        let handles = device.with_backend(|backend| backend.create_blob(spec))?;
        debug!(
            "Created blob {} (resource {}) of {} bytes",
            handles.blob_handle, handles.res_handle, handles.size
        );

        Ok(Self {
            device: device.clone(),
            handles,
            mappable: spec.flags.contains(BlobFlags::MAPPABLE),
            mapping: Mutex::new(None),
        })
    }

    /// Turns an exported handle back into a blob of `device`.
    pub fn import(device: &Arc<Device>, handle: ExternalHandle) -> Result<Self> {
        let handles = device.with_backend(|backend| backend.import(handle.into_fd()))?;
        debug!(
            "Imported blob {} (resource {})",
            handles.blob_handle, handles.res_handle
        );

        Ok(Self {
            device: device.clone(),
            handles,
            // The kernel rejects the map request if the blob was not mappable.
            mappable: true,
            mapping: Mutex::new(None),
        })
    }

    pub const fn blob_handle(&self) -> u32 {
        self.handles.blob_handle
    }

    pub const fn resource_id(&self) -> u32 {
        self.handles.res_handle
    }

    pub const fn size(&self) -> u64 {
        self.handles.size
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Blocks until the host bound the resource.
    pub fn wait(&self) -> Result<()> {
        let max_retries = self.device.config().wait_busy_retries;
        let mut retry = 0;
        loop {
            match self
                .device
                .with_backend(|backend| backend.wait(self.handles.blob_handle))
            {
                Err(Error::Busy) => {
                    retry += 1;
                    if retry % 10 == 0 {
                        warn!(
                            "Waiting on blob {} returned busy {retry} times",
                            self.handles.blob_handle
                        );
                    }
                    if retry >= max_retries {
                        error!(
                            "Blob {} still busy after {retry} retries",
                            self.handles.blob_handle
                        );
                        return Err(Error::Busy);
                    }
                    thread::sleep(WAIT_BUSY_SLEEP);
                }
                ret => return ret,
            }
        }
    }

    /// Maps the blob. Repeated calls return the same mapping.
    pub fn map(&self) -> Result<Arc<BlobMapping>> {
        if !self.mappable {
            return Err(Error::NotMappable);
        }
        let mut mapping = self.mapping.lock().unwrap();
        if let Some(mapping) = mapping.as_ref() {
            return Ok(mapping.clone());
        }
        let size = usize::try_from(self.handles.size)
            .map_err(|_| Error::InvalidResource("blob too large to map".into()))?;
        let new = Arc::new(
            self.device
                .with_backend(|backend| backend.map(self.handles.blob_handle, size))?,
        );
        *mapping = Some(new.clone());
        Ok(new)
    }

    pub fn mapping(&self) -> Option<Arc<BlobMapping>> {
        self.mapping.lock().unwrap().clone()
    }

    /// Exports the blob as a dma-buf. The blob itself stays alive.
    pub fn export(&self) -> Result<ExternalHandle> {
        let fd = self
            .device
            .with_backend(|backend| backend.export(self.handles.blob_handle))?;
        Ok(ExternalHandle::new(fd))
    }
}

impl Drop for BlobResource {
    fn drop(&mut self) {
        // Mappings go away before the GEM handle.
        if let Ok(mut mapping) = self.mapping.lock() {
            mapping.take();
        }
        let blob_handle = self.handles.blob_handle;
        if let Err(e) = self
            .device
            .with_backend(|backend| backend.close(blob_handle))
        {
            debug!("Closing blob {blob_handle} failed: {e}");
        }
    }
}
