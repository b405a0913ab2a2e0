// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(non_camel_case_types)]

use std::{
    fmt::{self, Display},
    mem::size_of,
};

use bitflags::bitflags;
use vm_memory::{ByteValued, Le32};

use crate::{Error, Result};

/// Associates a blob resource with a new render context on the host.
pub const GFXSTREAM_CONTEXT_CREATE: u32 = 0x1001;
/// Wakes the host consumer of a ring.
pub const GFXSTREAM_CONTEXT_PING: u32 = 0x1002;
/// Same as `GFXSTREAM_CONTEXT_PING`, the host signals the ring fence when done.
pub const GFXSTREAM_CONTEXT_PING_WITH_RESPONSE: u32 = 0x1003;

/// Default ring header region size advertised by the host.
pub const DEFAULT_RING_SIZE: u32 = 12288;
/// Default to-host buffer size advertised by the host.
pub const DEFAULT_BUFFER_SIZE: u32 = 1_048_576;
/// Blob alignment used when the host leaves the capset field zero.
pub const DEFAULT_BLOB_ALIGNMENT: u32 = 4096;

pub const VIRTIO_GPU_BLOB_MEM_GUEST: u32 = 0x0001;
pub const VIRTIO_GPU_BLOB_MEM_HOST3D: u32 = 0x0002;
pub const VIRTIO_GPU_BLOB_MEM_HOST3D_GUEST: u32 = 0x0003;

pub const VIRTIO_GPU_BLOB_FLAG_USE_MAPPABLE: u32 = 0x0001;
pub const VIRTIO_GPU_BLOB_FLAG_USE_SHAREABLE: u32 = 0x0002;
pub const VIRTIO_GPU_BLOB_FLAG_USE_CROSS_DEVICE: u32 = 0x0004;

/// Capability families exposed by a gfxstream virtio-gpu device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capset {
    GfxstreamVulkan,
    GfxstreamMagma,
    GfxstreamGles,
    GfxstreamComposer,
}

impl Capset {
    pub const ALL: [Self; 4] = [
        Self::GfxstreamVulkan,
        Self::GfxstreamMagma,
        Self::GfxstreamGles,
        Self::GfxstreamComposer,
    ];

    /// Numeric capset id as understood by the kernel driver.
    pub const fn id(self) -> u32 {
        match self {
            Self::GfxstreamVulkan => 3,
            Self::GfxstreamMagma => 7,
            Self::GfxstreamGles => 8,
            Self::GfxstreamComposer => 9,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|capset| capset.id() == id)
    }

    /// Size of the capset payload returned by `GET_CAPS`.
    pub const fn caps_size(self) -> usize {
        match self {
            Self::GfxstreamVulkan => size_of::<VulkanCapset>(),
            _ => size_of::<CommonCapset>(),
        }
    }
}

impl Display for Capset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GfxstreamVulkan => write!(f, "gfxstream-vulkan"),
            Self::GfxstreamMagma => write!(f, "gfxstream-magma"),
            Self::GfxstreamGles => write!(f, "gfxstream-gles"),
            Self::GfxstreamComposer => write!(f, "gfxstream-composer"),
        }
    }
}

/// Where the storage of a blob lives.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlobMem {
    Guest,
    #[default]
    Host3d,
    HostGuest,
}

impl BlobMem {
    pub const fn raw(self) -> u32 {
        match self {
            Self::Guest => VIRTIO_GPU_BLOB_MEM_GUEST,
            Self::Host3d => VIRTIO_GPU_BLOB_MEM_HOST3D,
            Self::HostGuest => VIRTIO_GPU_BLOB_MEM_HOST3D_GUEST,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            VIRTIO_GPU_BLOB_MEM_GUEST => Some(Self::Guest),
            VIRTIO_GPU_BLOB_MEM_HOST3D => Some(Self::Host3d),
            VIRTIO_GPU_BLOB_MEM_HOST3D_GUEST => Some(Self::HostGuest),
            _ => None,
        }
    }
}

bitflags! {
    /// Usage flags of a blob resource.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BlobFlags: u32 {
        const MAPPABLE = VIRTIO_GPU_BLOB_FLAG_USE_MAPPABLE;
        const SHAREABLE = VIRTIO_GPU_BLOB_FLAG_USE_SHAREABLE;
        const CROSS_DEVICE = VIRTIO_GPU_BLOB_FLAG_USE_CROSS_DEVICE;
    }
}

/// Parameters of a blob creation request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateBlob {
    pub blob_mem: BlobMem,
    pub flags: BlobFlags,
    pub size: u64,
    pub blob_id: u64,
}

impl CreateBlob {
    pub fn host3d_mappable(size: u64) -> Self {
        Self {
            blob_mem: BlobMem::Host3d,
            flags: BlobFlags::MAPPABLE,
            size,
            blob_id: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct gfxstream_header {
    pub op_code: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for gfxstream_header {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct gfxstream_context_create {
    pub hdr: gfxstream_header,
    pub resource_id: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for gfxstream_context_create {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct gfxstream_context_ping {
    pub hdr: gfxstream_header,
    pub resource_id: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for gfxstream_context_ping {}

/// Control command carried in an execbuffer of a gfxstream context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    ContextCreate { resource_id: u32 },
    ContextPing { resource_id: u32 },
    ContextPingWithResponse { resource_id: u32 },
}

impl ControlCommand {
    pub const fn resource_id(&self) -> u32 {
        match *self {
            Self::ContextCreate { resource_id }
            | Self::ContextPing { resource_id }
            | Self::ContextPingWithResponse { resource_id } => resource_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::ContextCreate { resource_id } => gfxstream_context_create {
                hdr: gfxstream_header {
                    op_code: GFXSTREAM_CONTEXT_CREATE.into(),
                },
                resource_id: resource_id.into(),
            }
            .as_slice()
            .to_vec(),
            Self::ContextPing { resource_id } => ping_bytes(GFXSTREAM_CONTEXT_PING, resource_id),
            Self::ContextPingWithResponse { resource_id } => {
                ping_bytes(GFXSTREAM_CONTEXT_PING_WITH_RESPONSE, resource_id)
            }
        }
    }

    pub fn decode(cmd: &[u8]) -> Result<Self> {
        let hdr = read_struct::<gfxstream_header>(cmd)?;

        match u32::from(hdr.op_code) {
            GFXSTREAM_CONTEXT_CREATE => {
                let create = read_struct::<gfxstream_context_create>(cmd)?;
                Ok(Self::ContextCreate {
                    resource_id: create.resource_id.into(),
                })
            }
            op @ (GFXSTREAM_CONTEXT_PING | GFXSTREAM_CONTEXT_PING_WITH_RESPONSE) => {
                let ping = read_struct::<gfxstream_context_ping>(cmd)?;
                let resource_id = ping.resource_id.into();
                if op == GFXSTREAM_CONTEXT_PING {
                    Ok(Self::ContextPing { resource_id })
                } else {
                    Ok(Self::ContextPingWithResponse { resource_id })
                }
            }
            op => Err(Error::ProtocolError(format!(
                "unknown control opcode {op:#x}"
            ))),
        }
    }
}

fn ping_bytes(op_code: u32, resource_id: u32) -> Vec<u8> {
    gfxstream_context_ping {
        hdr: gfxstream_header {
            op_code: op_code.into(),
        },
        resource_id: resource_id.into(),
        padding: 0.into(),
    }
    .as_slice()
    .to_vec()
}

fn read_struct<T: ByteValued + Default>(bytes: &[u8]) -> Result<T> {
    let raw = bytes.get(..size_of::<T>()).ok_or(Error::ProtocolError(format!(
        "control command too short: {} bytes",
        bytes.len()
    )))?;
    // The control buffer has no alignment guarantee, so copy it out first.
    let mut val = T::default();
    val.as_mut_slice().copy_from_slice(raw);
    Ok(val)
}

/// Capset layout shared by the magma, gles and composer families.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CommonCapset {
    pub protocol_version: u32,
    pub ring_size: u32,
    pub buffer_size: u32,
    pub blob_alignment: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for CommonCapset {}

/// Capset of the gfxstream vulkan family.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VulkanCapset {
    pub protocol_version: u32,
    pub ring_size: u32,
    pub buffer_size: u32,
    pub color_buffer_memory_index: u32,
    pub deferred_mapping: u32,
    pub blob_alignment: u32,
    pub no_render_control_enc: u32,
    pub always_blob: u32,
    pub external_sync: u32,
    pub virgl_supported_formats: [u32; 16],
    pub vulkan_batched_descriptor_set_update: u32,
    pub padding: [u32; 5],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for VulkanCapset {}

/// Sizing and feature data of one capset, independent of its wire layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Caps {
    pub capset: Capset,
    pub protocol_version: u32,
    pub ring_size: u32,
    pub buffer_size: u32,
    pub blob_alignment: u32,
    pub deferred_mapping: bool,
    pub no_render_control_enc: bool,
    pub always_blob: bool,
    pub external_sync: bool,
}

impl Caps {
    /// Host defaults for `capset`.
    pub fn host_default(capset: Capset) -> Self {
        Self {
            capset,
            protocol_version: 1,
            ring_size: DEFAULT_RING_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            blob_alignment: DEFAULT_BLOB_ALIGNMENT,
            deferred_mapping: false,
            no_render_control_enc: capset == Capset::GfxstreamVulkan,
            always_blob: false,
            external_sync: false,
        }
    }

    /// Parses the raw `GET_CAPS` payload of `capset`.
    pub fn from_bytes(capset: Capset, raw: &[u8]) -> Result<Self> {
        let mut caps = match capset {
            Capset::GfxstreamVulkan => {
                let vk = read_struct::<VulkanCapset>(raw)?;
                Self {
                    capset,
                    protocol_version: vk.protocol_version,
                    ring_size: vk.ring_size,
                    buffer_size: vk.buffer_size,
                    blob_alignment: vk.blob_alignment,
                    deferred_mapping: vk.deferred_mapping != 0,
                    no_render_control_enc: vk.no_render_control_enc != 0,
                    always_blob: vk.always_blob != 0,
                    external_sync: vk.external_sync != 0,
                }
            }
            _ => {
                let common = read_struct::<CommonCapset>(raw)?;
                Self {
                    capset,
                    protocol_version: common.protocol_version,
                    ring_size: common.ring_size,
                    buffer_size: common.buffer_size,
                    blob_alignment: common.blob_alignment,
                    deferred_mapping: false,
                    no_render_control_enc: false,
                    always_blob: false,
                    external_sync: false,
                }
            }
        };
        if caps.blob_alignment == 0 {
            caps.blob_alignment = DEFAULT_BLOB_ALIGNMENT;
        }
        Ok(caps)
    }

    /// Encodes `self` with the wire layout of its capset.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.capset {
            Capset::GfxstreamVulkan => VulkanCapset {
                protocol_version: self.protocol_version,
                ring_size: self.ring_size,
                buffer_size: self.buffer_size,
                blob_alignment: self.blob_alignment,
                deferred_mapping: self.deferred_mapping.into(),
                no_render_control_enc: self.no_render_control_enc.into(),
                always_blob: self.always_blob.into(),
                external_sync: self.external_sync.into(),
                ..Default::default()
            }
            .as_slice()
            .to_vec(),
            _ => CommonCapset {
                protocol_version: self.protocol_version,
                ring_size: self.ring_size,
                buffer_size: self.buffer_size,
                blob_alignment: self.blob_alignment,
            }
            .as_slice()
            .to_vec(),
        }
    }

    /// Total size of the blob backing one ring stream.
    pub fn ring_blob_size(&self) -> u64 {
        align_up(
            u64::from(self.ring_size) + u64::from(self.buffer_size),
            u64::from(self.blob_alignment),
        )
    }
}

pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}
