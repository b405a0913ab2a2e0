// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Address space graphics: command streams between a guest encoder and a
//! host decoder, carried by rings in shared virtio-gpu blobs.

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod api_call;
pub mod blob;
pub mod completion;
pub mod config;
pub mod consumer;
pub mod health;
pub mod ops;
pub mod protocol;
pub mod render_thread;
pub mod ring;
pub mod snapshot;
pub mod staging;
pub mod stream;
pub mod virtgpu;
#[cfg(test)]
pub(crate) mod testutils;

use std::{io, time::Duration};

use thiserror::Error as ThisError;
use vmm_sys_util::errno;

pub use crate::{
    config::AsgConfig,
    protocol::Capset,
    stream::{create_virtio_gpu_stream, AddressSpaceStream},
    virtgpu::Device,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of failure callers react to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The kernel refused an allocation. Retrying after releasing resources
    /// may help.
    OutOfMemory,
    /// The device is gone for good.
    DeviceLost,
    Busy,
    StreamStalled,
    StreamClosed,
    ProtocolError,
    SnapshotVersionMismatch,
    /// Misuse or an unexpected system error.
    Other,
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Device busy")]
    Busy,
    #[error("Stream made no progress for {0:?}")]
    StreamStalled(Duration),
    #[error("Stream closed")]
    StreamClosed,
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Snapshot version {found} does not match {expected}")]
    SnapshotVersionMismatch { expected: u32, found: u32 },
    #[error("Malformed snapshot: {0}")]
    SnapshotFormat(String),
    #[error("{0} failed: {1}")]
    Ioctl(&'static str, errno::Error),
    #[error("I/O error: {0}")]
    Io(io::Error),
    #[error("Failed to map blob: {0}")]
    Mmap(io::Error),
    #[error("Blob is not mappable")]
    NotMappable,
    #[error("Invalid resource: {0}")]
    InvalidResource(String),
    #[error("Invalid ring layout: {0}")]
    InvalidLayout(String),
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    #[error("Failed to load configuration: {0}")]
    Config(Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Commit of {size} bytes exceeds the {capacity} bytes allocated")]
    InvalidCommit { size: usize, capacity: usize },
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory => ErrorKind::OutOfMemory,
            Self::DeviceLost => ErrorKind::DeviceLost,
            Self::Busy => ErrorKind::Busy,
            Self::StreamStalled(_) => ErrorKind::StreamStalled,
            Self::StreamClosed => ErrorKind::StreamClosed,
            Self::ProtocolError(_) | Self::SnapshotFormat(_) => ErrorKind::ProtocolError,
            Self::SnapshotVersionMismatch { .. } => ErrorKind::SnapshotVersionMismatch,
            Self::Ioctl(..)
            | Self::Io(_)
            | Self::Mmap(_)
            | Self::NotMappable
            | Self::InvalidResource(_)
            | Self::InvalidLayout(_)
            | Self::Unsupported(_)
            | Self::Config(_)
            | Self::InvalidConfig(_)
            | Self::InvalidCommit { .. } => ErrorKind::Other,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::Io(e) => return e,
            Error::OutOfMemory => io::ErrorKind::OutOfMemory,
            Error::Busy => io::ErrorKind::WouldBlock,
            Error::StreamStalled(_) => io::ErrorKind::TimedOut,
            Error::StreamClosed => io::ErrorKind::BrokenPipe,
            Error::ProtocolError(_) | Error::SnapshotFormat(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        Self::new(kind, e)
    }
}
