// Records of the API calls that created live handles
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::{BTreeMap, HashMap},
    io::{Read, Write},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::trace;

use crate::{
    snapshot::{read_bytes, truncated, write_len},
    Error, Result,
};

pub type ApiCallHandle = u64;
pub type BoxedHandle = u64;

/// One decoded API call kept for snapshot replay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiCallRecord {
    pub handle: ApiCallHandle,
    /// Raw bytes of the call as it arrived on the ring.
    pub packet: Vec<u8>,
    pub created_handles: Vec<BoxedHandle>,
    /// Handles created as a side effect, in creation order.
    pub extra_created_handles: Vec<BoxedHandle>,
}

impl ApiCallRecord {
    fn handles(&self) -> impl Iterator<Item = BoxedHandle> + '_ {
        self.created_handles
            .iter()
            .chain(&self.extra_created_handles)
            .copied()
    }
}

/// Allocates boxed handles and remembers which call created each of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiCallManager {
    next_call: ApiCallHandle,
    next_boxed: BoxedHandle,
    records: BTreeMap<ApiCallHandle, ApiCallRecord>,
    owners: HashMap<BoxedHandle, ApiCallHandle>,
}

impl Default for ApiCallManager {
    fn default() -> Self {
        Self {
            next_call: 1,
            next_boxed: 1,
            records: BTreeMap::new(),
            owners: HashMap::new(),
        }
    }
}

/// A call being decoded. Handles can only be created through it, so each
/// one lands in the record of the call that made it.
#[derive(Debug)]
pub struct ActiveCall<'a> {
    manager: &'a mut ApiCallManager,
    record: Option<ApiCallRecord>,
}

impl ActiveCall<'_> {
    pub fn handle(&self) -> ApiCallHandle {
        self.record.as_ref().map_or(0, |record| record.handle)
    }

    fn allocate(&mut self) -> BoxedHandle {
        let boxed = self.manager.next_boxed;
        self.manager.next_boxed += 1;
        self.manager.owners.insert(boxed, self.handle());
        boxed
    }

    /// A handle the call returns to the guest.
    pub fn create_handle(&mut self) -> BoxedHandle {
        let boxed = self.allocate();
        if let Some(record) = self.record.as_mut() {
            record.created_handles.push(boxed);
        }
        boxed
    }

    /// A handle the call creates internally.
    pub fn create_extra_handle(&mut self) -> BoxedHandle {
        let boxed = self.allocate();
        if let Some(record) = self.record.as_mut() {
            record.extra_created_handles.push(boxed);
        }
        boxed
    }

    /// Ends the call. Calls that created nothing are not kept.
    pub fn finish(mut self) -> Option<ApiCallHandle> {
        self.commit()
    }

    fn commit(&mut self) -> Option<ApiCallHandle> {
        let record = self.record.take()?;
        if record.handles().next().is_none() {
            return None;
        }
        let handle = record.handle;
        trace!(
            "api call {handle}: {} handles, {} extra",
            record.created_handles.len(),
            record.extra_created_handles.len()
        );
        self.manager.records.insert(handle, record);
        Some(handle)
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

impl ApiCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording the call encoded in `packet`.
    pub fn begin(&mut self, packet: &[u8]) -> ActiveCall<'_> {
        let handle = self.next_call;
        self.next_call += 1;
        ActiveCall {
            manager: self,
            record: Some(ApiCallRecord {
                handle,
                packet: packet.to_vec(),
                ..ApiCallRecord::default()
            }),
        }
    }

    pub fn get(&self, handle: ApiCallHandle) -> Option<&ApiCallRecord> {
        self.records.get(&handle)
    }

    /// Call that created `boxed`.
    pub fn owner(&self, boxed: BoxedHandle) -> Option<ApiCallHandle> {
        self.owners.get(&boxed).copied()
    }

    /// Forgets `boxed`. The record of its call goes away with the last of
    /// its handles.
    pub fn destroy_handle(&mut self, boxed: BoxedHandle) -> Result<()> {
        let call = self
            .owners
            .remove(&boxed)
            .ok_or_else(|| Error::InvalidResource(format!("unknown handle {boxed}")))?;
        let alive = self
            .records
            .get(&call)
            .is_some_and(|record| record.handles().any(|h| self.owners.contains_key(&h)));
        if !alive {
            self.records.remove(&call);
        }
        Ok(())
    }

    /// Records still holding live handles, in call order.
    pub fn replay_order(&self) -> impl Iterator<Item = &ApiCallRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_len(out, self.records.len())?;
        for record in self.records.values() {
            out.write_u64::<BigEndian>(record.handle).map_err(Error::Io)?;
            write_len(out, record.packet.len())?;
            out.write_all(&record.packet).map_err(Error::Io)?;
            for handles in [&record.created_handles, &record.extra_created_handles] {
                write_len(out, handles.len())?;
                for handle in handles {
                    out.write_u64::<BigEndian>(*handle).map_err(Error::Io)?;
                }
            }
        }
        Ok(())
    }

    /// Rebuilds a manager from `save` output. Only handles still alive at
    /// save time come back.
    pub fn load(input: &mut dyn Read) -> Result<Self> {
        let mut manager = Self::default();
        let count = input.read_u32::<BigEndian>().map_err(truncated)?;
        for _ in 0..count {
            let handle = input.read_u64::<BigEndian>().map_err(truncated)?;
            let packet = read_bytes(input)?;
            let created_handles = read_handles(input)?;
            let extra_created_handles = read_handles(input)?;

            let record = ApiCallRecord {
                handle,
                packet,
                created_handles,
                extra_created_handles,
            };
            for boxed in record.handles() {
                manager.owners.insert(boxed, handle);
                manager.next_boxed = manager.next_boxed.max(boxed + 1);
            }
            manager.next_call = manager.next_call.max(handle + 1);
            manager.records.insert(handle, record);
        }
        Ok(manager)
    }
}

fn read_handles(input: &mut dyn Read) -> Result<Vec<BoxedHandle>> {
    let count = input.read_u32::<BigEndian>().map_err(truncated)?;
    (0..count)
        .map(|_| input.read_u64::<BigEndian>().map_err(truncated))
        .collect()
}
