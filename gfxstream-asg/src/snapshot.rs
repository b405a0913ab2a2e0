// Snapshot of render thread state
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Stream layout, all integers big-endian:
//!
//! ```text
//! MAGIC u32 | VERSION u32 | COUNT u32
//! COUNT x { TAG u8 | [PUID u64] | HAS_GL u32 | [section] | HAS_VK u32 | [section] }
//! section = LEN u32 | payload | TEXTURE_COUNT u32 | TEXTURE_COUNT x id u32
//! ```
//!
//! The Vulkan payload is itself `LEN u32 | state | api call records`, the
//! records in the `ApiCallManager::save` format.
//!
//! Texture pixels go to a separate side-car stream.

use std::{
    collections::BTreeMap,
    io::{self, Cursor, Read, Write},
    sync::{Arc, Mutex},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};

use crate::{
    api_call::ApiCallManager,
    consumer::{PauseGate, RenderThreadEnv},
    render_thread::{ContextState, GlInfo, RenderThreadContext, RenderThreadRegistry, VkInfo},
    Error, Result,
};

pub const SNAPSHOT_MAGIC: u32 = 0x4753_4E50;
pub const SNAPSHOT_VERSION: u32 = 1;

const TAG_HAS_PUID: u8 = 1 << 0;

/// Saves the pixels of a texture referenced by a saved context.
#[cfg_attr(test, mockall::automock)]
pub trait TextureSaver {
    fn save_texture(&mut self, id: u32) -> Result<()>;
}

/// Restores the pixels of a texture referenced by a loaded context.
#[cfg_attr(test, mockall::automock)]
pub trait TextureLoader {
    fn load_texture(&mut self, id: u32) -> Result<()>;
}

/// Pixel data of the textures render threads refer to, by id.
#[derive(Debug, Default)]
pub struct TextureStore {
    textures: Mutex<BTreeMap<u32, Vec<u8>>>,
}

impl TextureStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: u32, pixels: Vec<u8>) {
        self.textures.lock().unwrap().insert(id, pixels);
    }

    pub fn get(&self, id: u32) -> Option<Vec<u8>> {
        self.textures.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.textures.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.textures.lock().unwrap().clear();
    }
}

/// Writes `ID u32 | LEN u32 | pixels` records for every saved texture.
pub struct SideCarWriter<W: Write> {
    store: Arc<TextureStore>,
    out: W,
}

impl<W: Write> SideCarWriter<W> {
    pub fn new(store: Arc<TextureStore>, out: W) -> Self {
        Self { store, out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> TextureSaver for SideCarWriter<W> {
    fn save_texture(&mut self, id: u32) -> Result<()> {
        let pixels = self
            .store
            .get(id)
            .ok_or_else(|| Error::SnapshotFormat(format!("texture {id} does not exist")))?;
        let len = u32::try_from(pixels.len())
            .map_err(|_| Error::SnapshotFormat(format!("texture {id} too large")))?;
        self.out.write_u32::<BigEndian>(id).map_err(Error::Io)?;
        self.out.write_u32::<BigEndian>(len).map_err(Error::Io)?;
        self.out.write_all(&pixels).map_err(Error::Io)
    }
}

/// Reads the records of a `SideCarWriter` back into a `TextureStore`.
pub struct SideCarReader<R: Read> {
    store: Arc<TextureStore>,
    input: R,
}

impl<R: Read> SideCarReader<R> {
    pub fn new(store: Arc<TextureStore>, input: R) -> Self {
        Self { store, input }
    }
}

impl<R: Read> TextureLoader for SideCarReader<R> {
    fn load_texture(&mut self, id: u32) -> Result<()> {
        let found = self.input.read_u32::<BigEndian>().map_err(truncated)?;
        if found != id {
            return Err(Error::SnapshotFormat(format!(
                "expected texture {id}, found {found}"
            )));
        }
        let pixels = read_bytes(&mut self.input)?;
        self.store.insert(id, pixels);
        Ok(())
    }
}

pub(crate) fn truncated(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::SnapshotFormat("truncated snapshot".to_string())
    } else {
        Error::Io(e)
    }
}

/// Writes `len` as a u32 length or count field.
pub(crate) fn write_len(out: &mut dyn Write, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::SnapshotFormat(format!("length {len} does not fit in 32 bits")))?;
    out.write_u32::<BigEndian>(len).map_err(Error::Io)
}

/// Reads a `LEN u32 | bytes` field.
pub(crate) fn read_bytes(input: &mut dyn Read) -> Result<Vec<u8>> {
    let len = input.read_u32::<BigEndian>().map_err(truncated)?;
    let mut bytes = Vec::new();
    // Bounded by the stream, not by `len`.
    input
        .take(u64::from(len))
        .read_to_end(&mut bytes)
        .map_err(Error::Io)?;
    if bytes.len() != len as usize {
        return Err(Error::SnapshotFormat("truncated snapshot".to_string()));
    }
    Ok(bytes)
}

fn write_section(out: &mut dyn Write, section: Option<(&[u8], &[u32])>) -> Result<()> {
    let Some((payload, texture_ids)) = section else {
        return out.write_u32::<BigEndian>(0).map_err(Error::Io);
    };
    out.write_u32::<BigEndian>(1).map_err(Error::Io)?;
    write_len(out, payload.len())?;
    out.write_all(payload).map_err(Error::Io)?;
    write_len(out, texture_ids.len())?;
    for id in texture_ids {
        out.write_u32::<BigEndian>(*id).map_err(Error::Io)?;
    }
    Ok(())
}

fn read_section(input: &mut dyn Read) -> Result<Option<(Vec<u8>, Vec<u32>)>> {
    match input.read_u32::<BigEndian>().map_err(truncated)? {
        0 => return Ok(None),
        1 => {}
        other => {
            return Err(Error::SnapshotFormat(format!(
                "bad section presence {other}"
            )))
        }
    }
    let payload = read_bytes(input)?;
    let count = input.read_u32::<BigEndian>().map_err(truncated)?;
    let texture_ids = (0..count)
        .map(|_| input.read_u32::<BigEndian>().map_err(truncated))
        .collect::<Result<_>>()?;
    Ok(Some((payload, texture_ids)))
}

/// The Vulkan section payload: `LEN u32 | state | api call records`.
fn encode_vk(vk: &VkInfo) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_len(&mut out, vk.payload.len())?;
    out.extend_from_slice(&vk.payload);
    vk.api_calls.save(&mut out)?;
    Ok(out)
}

fn decode_vk(bytes: Vec<u8>, texture_ids: Vec<u32>) -> Result<VkInfo> {
    let mut input = Cursor::new(bytes);
    let payload = read_bytes(&mut input)?;
    let api_calls = ApiCallManager::load(&mut input)?;
    if input.position() != input.get_ref().len() as u64 {
        return Err(Error::SnapshotFormat(
            "trailing bytes after the vulkan state".to_string(),
        ));
    }
    Ok(VkInfo {
        payload,
        texture_ids,
        api_calls,
    })
}

/// Serializes `states` in the snapshot stream format.
pub fn write_snapshot(out: &mut dyn Write, states: &[ContextState]) -> Result<()> {
    out.write_u32::<BigEndian>(SNAPSHOT_MAGIC)
        .map_err(Error::Io)?;
    out.write_u32::<BigEndian>(SNAPSHOT_VERSION)
        .map_err(Error::Io)?;
    write_len(out, states.len())?;
    for state in states {
        match state.puid {
            Some(puid) => {
                out.write_u8(TAG_HAS_PUID).map_err(Error::Io)?;
                out.write_u64::<BigEndian>(puid).map_err(Error::Io)?;
            }
            None => out.write_u8(0).map_err(Error::Io)?,
        }
        write_section(
            out,
            state
                .gl
                .as_ref()
                .map(|gl| (gl.payload.as_slice(), gl.texture_ids.as_slice())),
        )?;
        let vk = state.vk.as_ref().map(encode_vk).transpose()?;
        write_section(
            out,
            vk.as_deref()
                .zip(state.vk.as_ref().map(|vk| vk.texture_ids.as_slice())),
        )?;
    }
    Ok(())
}

/// Parses a whole snapshot stream. Nothing is returned unless every record
/// is well formed.
pub fn read_snapshot(input: &mut dyn Read) -> Result<Vec<ContextState>> {
    let magic = input.read_u32::<BigEndian>().map_err(truncated)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(Error::SnapshotFormat(format!("bad magic {magic:#x}")));
    }
    let version = input.read_u32::<BigEndian>().map_err(truncated)?;
    if version != SNAPSHOT_VERSION {
        return Err(Error::SnapshotVersionMismatch {
            expected: SNAPSHOT_VERSION,
            found: version,
        });
    }

    let count = input.read_u32::<BigEndian>().map_err(truncated)?;
    let mut states = Vec::new();
    for _ in 0..count {
        let tag = input.read_u8().map_err(truncated)?;
        if tag & !TAG_HAS_PUID != 0 {
            return Err(Error::SnapshotFormat(format!("bad record tag {tag:#x}")));
        }
        let puid = if tag & TAG_HAS_PUID != 0 {
            Some(input.read_u64::<BigEndian>().map_err(truncated)?)
        } else {
            None
        };
        let gl = read_section(input)?.map(|(payload, texture_ids)| GlInfo {
            payload,
            texture_ids,
        });
        let vk = read_section(input)?
            .map(|(bytes, texture_ids)| decode_vk(bytes, texture_ids))
            .transpose()?;
        states.push(ContextState { puid, gl, vk });
    }
    Ok(states)
}

fn texture_ids(states: &[ContextState]) -> impl Iterator<Item = u32> + '_ {
    states.iter().flat_map(|state| {
        let gl = state.gl.iter().flat_map(|gl| gl.texture_ids.iter());
        let vk = state.vk.iter().flat_map(|vk| vk.texture_ids.iter());
        gl.chain(vk).copied()
    })
}

/// Drives the pause, save, load and resume phases over all render threads.
#[derive(Clone, Debug)]
pub struct SnapshotCoordinator {
    registry: Arc<RenderThreadRegistry>,
    gate: Arc<PauseGate>,
}

impl SnapshotCoordinator {
    pub fn new(registry: Arc<RenderThreadRegistry>, gate: Arc<PauseGate>) -> Self {
        Self { registry, gate }
    }

    pub fn from_env(env: &RenderThreadEnv) -> Self {
        Self::new(env.registry.clone(), env.gate.clone())
    }

    /// Blocks until every render thread is parked between two packets.
    pub fn presave_pause(&self) {
        info!("snapshot: pausing render threads");
        self.gate.pause();
        debug!("snapshot: {} contexts paused", self.registry.len());
    }

    /// Writes every registered context to `out` and its textures to `saver`.
    pub fn save(&self, out: &mut dyn Write, saver: &mut dyn TextureSaver) -> Result<()> {
        let states = self.registry.states();
        write_snapshot(out, &states)?;
        for id in texture_ids(&states) {
            saver.save_texture(id)?;
        }
        info!("snapshot: saved {} contexts", states.len());
        Ok(())
    }

    /// Restores the contexts saved in `input`. A stream of another version or
    /// with a malformed record is rejected before any state changes. The
    /// returned contexts stay registered as long as they are alive.
    pub fn load(
        &self,
        input: &mut dyn Read,
        loader: &mut dyn TextureLoader,
    ) -> Result<Vec<RenderThreadContext>> {
        let states = read_snapshot(input)?;
        for id in texture_ids(&states) {
            loader.load_texture(id)?;
        }
        info!("snapshot: loaded {} contexts", states.len());
        Ok(states
            .into_iter()
            .map(|state| RenderThreadContext::restore(&self.registry, state))
            .collect())
    }

    /// Releases the render threads once the snapshot was written, returning
    /// after all of them are running again.
    pub fn postsave_resume(&self) {
        self.gate.resume(true);
        info!("snapshot: resumed after save");
    }

    /// Releases the render threads without waiting for them.
    pub fn postload_resume(&self) {
        self.gate.resume(false);
        info!("snapshot: resumed after load");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom};

    use assert_matches::assert_matches;
    use mockall::{predicate::eq, Sequence};

    use super::*;

    fn coordinator() -> SnapshotCoordinator {
        SnapshotCoordinator::new(RenderThreadRegistry::new(), PauseGate::new())
    }

    #[test]
    fn test_wire_format() {
        let states = [ContextState {
            puid: Some(0xDEAD_BEEF_CAFE_BABE),
            gl: None,
            vk: Some(VkInfo {
                payload: vec![0x10, 0x20],
                texture_ids: vec![7],
                ..VkInfo::default()
            }),
        }];
        let mut out = Vec::new();
        write_snapshot(&mut out, &states).unwrap();
        assert_eq!(
            out,
            [
                0x47, 0x53, 0x4e, 0x50, // magic
                0, 0, 0, 1, // version
                0, 0, 0, 1, // count
                1, // tag
                0xde, 0xad, 0xbe, 0xef, 0xca, 0xfe, 0xba, 0xbe, // puid
                0, 0, 0, 0, // no gl
                0, 0, 0, 1, // vk
                0, 0, 0, 10, // section length
                0, 0, 0, 2, 0x10, 0x20, // payload
                0, 0, 0, 0, // api calls
                0, 0, 0, 1, 0, 0, 0, 7, // textures
            ]
        );
        assert_eq!(read_snapshot(&mut Cursor::new(out)).unwrap(), states);
    }

    #[test]
    fn test_version_mismatch_touches_nothing() {
        let coordinator = coordinator();
        let mut out = Vec::new();
        write_snapshot(
            &mut out,
            &[ContextState {
                puid: Some(1),
                gl: Some(GlInfo {
                    payload: vec![1],
                    texture_ids: vec![3],
                }),
                vk: None,
            }],
        )
        .unwrap();
        out[7] = 2;

        let mut loader = MockTextureLoader::new();
        loader.expect_load_texture().times(0);
        assert_matches!(
            coordinator.load(&mut Cursor::new(out), &mut loader),
            Err(Error::SnapshotVersionMismatch {
                expected: 1,
                found: 2
            })
        );
        assert!(coordinator.registry.is_empty());
    }

    #[test]
    fn test_malformed_streams() {
        let coordinator = coordinator();
        let mut loader = MockTextureLoader::new();
        loader.expect_load_texture().times(0);

        let bad_magic = [0u8; 12];
        assert_matches!(
            coordinator.load(&mut Cursor::new(bad_magic), &mut loader),
            Err(Error::SnapshotFormat(_))
        );

        let mut out = Vec::new();
        write_snapshot(
            &mut out,
            &[ContextState {
                puid: None,
                gl: None,
                vk: Some(VkInfo {
                    payload: vec![0; 16],
                    texture_ids: vec![1, 2],
                    ..VkInfo::default()
                }),
            }],
        )
        .unwrap();
        // Cut inside the vk payload.
        out.truncate(30);
        assert_matches!(
            coordinator.load(&mut Cursor::new(out), &mut loader),
            Err(Error::SnapshotFormat(_))
        );
        assert!(coordinator.registry.is_empty());
    }

    #[test]
    fn test_trailing_vk_bytes_rejected() {
        let mut out = Vec::new();
        write_snapshot(
            &mut out,
            &[ContextState {
                puid: None,
                gl: None,
                vk: Some(VkInfo::default()),
            }],
        )
        .unwrap();
        // Grow the vk section by one byte the decoder does not expect.
        out[24] += 1;
        out.insert(33, 0xff);
        assert_matches!(
            read_snapshot(&mut Cursor::new(out)),
            Err(Error::SnapshotFormat(_))
        );
    }

    #[test]
    fn test_api_calls_survive_save_load() {
        let coordinator = coordinator();
        let mut state = ContextState {
            puid: Some(3),
            ..ContextState::default()
        };
        let mut expected = Vec::new();
        for packet in [[0x21u8], [0x22], [0x23]] {
            let mut call = state.api_calls().begin(&packet);
            let device = call.create_handle();
            let queues = [call.create_extra_handle(), call.create_extra_handle()];
            expected.push((packet.to_vec(), vec![device], queues.to_vec()));
        }
        let saved = RenderThreadContext::restore(&coordinator.registry, state);

        let mut saver = MockTextureSaver::new();
        saver.expect_save_texture().times(0);
        let mut out = Vec::new();
        coordinator.save(&mut out, &mut saver).unwrap();
        drop(saved);

        let mut loader = MockTextureLoader::new();
        loader.expect_load_texture().times(0);
        let restored = coordinator
            .load(&mut Cursor::new(out), &mut loader)
            .unwrap();
        assert_eq!(restored.len(), 1);
        let states = coordinator.registry.states();
        let api_calls = &states[0].vk.as_ref().unwrap().api_calls;
        let replayed: Vec<_> = api_calls
            .replay_order()
            .map(|record| {
                (
                    record.packet.clone(),
                    record.created_handles.clone(),
                    record.extra_created_handles.clone(),
                )
            })
            .collect();
        assert_eq!(replayed, expected);
    }

    #[test]
    fn test_textures_in_order() {
        let coordinator = coordinator();
        let first = RenderThreadContext::restore(
            &coordinator.registry,
            ContextState {
                puid: Some(1),
                gl: Some(GlInfo {
                    payload: vec![],
                    texture_ids: vec![5, 6],
                }),
                vk: Some(VkInfo {
                    payload: vec![],
                    texture_ids: vec![9],
                    ..VkInfo::default()
                }),
            },
        );

        let mut seq = Sequence::new();
        let mut saver = MockTextureSaver::new();
        for id in [5, 6, 9] {
            saver
                .expect_save_texture()
                .with(eq(id))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let mut out = Vec::new();
        coordinator.save(&mut out, &mut saver).unwrap();
        drop(first);

        let mut seq = Sequence::new();
        let mut loader = MockTextureLoader::new();
        for id in [5, 6, 9] {
            loader
                .expect_load_texture()
                .with(eq(id))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let restored = coordinator
            .load(&mut Cursor::new(out), &mut loader)
            .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(coordinator.registry.puids(), vec![1]);
    }

    #[test]
    fn test_side_car_file() {
        let store = TextureStore::new();
        store.insert(4, vec![0xaa; 32]);
        store.insert(8, vec![0xbb; 3]);

        let mut file = tempfile::tempfile().unwrap();
        let mut writer = SideCarWriter::new(store.clone(), &mut file);
        writer.save_texture(4).unwrap();
        writer.save_texture(8).unwrap();
        assert_matches!(writer.save_texture(5), Err(Error::SnapshotFormat(_)));

        store.clear();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = SideCarReader::new(store.clone(), &mut file);
        reader.load_texture(4).unwrap();
        assert_matches!(reader.load_texture(4), Err(Error::SnapshotFormat(_)));
        assert_eq!(store.get(4), Some(vec![0xaa; 32]));
        assert_eq!(store.len(), 1);
    }
}
