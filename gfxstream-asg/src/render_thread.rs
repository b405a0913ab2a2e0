// Per render thread state and its registry
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
};

use log::debug;

use crate::api_call::ApiCallManager;

/// Serialized GL state owned by a render thread, plus the textures it
/// references.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlInfo {
    pub payload: Vec<u8>,
    pub texture_ids: Vec<u32>,
}

/// Serialized Vulkan state owned by a render thread. The calls that created
/// its live handles are kept so they can be replayed after a load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VkInfo {
    pub payload: Vec<u8>,
    pub texture_ids: Vec<u32>,
    pub api_calls: ApiCallManager,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextState {
    /// Process unique id, stable for the life of the process.
    pub puid: Option<u64>,
    pub gl: Option<GlInfo>,
    pub vk: Option<VkInfo>,
}

impl ContextState {
    /// Api call records of the Vulkan state, which is created empty if the
    /// thread had none yet.
    pub fn api_calls(&mut self) -> &mut ApiCallManager {
        &mut self.vk.get_or_insert_with(VkInfo::default).api_calls
    }
}

type SharedState = Arc<Mutex<ContextState>>;

thread_local! {
    static CURRENT: RefCell<Option<(u64, Weak<Mutex<ContextState>>)>> = const { RefCell::new(None) };
}

/// Every live `RenderThreadContext`, by registration order. Entries do not
/// keep contexts alive; contexts remove themselves when dropped.
#[derive(Debug)]
pub struct RenderThreadRegistry {
    next_id: AtomicU64,
    next_puid: AtomicU64,
    contexts: RwLock<BTreeMap<u64, Weak<Mutex<ContextState>>>>,
}

impl Default for RenderThreadRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_puid: AtomicU64::new(1),
            contexts: RwLock::new(BTreeMap::new()),
        }
    }
}

impl RenderThreadRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocate_puid(&self) -> u64 {
        self.next_puid.fetch_add(1, Ordering::Relaxed)
    }

    /// Keeps `allocate_puid` from handing out `puid` later on.
    fn reserve_puid(&self, puid: u64) {
        self.next_puid
            .fetch_max(puid.saturating_add(1), Ordering::Relaxed);
    }

    fn register(&self, state: &SharedState) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.contexts
            .write()
            .unwrap()
            .insert(id, Arc::downgrade(state));
        id
    }

    fn unregister(&self, id: u64) {
        self.contexts.write().unwrap().remove(&id);
    }

    /// Calls `f` on every live context, holding the registry lock.
    /// `f` must not create or drop contexts of this registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ContextState),
    {
        let contexts = self.contexts.read().unwrap();
        for state in contexts.values().filter_map(Weak::upgrade) {
            f(&state.lock().unwrap());
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn puids(&self) -> Vec<u64> {
        let mut puids = Vec::new();
        self.for_each(|state| puids.extend(state.puid));
        puids
    }

    /// Copies of every live context state.
    pub fn states(&self) -> Vec<ContextState> {
        let mut states = Vec::new();
        self.for_each(|state| states.push(state.clone()));
        states
    }
}

/// State of one render thread, registered for the lifetime of the value.
#[derive(Debug)]
pub struct RenderThreadContext {
    id: u64,
    state: SharedState,
    registry: Arc<RenderThreadRegistry>,
}

impl RenderThreadContext {
    /// Registers a fresh context with a new PUID and makes it current on the
    /// calling thread.
    pub fn new(registry: &Arc<RenderThreadRegistry>) -> Self {
        let state = ContextState {
            puid: Some(registry.allocate_puid()),
            ..ContextState::default()
        };
        let context = Self::restore(registry, state);
        context.bind_current();
        context
    }

    /// Registers a context with previously saved state. It is not current
    /// anywhere until `bind_current` is called on its thread.
    pub fn restore(registry: &Arc<RenderThreadRegistry>, state: ContextState) -> Self {
        if let Some(puid) = state.puid {
            registry.reserve_puid(puid);
        }
        let state = Arc::new(Mutex::new(state));
        let id = registry.register(&state);
        debug!("render thread context {id} registered");
        Self {
            id,
            state,
            registry: registry.clone(),
        }
    }

    pub fn bind_current(&self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = Some((self.id, Arc::downgrade(&self.state)));
        });
    }

    /// Runs `f` on the context current on this thread, if any.
    pub fn with_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&mut ContextState) -> R,
    {
        let state = CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(|(_, state)| state.upgrade())
        })?;
        let mut state = state.lock().unwrap();
        Some(f(&mut state))
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn puid(&self) -> Option<u64> {
        self.state().puid
    }

    pub fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap()
    }

    pub fn set_gl(&self, gl: Option<GlInfo>) {
        self.state().gl = gl;
    }

    pub fn set_vk(&self, vk: Option<VkInfo>) {
        self.state().vk = vk;
    }
}

impl Drop for RenderThreadContext {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if matches!(*current, Some((id, _)) if id == self.id) {
                *current = None;
            }
        });
        debug!("render thread context {} unregistered", self.id);
    }
}
