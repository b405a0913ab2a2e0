// One shot completion with cancel on drop
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// Terminal state of a completion, or `Unknown` while pending.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionState {
    Unknown,
    Success,
    Cancelled,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Shared {
    /// Moves to `state` unless a terminal state was already published.
    fn publish(&self, state: CompletionState) {
        let mut current = self.state.lock().unwrap();
        if *current == CompletionState::Unknown {
            *current = state;
            self.cond.notify_all();
        }
    }
}

/// Producer side. Dropping it without `mark_complete` cancels every future.
#[derive(Debug)]
pub struct AutoCancelingPromise {
    shared: Arc<Shared>,
}

impl AutoCancelingPromise {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CompletionState::Unknown),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn future(&self) -> CancelableFuture {
        CancelableFuture {
            shared: self.shared.clone(),
        }
    }

    pub fn mark_complete(&self) {
        self.shared.publish(CompletionState::Success);
    }
}

impl Default for AutoCancelingPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AutoCancelingPromise {
    fn drop(&mut self) {
        self.shared.publish(CompletionState::Cancelled);
    }
}

/// Consumer side, cheap to clone. All clones see the same terminal state.
#[derive(Clone, Debug)]
pub struct CancelableFuture {
    shared: Arc<Shared>,
}

impl CancelableFuture {
    /// Current state without blocking.
    pub fn state(&self) -> CompletionState {
        *self.shared.state.lock().unwrap()
    }

    /// Blocks until the promise completes or is dropped.
    pub fn get(&self) -> CompletionState {
        let state = self.shared.state.lock().unwrap();
        *self
            .shared
            .cond
            .wait_while(state, |s| *s == CompletionState::Unknown)
            .unwrap()
    }

    /// Like `get`, but gives up after `timeout` and returns `Unknown`.
    pub fn wait_timeout(&self, timeout: Duration) -> CompletionState {
        let state = self.shared.state.lock().unwrap();
        let (state, _) = self
            .shared
            .cond
            .wait_timeout_while(state, timeout, |s| *s == CompletionState::Unknown)
            .unwrap();
        *state
    }
}
