// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle flag shared by a connection and the worker driving its current request.
//!
//! Transitions only happen through [`ConnectionState::hold`], which hands the caller a
//! [`StateGuard`] while holding an exclusive lock. The value is mirrored in an atomic so the
//! `is_*` predicates can be read from anywhere without taking the lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            State::Disconnected => 0,
            State::Connecting => 1,
            State::Connected => 2,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct ConnectionState {
    value: AtomicU8,
    // id of the epoch that last moved the state into `Connecting`
    owner: Mutex<u64>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(State::Disconnected.as_u8()),
            owner: Mutex::new(0),
        }
    }

    /// Runs `action` with exclusive access to the state and returns its result.
    ///
    /// Other callers of `hold` block until `action` returns. A panic inside a previous holder
    /// does not poison the state.
    pub fn hold<R>(&self, action: impl FnOnce(&mut StateGuard<'_>) -> R) -> R {
        let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = StateGuard {
            value: &self.value,
            owner,
        };
        action(&mut guard)
    }

    pub fn get(&self) -> State {
        State::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn is_disconnected(&self) -> bool {
        self.get() == State::Disconnected
    }

    pub fn is_connecting(&self) -> bool {
        self.get() == State::Connecting
    }

    pub fn is_connected(&self) -> bool {
        self.get() == State::Connected
    }
}

/// Exclusive view of a [`ConnectionState`], only reachable from inside [`ConnectionState::hold`].
pub struct StateGuard<'a> {
    value: &'a AtomicU8,
    owner: MutexGuard<'a, u64>,
}

impl StateGuard<'_> {
    pub fn get(&self) -> State {
        State::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Epoch that currently owns the state.
    pub fn epoch(&self) -> u64 {
        *self.owner
    }

    pub fn is_disconnected(&self) -> bool {
        self.get() == State::Disconnected
    }

    pub fn is_connecting(&self) -> bool {
        self.get() == State::Connecting
    }

    pub fn is_connected(&self) -> bool {
        self.get() == State::Connected
    }

    /// Claims the state for `epoch` and marks its request as being opened.
    pub fn connecting(&mut self, epoch: u64) {
        *self.owner = epoch;
        self.set(State::Connecting);
    }

    pub fn connected(&mut self) {
        self.set(State::Connected);
    }

    pub fn disconnected(&mut self) {
        self.set(State::Disconnected);
    }

    fn set(&mut self, state: State) {
        self.value.store(state.as_u8(), Ordering::Release);
    }
}
