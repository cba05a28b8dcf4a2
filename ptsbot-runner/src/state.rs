// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! State shared by steps and work-item handlers across a batch run.
//!
//! Steps running on the main thread and handlers running on listener threads both need to know
//! things like the IUT's address or a passkey the IUT displayed a moment ago. That state lives
//! here, behind a mutex, for the lifetime of one batch run.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// A Bluetooth device address, stored most-significant byte first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// Creates an address from bytes in display (most-significant first) order.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Creates an address from bytes in over-the-air (little-endian) order.
    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// Returns the address bytes, most-significant first.
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for BdAddr {
    /// Formats the address as 12 uppercase hex digits without separators, which is the format
    /// the remote tool expects in its parameters.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// The type of the IUT's address.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AddressType {
    /// A public device address.
    #[default]
    Public,

    /// A random (static or private) device address.
    Random,
}

/// The mutable state itself. Access it through [`SharedState::lock`].
#[derive(Clone, Debug, Default)]
pub struct TestState {
    /// The IUT's address, once read from the controller.
    pub iut_address: Option<BdAddr>,

    /// The type of the IUT's address.
    pub iut_address_type: AddressType,

    /// Settings the IUT's controller reported as supported.
    pub supported_settings: u32,

    /// Settings the IUT's controller reported as currently active.
    pub current_settings: u32,

    /// The most recent passkey displayed by the IUT, not yet consumed.
    pub passkey: Option<u32>,

    /// Free-form values stored by steps for later handlers.
    pub values: BTreeMap<String, String>,
}

impl TestState {
    /// Returns true if the IUT uses a random address.
    pub fn iut_address_is_random(&self) -> bool {
        self.iut_address_type == AddressType::Random
    }
}

/// Shared, cloneable handle to the [`TestState`] of a batch run.
#[derive(Clone, Debug, Default)]
pub struct SharedState {
    inner: Arc<Mutex<TestState>>,
}

impl SharedState {
    /// Creates new, empty shared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the state.
    ///
    /// A handler that panicked while holding the lock doesn't make the state unusable: the
    /// panic is reported at the dispatch boundary, and the state is still consistent field by
    /// field.
    pub fn lock(&self) -> MutexGuard<'_, TestState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the pending passkey, if any.
    pub fn take_passkey(&self) -> Option<u32> {
        self.lock().passkey.take()
    }

    /// Resets all state to its defaults.
    pub fn reset(&self) {
        *self.lock() = TestState::default();
    }
}
