//! Replaceable port slot
//!
//! Callbacks that need "the current connection" capture a [`PortHolder`]
//! instead of a [`Port`], so a reconnect can swap the port underneath them.

use spin::Mutex;

use crate::port::Port;

/// Holds at most one port; replacement is atomic with respect to readers
#[derive(Default)]
pub struct PortHolder {
    slot: Mutex<Option<Port>>,
}

impl PortHolder {
    pub fn new(port: Option<Port>) -> Self {
        Self {
            slot: Mutex::new(port),
        }
    }

    /// The current port, if any
    pub fn get(&self) -> Option<Port> {
        self.slot.lock().clone()
    }

    /// Install `port` and hand back the previous one. Dropping the returned
    /// value releases it like any other port.
    pub fn set(&self, port: Option<Port>) -> Option<Port> {
        core::mem::replace(&mut *self.slot.lock(), port)
    }

    /// Empty the slot
    pub fn take(&self) -> Option<Port> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl core::fmt::Debug for PortHolder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PortHolder").field(&*self.slot.lock()).finish()
    }
}
