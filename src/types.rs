//! Common identifier types used across portlink
//!
//! Kernel objects are identified by process-unique ids; these never leak
//! into the wire format, which only carries per-space port names.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Task (process) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Create a new task ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Kernel port object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortId(pub u64);

impl PortId {
    /// Generate a new unique port ID with an auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        PortId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// IPC space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

impl SpaceId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SpaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A port name: the task-local handle to a capability.
///
/// The same kernel port has unrelated names in different spaces.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortName(pub u32);

impl PortName {
    /// The null port
    pub const NULL: PortName = PortName(0);
    /// The dead port (a right whose port was destroyed, seen on the wire)
    pub const DEAD: PortName = PortName(!0);

    pub const fn new(raw: u32) -> Self {
        PortName(raw)
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_dead(&self) -> bool {
        self.0 == !0
    }

    /// Neither null nor dead
    pub const fn is_valid(&self) -> bool {
        !self.is_null() && !self.is_dead()
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortName({:#x})", self.0)
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for PortName {
    fn from(value: u32) -> Self {
        PortName(value)
    }
}

impl From<PortName> for u32 {
    fn from(name: PortName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
        assert_ne!(PortId::new(), PortId::new());
        assert_ne!(SpaceId::new(), SpaceId::new());
    }

    #[test]
    fn port_name_sentinels() {
        assert!(PortName::NULL.is_null());
        assert!(PortName::DEAD.is_dead());
        assert!(!PortName::NULL.is_valid());
        assert!(PortName::new(0x103).is_valid());
        assert_eq!(format!("{}", PortName::new(0x103)), "0x103");
    }
}
