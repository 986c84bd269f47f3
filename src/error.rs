//! Error types for port IPC operations

use thiserror::Error;

use crate::types::PortName;

/// Result type for IPC operations
pub type IpcResult<T> = core::result::Result<T, IpcError>;

/// Failure categories callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Naming service lookup or registration failed
    NameResolution,
    /// Send or receive against a port failed
    Transport,
    /// A message did not match the protocol expected on its port
    ProtocolMismatch,
    /// Fewer rights arrived than the caller requires
    CapabilityShortfall,
    /// Namespace subset creation or reset failed
    Namespace,
    /// Misuse of a local object (invalidated port, foreign handle, config)
    Local,
}

/// Errors that can occur during IPC operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    /// No binding for the name in the namespace chain
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The name is already bound in this namespace
    #[error("service already registered: {0}")]
    ServiceExists(String),

    /// Service names are bounded by the bootstrap name size
    #[error("service name too long: {len} bytes (max: {max})")]
    NameTooLong { len: usize, max: usize },

    /// The name does not denote any right in the space
    #[error("invalid port name {0}")]
    InvalidName(PortName),

    /// The name exists but lacks the right the operation needs
    #[error("port name {name} does not hold a {expected} right")]
    InvalidRight {
        name: PortName,
        expected: &'static str,
    },

    /// The port behind the right has been destroyed
    #[error("port is dead")]
    PortDead,

    /// The destination queue is at its limit
    #[error("message queue full")]
    QueueFull,

    /// Message exceeds the configured size cap
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Rights transfer exceeds the per-message maximum
    #[error("too many rights: {count} (max: {max})")]
    TooManyRights { count: usize, max: usize },

    /// Wire-level corruption: bad sizes, unknown descriptor kinds, overruns
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// Well-formed message, wrong protocol for this port
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(&'static str),

    /// Caller required more rights than were delivered
    #[error("capability shortfall: received {received}, required {required}")]
    CapabilityShortfall { received: usize, required: usize },

    /// The wrapper reached its terminal state
    #[error("port has been invalidated")]
    Invalidated,

    /// The port or handle belongs to another task's space
    #[error("object belongs to a different task")]
    ForeignTask,

    /// The task's space has been torn down
    #[error("task terminated")]
    TaskTerminated,

    /// The namespace's requestor died; it no longer resolves names
    #[error("namespace is inactive")]
    NamespaceInactive,

    /// The port is not a namespace known to the bootstrap server
    #[error("not a bootstrap namespace: {0}")]
    NotNamespace(PortName),

    /// Operation is not allowed on the port in its current state
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Signal table rejected an entry
    #[error("signal table error: {0}")]
    SignalTable(&'static str),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl IpcError {
    /// Map the error onto the caller-facing taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            IpcError::UnknownService(_)
            | IpcError::ServiceExists(_)
            | IpcError::NameTooLong { .. } => ErrorClass::NameResolution,
            IpcError::InvalidName(_)
            | IpcError::InvalidRight { .. }
            | IpcError::PortDead
            | IpcError::QueueFull
            | IpcError::MessageTooLarge { .. }
            | IpcError::TooManyRights { .. }
            | IpcError::Malformed(_) => ErrorClass::Transport,
            IpcError::ProtocolMismatch(_) => ErrorClass::ProtocolMismatch,
            IpcError::CapabilityShortfall { .. } => ErrorClass::CapabilityShortfall,
            IpcError::NamespaceInactive | IpcError::NotNamespace(_) => ErrorClass::Namespace,
            IpcError::Invalidated
            | IpcError::ForeignTask
            | IpcError::TaskTerminated
            | IpcError::InvalidOperation(_)
            | IpcError::SignalTable(_)
            | IpcError::InvalidConfig(_) => ErrorClass::Local,
        }
    }

    /// Peer death, the one transport failure worth a re-lookup and retry
    pub fn is_dead_peer(&self) -> bool {
        matches!(self, IpcError::PortDead)
    }
}
