//! portlink - Mach-style port IPC
//!
//! Two processes exchange typed messages over kernel ports, move send and
//! receive rights between each other, and post small integer commands,
//! all delivered through a cooperative run loop. Bootstrap namespace
//! subsets restrict what a spawned child can discover.
//!
//! The kernel side (ports, IPC spaces, the message path and the bootstrap
//! name server) is simulated in-process under [`kern`] and [`ipc`].

// Kernel IPC errors carry returned rights for recovery
#![allow(clippy::result_large_err)]

// Core types
pub mod config;
pub mod error;
pub mod types;

// Wire format
pub mod descriptor;
pub mod message;

// Host kernel
pub mod ipc;
pub mod kern;
pub mod servers;

// User-level API
pub mod command;
pub mod handle;
pub mod holder;
pub mod namespace;
pub mod port;
pub mod rights;
pub mod runloop;
pub mod signal;

pub use command::{receive_command, send_command, COMMAND_MSG_ID};
pub use config::IpcConfig;
pub use descriptor::{Descriptor, DescriptorKind, DescriptorReader};
pub use error::{ErrorClass, IpcError, IpcResult};
pub use handle::Handle;
pub use holder::PortHolder;
pub use ipc::{MsgTypeName, RightKind};
pub use kern::{Credentials, Kernel, Task};
pub use message::{AuditToken, Message, MessageBuilder};
pub use namespace::{create_subset, reset_current, NamespaceError, NamespaceGuard};
pub use port::Port;
pub use rights::{receive_rights, require_rights, send_rights, TransferError, RIGHTS_MSG_ID};
pub use runloop::{RunLoop, DEFAULT_MODE};
pub use signal::{SignalForwarder, SignalHandlerEntry, SignalTable};
pub use types::PortName;
