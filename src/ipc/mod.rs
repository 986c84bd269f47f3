//! Mach-style IPC kernel
//!
//! Ports, per-task spaces of port names, and the message path between them.
//! User code reaches this layer through [`crate::Port`] and the protocol
//! modules; the pieces are public for tests and tooling that need to look
//! underneath.

pub mod entry;
pub mod kmsg;
pub mod mach_msg;
pub mod notify;
pub mod port;
pub mod right;
pub mod space;

pub use entry::PortType;
pub use mach_msg::{msg_pending, msg_receive, msg_send};
pub use notify::NotifyType;
pub use port::{KPort, PortState};
pub use right::{MsgTypeName, RightKind};
pub use space::IpcSpace;
