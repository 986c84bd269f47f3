//! IPC Notifications - port death and no-senders
//!
//! A notification is a small kernel-generated message (header plus the
//! watched name) queued on the port named in the request. Notifications
//! bypass the queue limit: losing one would leave a peer's death unnoticed.

use std::sync::Arc;

use super::kmsg::IpcKmsg;
use super::port::KPort;
use crate::message::HEADER_SIZE;
use crate::types::PortName;

/// Size of a notification message
pub const NOTIFY_MSG_SIZE: usize = HEADER_SIZE + 4;

/// Types of port notifications, by message ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NotifyType {
    /// A name with a pending request was deleted
    PortDeleted = 0x0041,
    /// A receive right was destroyed in transit
    PortDestroyed = 0x0045,
    /// The last send right went away
    NoSenders = 0x0046,
    /// A send-once right was destroyed unused
    SendOnce = 0x0047,
    /// The port behind a send right died
    DeadName = 0x0048,
}

impl NotifyType {
    pub fn msg_id(self) -> i32 {
        self as i32
    }

    pub fn from_msg_id(id: i32) -> Option<Self> {
        match id {
            0x0041 => Some(NotifyType::PortDeleted),
            0x0045 => Some(NotifyType::PortDestroyed),
            0x0046 => Some(NotifyType::NoSenders),
            0x0047 => Some(NotifyType::SendOnce),
            0x0048 => Some(NotifyType::DeadName),
            _ => None,
        }
    }
}

/// A pending notification request
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub notify_type: NotifyType,
    /// Port the notification is queued on
    pub notify_port: Arc<KPort>,
    /// Name of the watched right in the requesting space
    pub watched_name: PortName,
}

impl NotifyRequest {
    pub fn new(notify_type: NotifyType, notify_port: Arc<KPort>, watched_name: PortName) -> Self {
        Self {
            notify_type,
            notify_port,
            watched_name,
        }
    }

    /// Queue the notification; a dead notify port swallows it
    pub fn post(self) {
        log::debug!(
            "notify {:?} for {} on port {:?}",
            self.notify_type,
            self.watched_name,
            self.notify_port.id()
        );
        let kmsg = IpcKmsg::notification(self.notify_type, self.watched_name);
        self.notify_port.enqueue_notification(kmsg);
    }
}
