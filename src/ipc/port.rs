//! Kernel port - a bounded message queue plus right accounting
//!
//! Every port is reached through names in IPC spaces; the port itself only
//! counts the send and send-once rights outstanding and knows which space
//! (if any) holds its receive right.
//!
//! Locking: a port lock is never held while another port's lock is taken.
//! Notifications and dropped messages are handled after the lock is released.

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex;

use super::kmsg::IpcKmsg;
use super::notify::NotifyRequest;
use crate::error::IpcError;
use crate::types::{PortId, SpaceId};

/// Port state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Receive right held by a space (or by the kernel)
    Active,
    /// Receive right travelling inside a message
    InTransit,
    /// Receive right destroyed; the port is gone for good
    Dead,
}

struct PortInner {
    state: PortState,
    receiver: Option<SpaceId>,
    queue: VecDeque<Box<IpcKmsg>>,
    queue_limit: usize,
    send_rights: u32,
    send_once_rights: u32,
    seqno: u32,
    no_senders: Option<NotifyRequest>,
    dead_name: Vec<NotifyRequest>,
}

/// A kernel message port
pub struct KPort {
    id: PortId,
    inner: Mutex<PortInner>,
}

impl KPort {
    /// Create an active port; `receiver` is `None` for kernel-held ports
    pub fn new(receiver: Option<SpaceId>, queue_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            id: PortId::new(),
            inner: Mutex::new(PortInner {
                state: PortState::Active,
                receiver,
                queue: VecDeque::new(),
                queue_limit,
                send_rights: 0,
                send_once_rights: 0,
                seqno: 0,
                no_senders: None,
                dead_name: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn state(&self) -> PortState {
        self.inner.lock().state
    }

    pub fn is_dead(&self) -> bool {
        self.state() == PortState::Dead
    }

    pub fn is_active(&self) -> bool {
        self.state() == PortState::Active
    }

    /// Space holding the receive right
    pub fn receiver(&self) -> Option<SpaceId> {
        self.inner.lock().receiver
    }

    /// The receive right leaves its space inside a message
    pub(crate) fn begin_transit(&self) -> Result<(), IpcError> {
        let mut inner = self.inner.lock();
        match inner.state {
            PortState::Active => {
                inner.state = PortState::InTransit;
                inner.receiver = None;
                Ok(())
            }
            PortState::InTransit => Err(IpcError::InvalidOperation("receive right in transit")),
            PortState::Dead => Err(IpcError::PortDead),
        }
    }

    /// The receive right lands in `receiver`
    pub(crate) fn end_transit(&self, receiver: SpaceId) {
        let mut inner = self.inner.lock();
        if inner.state == PortState::InTransit {
            inner.state = PortState::Active;
            inner.receiver = Some(receiver);
        }
    }

    // ------------------------------------------------------------------------
    // Right accounting
    // ------------------------------------------------------------------------

    pub fn add_send(&self) {
        self.inner.lock().send_rights += 1;
    }

    /// Drop one send right; the last one out triggers no-senders
    pub fn release_send(&self) {
        let request = {
            let mut inner = self.inner.lock();
            inner.send_rights = inner.send_rights.saturating_sub(1);
            if inner.send_rights == 0 && inner.state != PortState::Dead {
                inner.no_senders.take()
            } else {
                None
            }
        };
        if let Some(request) = request {
            request.post();
        }
    }

    pub fn add_send_once(&self) {
        self.inner.lock().send_once_rights += 1;
    }

    pub fn release_send_once(&self) {
        let mut inner = self.inner.lock();
        inner.send_once_rights = inner.send_once_rights.saturating_sub(1);
    }

    pub fn send_rights(&self) -> u32 {
        self.inner.lock().send_rights
    }

    pub fn send_once_rights(&self) -> u32 {
        self.inner.lock().send_once_rights
    }

    // ------------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------------

    /// Queue a message, handing it back if the port cannot take it
    pub fn enqueue(&self, kmsg: Box<IpcKmsg>) -> Result<(), (IpcError, Box<IpcKmsg>)> {
        let mut inner = self.inner.lock();
        if inner.state == PortState::Dead {
            return Err((IpcError::PortDead, kmsg));
        }
        if inner.queue.len() >= inner.queue_limit {
            return Err((IpcError::QueueFull, kmsg));
        }
        inner.queue.push_back(kmsg);
        Ok(())
    }

    /// Queue a kernel notification regardless of the limit
    pub fn enqueue_notification(&self, kmsg: Box<IpcKmsg>) {
        let mut inner = self.inner.lock();
        if inner.state == PortState::Dead {
            drop(inner);
            drop(kmsg);
            return;
        }
        inner.queue.push_back(kmsg);
    }

    /// Pop the oldest message, stamping its sequence number
    pub fn dequeue(&self) -> Option<Box<IpcKmsg>> {
        let mut inner = self.inner.lock();
        let mut kmsg = inner.queue.pop_front()?;
        kmsg.seqno = inner.seqno;
        inner.seqno = inner.seqno.wrapping_add(1);
        Some(kmsg)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    // ------------------------------------------------------------------------
    // Notification requests
    // ------------------------------------------------------------------------

    /// Arm a no-senders notification, returning any request it replaces
    pub fn request_no_senders(&self, request: NotifyRequest) -> Option<NotifyRequest> {
        self.inner.lock().no_senders.replace(request)
    }

    /// Arm a dead-name notification; hands the request back if the port is
    /// already dead so the caller can post it immediately
    pub fn request_dead_name(&self, request: NotifyRequest) -> Result<(), NotifyRequest> {
        let mut inner = self.inner.lock();
        if inner.state == PortState::Dead {
            return Err(request);
        }
        inner.dead_name.push(request);
        Ok(())
    }

    /// Destroy the port: drop queued messages and notify dead-name watchers
    pub fn destroy(&self) {
        let (queue, requests) = {
            let mut inner = self.inner.lock();
            if inner.state == PortState::Dead {
                return;
            }
            inner.state = PortState::Dead;
            inner.receiver = None;
            inner.no_senders = None;
            (
                core::mem::take(&mut inner.queue),
                core::mem::take(&mut inner.dead_name),
            )
        };
        log::debug!(
            "port {:?} destroyed ({} queued messages dropped)",
            self.id,
            queue.len()
        );
        drop(queue);
        for request in requests {
            request.post();
        }
    }
}

impl core::fmt::Debug for KPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("KPort")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .field("send_rights", &inner.send_rights)
            .finish()
    }
}
