//! IPC Kernel Message - a message in flight
//!
//! Between copyin on send and copyout on receive a message lives on a port
//! queue as an `IpcKmsg`: the sender's bytes, the rights it carries (moved
//! out of the sender's space) and the sender's audit token. Dropping a kmsg
//! releases whatever rights it still carries.

use super::notify::{NotifyType, NOTIFY_MSG_SIZE};
use super::right::CarriedRight;
use crate::message::{AuditToken, MsgHeader, HEADER_SIZE};
use crate::types::PortName;

/// Where a carried right is written back on copyout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Port descriptor at this byte offset
    Inline { offset: usize },
    /// Element of an out-of-line port array
    Array { region: usize, index: usize },
}

/// Out-of-line data held by the kernel
#[derive(Debug)]
pub enum KRegion {
    Memory(Vec<u8>),
    /// Port array; its rights live in the slot list
    Ports { descriptor: usize, count: usize },
}

/// Kernel message
#[derive(Debug)]
pub struct IpcKmsg {
    /// Header and body as sent, names not yet translated
    pub(crate) bytes: Vec<u8>,
    /// Destination right, when the sender moved it in
    pub(crate) dest: Option<CarriedRight>,
    /// Reply right for the receiver
    pub(crate) reply: Option<CarriedRight>,
    /// Descriptor rights in descriptor order (`None` for null names)
    pub(crate) slots: Vec<(Slot, Option<CarriedRight>)>,
    pub(crate) regions: Vec<KRegion>,
    pub(crate) sender: AuditToken,
    pub(crate) seqno: u32,
}

impl IpcKmsg {
    pub fn new(bytes: Vec<u8>, sender: AuditToken) -> Self {
        Self {
            bytes,
            dest: None,
            reply: None,
            slots: Vec::new(),
            regions: Vec::new(),
            sender,
            seqno: 0,
        }
    }

    /// Kernel-originated notification carrying the watched name
    pub fn notification(notify_type: NotifyType, name: PortName) -> Box<Self> {
        let mut header = MsgHeader::new(notify_type.msg_id());
        header.size = NOTIFY_MSG_SIZE as u32;
        let mut bytes = vec![0u8; HEADER_SIZE];
        header.encode_into(&mut bytes);
        bytes.extend_from_slice(&name.as_raw().to_le_bytes());
        Box::new(Self::new(bytes, AuditToken::default()))
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Number of descriptor rights carried, null slots included
    pub fn right_count(&self) -> usize {
        self.slots.len()
    }

    /// Take back every carried right, in copyin order: destination, reply,
    /// then descriptor rights.
    pub(crate) fn into_rights(
        mut self,
    ) -> (
        Option<CarriedRight>,
        Option<CarriedRight>,
        Vec<Option<CarriedRight>>,
    ) {
        let slots = core::mem::take(&mut self.slots);
        (
            self.dest.take(),
            self.reply.take(),
            slots.into_iter().map(|(_, right)| right).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::KPort;
    use crate::ipc::right::RightKind;
    use crate::message::read_u32;
    use std::sync::Arc;

    #[test]
    fn notification_layout() {
        let kmsg = IpcKmsg::notification(NotifyType::NoSenders, PortName(0x203));
        let header = MsgHeader::decode(&kmsg.bytes).unwrap();
        assert_eq!(header.id, 0x46);
        assert_eq!(header.size as usize, NOTIFY_MSG_SIZE);
        assert_eq!(read_u32(&kmsg.bytes, HEADER_SIZE).unwrap(), 0x203);
    }

    #[test]
    fn dropping_releases_carried_rights() {
        let port = KPort::new(None, 4);
        port.add_send();
        port.add_send();
        let mut kmsg = IpcKmsg::new(vec![0; HEADER_SIZE], AuditToken::default());
        kmsg.slots.push((
            Slot::Inline { offset: 28 },
            Some(CarriedRight::new(Arc::clone(&port), RightKind::Send)),
        ));
        kmsg.slots.push((Slot::Inline { offset: 40 }, None));
        kmsg.dest = Some(CarriedRight::new(Arc::clone(&port), RightKind::Send));
        assert_eq!(kmsg.right_count(), 2);
        drop(kmsg);
        assert_eq!(port.send_rights(), 0);
    }
}
