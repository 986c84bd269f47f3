//! IPC Entry - what one port name denotes in one space

use std::sync::Arc;

use bitflags::bitflags;

use super::port::KPort;
use super::right::RightKind;

bitflags! {
    /// Rights recorded under a name
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortType: u32 {
        const SEND = 0x0001_0000;
        const RECEIVE = 0x0002_0000;
        const SEND_ONCE = 0x0004_0000;
        const DEAD_NAME = 0x0010_0000;
        const SEND_RECEIVE = Self::SEND.bits() | Self::RECEIVE.bits();
    }
}

impl PortType {
    pub fn holds(&self, kind: RightKind) -> bool {
        match kind {
            RightKind::Send => self.contains(PortType::SEND),
            RightKind::Receive => self.contains(PortType::RECEIVE),
            RightKind::SendOnce => self.contains(PortType::SEND_ONCE),
        }
    }
}

/// One capability slot in a space.
///
/// Each send user reference stands for one send right counted on the port.
#[derive(Debug, Clone)]
pub struct IpcEntry {
    pub port: Arc<KPort>,
    pub send_urefs: u32,
    pub receive: bool,
    pub send_once: u32,
}

impl IpcEntry {
    pub fn new(port: Arc<KPort>) -> Self {
        Self {
            port,
            send_urefs: 0,
            receive: false,
            send_once: 0,
        }
    }

    /// Current type; send rights to a dead port read as a dead name
    pub fn port_type(&self) -> PortType {
        let mut ty = PortType::empty();
        if self.receive {
            ty |= PortType::RECEIVE;
        }
        let dead = !self.receive && self.port.is_dead();
        if self.send_urefs > 0 || self.send_once > 0 {
            if dead {
                ty |= PortType::DEAD_NAME;
            } else {
                if self.send_urefs > 0 {
                    ty |= PortType::SEND;
                }
                if self.send_once > 0 {
                    ty |= PortType::SEND_ONCE;
                }
            }
        }
        ty
    }

    /// Count of the given right held under this name
    pub fn count(&self, kind: RightKind) -> u32 {
        match kind {
            RightKind::Send => self.send_urefs,
            RightKind::Receive => self.receive as u32,
            RightKind::SendOnce => self.send_once,
        }
    }

    pub fn add(&mut self, kind: RightKind) {
        match kind {
            RightKind::Send => self.send_urefs += 1,
            RightKind::Receive => self.receive = true,
            RightKind::SendOnce => self.send_once += 1,
        }
    }

    /// Remove one right; false if the name does not hold it
    pub fn take(&mut self, kind: RightKind) -> bool {
        match kind {
            RightKind::Send if self.send_urefs > 0 => self.send_urefs -= 1,
            RightKind::Receive if self.receive => self.receive = false,
            RightKind::SendOnce if self.send_once > 0 => self.send_once -= 1,
            _ => return false,
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.send_urefs == 0 && !self.receive && self.send_once == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_follows_rights_and_port_death() {
        let port = KPort::new(None, 1);
        let mut entry = IpcEntry::new(Arc::clone(&port));
        assert!(entry.port_type().is_empty());

        entry.add(RightKind::Send);
        entry.add(RightKind::Send);
        assert_eq!(entry.port_type(), PortType::SEND);
        assert!(entry.take(RightKind::Send));
        assert_eq!(entry.count(RightKind::Send), 1);
        assert!(!entry.take(RightKind::Receive));

        port.destroy();
        assert_eq!(entry.port_type(), PortType::DEAD_NAME);
        assert!(!entry.port_type().holds(RightKind::Send));
    }

    #[test]
    fn send_receive() {
        let mut entry = IpcEntry::new(KPort::new(None, 1));
        entry.add(RightKind::Receive);
        entry.add(RightKind::Send);
        assert_eq!(entry.port_type(), PortType::SEND_RECEIVE);
        assert!(entry.take(RightKind::Receive));
        assert!(entry.take(RightKind::Send));
        assert!(entry.is_empty());
    }
}
