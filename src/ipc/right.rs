//! IPC Rights - dispositions and rights in transit
//!
//! A disposition says how a right named in a message is taken from the
//! sender's space (moved, copied or made from a receive right). Once copied
//! in, the right travels as a [`CarriedRight`] until it is copied out into the
//! receiver's space or released.

use std::sync::Arc;

use super::port::KPort;

// ============================================================================
// Message type names (dispositions)
// ============================================================================

/// How a right appears in a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgTypeName {
    /// Move receive right
    MoveReceive = 16,
    /// Move send right
    MoveSend = 17,
    /// Move send-once right
    MoveSendOnce = 18,
    /// Copy send right
    CopySend = 19,
    /// Make send right (from receive)
    MakeSend = 20,
    /// Make send-once right (from receive)
    MakeSendOnce = 21,
}

impl MsgTypeName {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            16 => Some(MsgTypeName::MoveReceive),
            17 => Some(MsgTypeName::MoveSend),
            18 => Some(MsgTypeName::MoveSendOnce),
            19 => Some(MsgTypeName::CopySend),
            20 => Some(MsgTypeName::MakeSend),
            21 => Some(MsgTypeName::MakeSendOnce),
            _ => None,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::from_u32(value as u32)
    }

    /// Check if this type name moves the right (vs copies)
    pub fn is_move(&self) -> bool {
        matches!(
            self,
            MsgTypeName::MoveReceive | MsgTypeName::MoveSend | MsgTypeName::MoveSendOnce
        )
    }

    /// Check if this creates a new right from receive
    pub fn is_make(&self) -> bool {
        matches!(self, MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce)
    }

    /// Right the sender must hold for this disposition
    pub fn source_kind(&self) -> RightKind {
        match self {
            MsgTypeName::MoveReceive | MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce => {
                RightKind::Receive
            }
            MsgTypeName::MoveSend | MsgTypeName::CopySend => RightKind::Send,
            MsgTypeName::MoveSendOnce => RightKind::SendOnce,
        }
    }

    /// Right the receiver ends up with
    pub fn result_kind(&self) -> RightKind {
        match self {
            MsgTypeName::MoveReceive => RightKind::Receive,
            MsgTypeName::MoveSend | MsgTypeName::CopySend | MsgTypeName::MakeSend => {
                RightKind::Send
            }
            MsgTypeName::MoveSendOnce | MsgTypeName::MakeSendOnce => RightKind::SendOnce,
        }
    }
}

// ============================================================================
// Right kinds
// ============================================================================

/// The capability a name denotes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RightKind {
    Send,
    Receive,
    SendOnce,
}

impl RightKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RightKind::Send => "send",
            RightKind::Receive => "receive",
            RightKind::SendOnce => "send-once",
        }
    }

    /// Disposition that transfers this right away from its holder.
    ///
    /// Received descriptors carry the same value to describe the right
    /// they now name.
    pub fn move_disposition(&self) -> MsgTypeName {
        match self {
            RightKind::Send => MsgTypeName::MoveSend,
            RightKind::Receive => MsgTypeName::MoveReceive,
            RightKind::SendOnce => MsgTypeName::MoveSendOnce,
        }
    }

    /// Disposition for addressing a message to a port through this right
    pub fn destination_disposition(&self) -> MsgTypeName {
        match self {
            RightKind::Send => MsgTypeName::CopySend,
            RightKind::Receive => MsgTypeName::MakeSend,
            RightKind::SendOnce => MsgTypeName::MoveSendOnce,
        }
    }
}

// ============================================================================
// Rights in transit
// ============================================================================

/// A right held by the kernel rather than by any space.
///
/// Counted send and send-once rights keep the port's counters raised while
/// in flight; dropping one releases it (and may post a no-senders
/// notification). Dropping a carried receive right destroys the port.
pub struct CarriedRight {
    port: Option<Arc<KPort>>,
    kind: RightKind,
}

impl CarriedRight {
    /// Take ownership of a right whose count is already accounted for
    pub(crate) fn new(port: Arc<KPort>, kind: RightKind) -> Self {
        Self {
            port: Some(port),
            kind,
        }
    }

    pub fn kind(&self) -> RightKind {
        self.kind
    }

    pub fn port(&self) -> Option<&Arc<KPort>> {
        self.port.as_ref()
    }

    /// Hand the accounted right to a new holder without releasing it
    pub(crate) fn into_port(mut self) -> Option<Arc<KPort>> {
        self.port.take()
    }
}

impl core::fmt::Debug for CarriedRight {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CarriedRight")
            .field("port", &self.port.as_ref().map(|p| p.id()))
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for CarriedRight {
    fn drop(&mut self) {
        let Some(port) = self.port.take() else {
            return;
        };
        match self.kind {
            RightKind::Send => port.release_send(),
            RightKind::SendOnce => port.release_send_once(),
            RightKind::Receive => port.destroy(),
        }
    }
}
