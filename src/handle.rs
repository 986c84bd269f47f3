//! Owned port rights
//!
//! A [`Handle`] is one user reference on one name in one space. It cannot be
//! copied; moving it moves the right, and dropping it releases the right
//! exactly once.

use std::sync::Arc;

use crate::error::IpcResult;
use crate::ipc::entry::PortType;
use crate::ipc::right::RightKind;
use crate::ipc::space::IpcSpace;
use crate::types::{PortName, SpaceId};

/// A move-only right held in a task's space
pub struct Handle {
    space: Arc<IpcSpace>,
    name: PortName,
    kind: RightKind,
    armed: bool,
}

impl Handle {
    /// Adopt a right the caller already holds a reference for
    pub(crate) fn from_raw(space: Arc<IpcSpace>, name: PortName, kind: RightKind) -> Self {
        Self {
            space,
            name,
            kind,
            armed: true,
        }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    pub fn kind(&self) -> RightKind {
        self.kind
    }

    pub fn space_id(&self) -> SpaceId {
        self.space.id()
    }

    pub(crate) fn space(&self) -> &Arc<IpcSpace> {
        &self.space
    }

    /// What the name denotes right now (dead names included)
    pub fn port_type(&self) -> IpcResult<PortType> {
        self.space.port_type(self.name)
    }

    /// Give up ownership without releasing; the name stays as it is in the
    /// space and the caller becomes responsible for it
    pub fn into_raw(mut self) -> PortName {
        self.armed = false;
        self.name
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("space", &self.space.id())
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.space.release(self.name, self.kind) {
            log::debug!("release of {} {} failed: {}", self.kind.as_str(), self.name, err);
        }
    }
}
