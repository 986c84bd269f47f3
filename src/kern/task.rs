//! Task Management
//!
//! A task is a process as far as IPC is concerned: an IPC space, an
//! identity the kernel stamps on everything it sends, and a current
//! bootstrap namespace that children inherit at spawn time.

use std::sync::Arc;

use spin::Mutex;

use super::Kernel;
use crate::error::{IpcError, IpcResult};
use crate::handle::Handle;
use crate::ipc::port::KPort;
use crate::ipc::right::RightKind;
use crate::ipc::space::IpcSpace;
use crate::message::AuditToken;
use crate::types::{PortName, TaskId};

/// User and group a task runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };

    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// A task (process)
pub struct Task {
    id: TaskId,
    pid: u32,
    creds: Credentials,
    token: AuditToken,
    kernel: Arc<Kernel>,
    space: Arc<IpcSpace>,
    /// Current bootstrap namespace (a send right in `space`)
    bootstrap: Mutex<Handle>,
}

impl Task {
    pub(crate) fn new(
        kernel: Arc<Kernel>,
        creds: Credentials,
        bootstrap: Arc<KPort>,
    ) -> IpcResult<Arc<Self>> {
        let id = TaskId::new();
        let pid = kernel.next_pid();
        let token = AuditToken {
            auid: creds.uid,
            euid: creds.uid,
            egid: creds.gid,
            ruid: creds.uid,
            rgid: creds.gid,
            pid,
            asid: pid,
            pidversion: id.0 as u32,
        };
        let space = IpcSpace::new(*kernel.config(), token);
        let name = space.insert_send(bootstrap)?;
        let bootstrap = Handle::from_raw(Arc::clone(&space), name, RightKind::Send);
        log::debug!("task {:?}: pid {} uid {} created", id, pid, creds.uid);
        Ok(Arc::new(Self {
            id,
            pid,
            creds,
            token,
            kernel,
            space,
            bootstrap: Mutex::new(bootstrap),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn space(&self) -> &Arc<IpcSpace> {
        &self.space
    }

    /// Identity stamped on every message this task sends
    pub fn audit_token(&self) -> AuditToken {
        self.token
    }

    /// Name of the current bootstrap namespace in this task's space
    pub fn bootstrap_port(&self) -> PortName {
        self.bootstrap.lock().name()
    }

    /// Swap the current namespace, handing back the previous one
    pub(crate) fn replace_bootstrap(&self, namespace: Handle) -> Handle {
        core::mem::replace(&mut *self.bootstrap.lock(), namespace)
    }

    /// Fail if `handle` is not a right in this task's space
    pub(crate) fn check_owner(&self, handle: &Handle) -> IpcResult<()> {
        if handle.space_id() == self.space.id() {
            Ok(())
        } else {
            Err(IpcError::ForeignTask)
        }
    }

    /// Start a child task that inherits this task's credentials and
    /// current bootstrap namespace
    pub fn spawn(&self) -> IpcResult<Arc<Task>> {
        if self.is_terminated() {
            return Err(IpcError::TaskTerminated);
        }
        let namespace = self.space.port(self.bootstrap_port(), RightKind::Send)?;
        let child = Task::new(Arc::clone(&self.kernel), self.creds, namespace)?;
        log::debug!("task pid {}: spawned pid {}", self.pid, child.pid);
        Ok(child)
    }

    /// Process exit: every right in the space is released
    pub fn terminate(&self) {
        if self.space.is_active() {
            log::debug!("task pid {}: terminated", self.pid);
        }
        self.space.destroy();
    }

    pub fn is_terminated(&self) -> bool {
        !self.space.is_active()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.space.destroy();
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("creds", &self.creds)
            .field("space", &self.space.id())
            .finish()
    }
}
