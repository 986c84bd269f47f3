//! Kern subsystem - the in-process host kernel
//!
//! A [`Kernel`] owns the IPC limits, the pid allocator and the bootstrap
//! name server. Tasks created from it are the "processes" that exchange
//! messages; each gets its own IPC space.

pub mod task;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::IpcConfig;
use crate::error::IpcResult;
use crate::servers::bootstrap::BootstrapServer;

pub use task::{Credentials, Task};

/// First pid handed out
const FIRST_PID: u32 = 100;

/// Host kernel
pub struct Kernel {
    config: IpcConfig,
    bootstrap: BootstrapServer,
    next_pid: AtomicU32,
}

impl Kernel {
    /// Boot a kernel with validated limits
    pub fn new(config: IpcConfig) -> IpcResult<Arc<Self>> {
        config.validate()?;
        log::info!(
            "kernel: queue_limit={} max_transfer_rights={} max_message_size={}",
            config.queue_limit,
            config.max_transfer_rights,
            config.max_message_size
        );
        Ok(Arc::new(Self {
            bootstrap: BootstrapServer::new(&config),
            config,
            next_pid: AtomicU32::new(FIRST_PID),
        }))
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn bootstrap(&self) -> &BootstrapServer {
        &self.bootstrap
    }

    /// Create a task attached to the root namespace
    pub fn create_task(self: &Arc<Self>, creds: Credentials) -> IpcResult<Arc<Task>> {
        Task::new(Arc::clone(self), creds, self.bootstrap.root_port())
    }

    pub(crate) fn next_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}
