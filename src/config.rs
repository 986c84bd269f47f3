//! Kernel and loop tuning
//!
//! One `IpcConfig` is fixed per `Kernel` at construction; every port, space
//! and run loop created under that kernel reads its limits from here.

use crate::error::{IpcError, IpcResult};

/// Default number of messages a port queues before sends fail
pub const DEFAULT_QUEUE_LIMIT: usize = 5;

/// Default maximum number of rights carried by one transfer message
pub const DEFAULT_MAX_TRANSFER_RIGHTS: usize = 64;

/// Default maximum message size in bytes (header and body, no trailer)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default number of messages a run loop delivers per port per iteration
pub const DEFAULT_LOOP_BATCH: usize = 16;

/// IPC limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcConfig {
    /// Messages queued on one port before `QueueFull`
    pub queue_limit: usize,
    /// Upper bound on rights in a single rights-transfer message
    pub max_transfer_rights: usize,
    /// Upper bound on the encoded size of a message
    pub max_message_size: usize,
    /// Messages delivered per port per run loop iteration
    pub loop_batch: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            queue_limit: DEFAULT_QUEUE_LIMIT,
            max_transfer_rights: DEFAULT_MAX_TRANSFER_RIGHTS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            loop_batch: DEFAULT_LOOP_BATCH,
        }
    }
}

impl IpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn with_max_transfer_rights(mut self, max: usize) -> Self {
        self.max_transfer_rights = max;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_loop_batch(mut self, batch: usize) -> Self {
        self.loop_batch = batch;
        self
    }

    /// Reject limits no message could satisfy
    pub fn validate(&self) -> IpcResult<()> {
        if self.queue_limit == 0 {
            return Err(IpcError::InvalidConfig("queue_limit must be non-zero"));
        }
        if self.loop_batch == 0 {
            return Err(IpcError::InvalidConfig("loop_batch must be non-zero"));
        }
        // A full rights message must still fit under the size cap.
        let rights_message = crate::message::HEADER_SIZE
            + crate::message::BODY_SIZE
            + self.max_transfer_rights * crate::message::PORT_DESCRIPTOR_SIZE;
        if rights_message > self.max_message_size {
            return Err(IpcError::InvalidConfig(
                "max_transfer_rights does not fit in max_message_size",
            ));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(IpcError::InvalidConfig("max_message_size exceeds u32"));
        }
        Ok(())
    }
}
