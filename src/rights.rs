//! Capability transfer
//!
//! A rights message is a complex message with ID [`RIGHTS_MSG_ID`] carrying
//! one port descriptor per right. Rights move: after a successful send the
//! sender's names are gone and the receiver owns fresh names for the same
//! ports. The kernel copies every right in before anything is queued, so a
//! failed send leaves all of them with the sender.

use thiserror::Error;

use crate::descriptor::{Descriptor, DescriptorReader};
use crate::error::{IpcError, IpcResult};
use crate::handle::Handle;
use crate::message::{Message, MessageBuilder};
use crate::port::Port;
use crate::types::PortName;

/// Message ID of a rights transfer
pub const RIGHTS_MSG_ID: i32 = 0x504C_0001;

/// A failed transfer, handing back the rights that were not moved
#[derive(Error, Debug)]
#[error("rights transfer failed: {error}")]
pub struct TransferError {
    #[source]
    pub error: IpcError,
    pub rights: Vec<Handle>,
}

impl TransferError {
    pub fn into_rights(self) -> Vec<Handle> {
        self.rights
    }
}

/// Move `rights` to the port behind `port` in a single message
pub fn send_rights(port: &Port, rights: Vec<Handle>) -> Result<(), TransferError> {
    let max = port.space().config().max_transfer_rights;
    if rights.len() > max {
        return Err(TransferError {
            error: IpcError::TooManyRights {
                count: rights.len(),
                max,
            },
            rights,
        });
    }
    if rights.iter().any(|h| h.space_id() != port.space_id()) {
        return Err(TransferError {
            error: IpcError::ForeignTask,
            rights,
        });
    }

    let builder = rights.iter().fold(
        MessageBuilder::new(RIGHTS_MSG_ID).complex(),
        |builder, right| builder.port(right.name(), right.kind().move_disposition()),
    );
    match port.send(builder) {
        Ok(()) => {
            log::debug!("sent {} rights to {}", rights.len(), port.name());
            // the kernel consumed the names; nothing left to release
            for right in rights {
                right.into_raw();
            }
            Ok(())
        }
        Err(error) => Err(TransferError { error, rights }),
    }
}

/// Claim up to `out.len()` rights carried by a rights message, returning
/// how many were written. Non-right descriptors and dead names are skipped;
/// live rights beyond the first `out.len()` stay with the message and are
/// released with it.
pub fn receive_rights(msg: &mut Message, out: &mut [Option<Handle>]) -> IpcResult<usize> {
    if msg.id() != RIGHTS_MSG_ID {
        log::warn!("dropping id {:#x}: not a rights transfer", msg.id());
        return Err(IpcError::ProtocolMismatch("not a rights transfer"));
    }

    let mut names: Vec<PortName> = Vec::new();
    {
        let reader = DescriptorReader::new(msg)?;
        for descriptor in reader {
            match descriptor? {
                Descriptor::Port { name, .. } => names.push(name),
                Descriptor::OutOfLinePorts { region, .. } => {
                    let array = msg
                        .ool_ports(region)
                        .ok_or(IpcError::Malformed("port array region missing"))?;
                    names.extend(array.iter());
                }
                other => log::trace!("skipping {:?} descriptor", other.kind()),
            }
        }
    }

    // dead or null names carry nothing to claim and take no slot
    let mut count = 0;
    for name in names {
        if count == out.len() {
            break;
        }
        if let Some(handle) = msg.claim_right(name) {
            out[count] = Some(handle);
            count += 1;
        }
    }
    log::debug!("received {} rights (room for {})", count, out.len());
    Ok(count)
}

/// Turn a short count into [`IpcError::CapabilityShortfall`]
pub fn require_rights(received: usize, required: usize) -> IpcResult<()> {
    if received < required {
        Err(IpcError::CapabilityShortfall { received, required })
    } else {
        Ok(())
    }
}
