//! Message send and receive
//!
//! Send validates the encoded message, copies in every right it names as
//! one transaction and queues the result on the destination. If the queue
//! refuses the message the transaction is undone, so a failed send never
//! consumes the sender's rights.
//!
//! Receive copies the carried rights out into the receiver's space,
//! rewrites names and dispositions in place and appends the audit trailer.

use std::sync::Arc;

use super::kmsg::{IpcKmsg, KRegion, Slot};
use super::right::{MsgTypeName, RightKind};
use super::space::{Copyin, IpcSpace};
use crate::descriptor::{Descriptor, DescriptorReader, DISPOSITION_OFFSET};
use crate::error::{IpcError, IpcResult};
use crate::message::{
    append_audit_trailer, msgh_bits, write_u32, Message, MsgHeader, OolRegion, OutgoingMessage,
    MACH_MSGH_BITS_COMPLEX,
};
use crate::types::PortName;

/// Rights and out-of-line data a message asks the kernel to move
struct SendPlan {
    requests: Vec<(PortName, MsgTypeName)>,
    slots: Vec<Slot>,
    regions: Vec<KRegion>,
}

fn region_index(region: u64, len: usize) -> IpcResult<usize> {
    usize::try_from(region)
        .ok()
        .filter(|&index| index < len)
        .ok_or(IpcError::Malformed("out-of-line region out of range"))
}

fn claim_region(regions: &mut [Option<KRegion>], index: usize, region: KRegion) -> IpcResult<()> {
    if regions[index].is_some() {
        return Err(IpcError::Malformed("out-of-line region referenced twice"));
    }
    regions[index] = Some(region);
    Ok(())
}

fn plan(msg: &OutgoingMessage, header: &MsgHeader) -> IpcResult<SendPlan> {
    let ool = msg.regions();
    let mut plan = SendPlan {
        requests: Vec::new(),
        slots: Vec::new(),
        regions: Vec::new(),
    };
    if !header.is_complex() {
        if !ool.is_empty() {
            return Err(IpcError::Malformed("out-of-line data on a simple message"));
        }
        return Ok(plan);
    }

    let mut regions: Vec<Option<KRegion>> = ool.iter().map(|_| None).collect();
    let mut reader = DescriptorReader::from_bytes(msg.bytes())?;
    while let Some(item) = reader.next_with_offset() {
        let (offset, descriptor) = item?;
        match descriptor {
            Descriptor::Port { name, disposition } => {
                let disp = MsgTypeName::from_u8(disposition)
                    .ok_or(IpcError::Malformed("invalid port disposition"))?;
                plan.requests.push((name, disp));
                plan.slots.push(Slot::Inline { offset });
            }
            Descriptor::OutOfLine { region, size, .. } => {
                let index = region_index(region, ool.len())?;
                let data = match &ool[index] {
                    OolRegion::Memory(data) if data.len() == size as usize => data.clone(),
                    _ => return Err(IpcError::Malformed("out-of-line memory mismatch")),
                };
                claim_region(&mut regions, index, KRegion::Memory(data))?;
            }
            Descriptor::OutOfLinePorts {
                region,
                count,
                disposition,
                ..
            } => {
                let disp = MsgTypeName::from_u8(disposition)
                    .ok_or(IpcError::Malformed("invalid port disposition"))?;
                let index = region_index(region, ool.len())?;
                let names = match &ool[index] {
                    OolRegion::Ports(names) if names.len() == count as usize => names,
                    _ => return Err(IpcError::Malformed("out-of-line port array mismatch")),
                };
                for (i, &name) in names.iter().enumerate() {
                    plan.requests.push((name, disp));
                    plan.slots.push(Slot::Array { region: index, index: i });
                }
                claim_region(
                    &mut regions,
                    index,
                    KRegion::Ports {
                        descriptor: offset,
                        count: names.len(),
                    },
                )?;
            }
            Descriptor::Inline { .. } => {}
        }
    }
    plan.regions = regions
        .into_iter()
        .map(|region| region.ok_or(IpcError::Malformed("unreferenced out-of-line region")))
        .collect::<IpcResult<_>>()?;
    Ok(plan)
}

/// Send a message from `space`
pub fn msg_send(space: &IpcSpace, msg: &OutgoingMessage) -> IpcResult<()> {
    let config = space.config();
    let bytes = msg.bytes();
    if bytes.len() > config.max_message_size {
        return Err(IpcError::MessageTooLarge {
            size: bytes.len(),
            max: config.max_message_size,
        });
    }
    let header = MsgHeader::decode(bytes)?;
    if header.size as usize != bytes.len() {
        return Err(IpcError::Malformed("declared size does not match buffer"));
    }
    let dest_disp = MsgTypeName::from_u32(header.remote_disposition())
        .ok_or(IpcError::Malformed("invalid destination disposition"))?;
    let reply = if header.local_port.is_null() {
        None
    } else {
        let disp = MsgTypeName::from_u32(header.local_disposition())
            .ok_or(IpcError::Malformed("invalid reply disposition"))?;
        Some((header.local_port, disp))
    };

    let SendPlan {
        requests,
        slots,
        regions,
    } = plan(msg, &header)?;
    if requests.len() > config.max_transfer_rights {
        return Err(IpcError::TooManyRights {
            count: requests.len(),
            max: config.max_transfer_rights,
        });
    }

    let Copyin {
        dest,
        dest_right,
        reply: reply_right,
        rights,
    } = space.copyin_all((header.remote_port, dest_disp), reply, &requests)?;

    let mut kmsg = Box::new(IpcKmsg::new(bytes.to_vec(), *space.owner_token()));
    kmsg.dest = dest_right;
    kmsg.reply = reply_right;
    kmsg.slots = slots.into_iter().zip(rights).collect();
    kmsg.regions = regions;

    match dest.enqueue(kmsg) {
        Ok(()) => {
            log::debug!(
                "send id {:#x} ({} bytes, {} rights) to {} from space {:?}",
                header.id,
                header.size,
                requests.len(),
                header.remote_port,
                space.id()
            );
            Ok(())
        }
        Err((err, kmsg)) => {
            log::debug!("send to {} failed: {}; restoring rights", header.remote_port, err);
            let (dest_right, reply_right, rights) = (*kmsg).into_rights();
            let mut returned = vec![(header.remote_port, dest_disp, dest_right)];
            if let Some((name, disp)) = reply {
                returned.push((name, disp, reply_right));
            }
            returned.extend(
                requests
                    .into_iter()
                    .zip(rights)
                    .map(|((name, disp), right)| (name, disp, right)),
            );
            space.restore(returned);
            Err(err)
        }
    }
}

/// Receive the next message queued on the receive right `name`
pub fn msg_receive(space: &Arc<IpcSpace>, name: PortName) -> IpcResult<Option<Message>> {
    let port = space.port(name, RightKind::Receive)?;
    let Some(kmsg) = port.dequeue() else {
        return Ok(None);
    };
    let IpcKmsg {
        mut bytes,
        dest,
        reply,
        slots,
        regions,
        sender,
        seqno,
    } = *kmsg;
    // The destination right is consumed by delivery.
    drop(dest);

    let mut header = MsgHeader::decode(&bytes)?;
    let mut reply_owned = None;
    let (reply_name, reply_bits) = match reply {
        Some(right) => {
            let (name, kind) = space.copyout(right)?;
            if name.is_valid() {
                reply_owned = Some((name, kind));
            }
            (name, kind.move_disposition() as u32)
        }
        None => (PortName::NULL, 0),
    };
    header.remote_port = reply_name;
    header.local_port = name;
    header.bits = msgh_bits(reply_bits, 0) | (header.bits & MACH_MSGH_BITS_COMPLEX);
    header.encode_into(&mut bytes);

    let mut out_regions = Vec::with_capacity(regions.len());
    for region in regions {
        out_regions.push(match region {
            KRegion::Memory(data) => OolRegion::Memory(data),
            KRegion::Ports { descriptor, count } => {
                let at = descriptor + DISPOSITION_OFFSET;
                if let Some(disp) = MsgTypeName::from_u8(bytes[at]) {
                    bytes[at] = disp.result_kind().move_disposition() as u8;
                }
                OolRegion::Ports(vec![PortName::NULL; count])
            }
        });
    }

    let mut owned = Vec::new();
    for (slot, right) in slots {
        let Some(right) = right else {
            continue;
        };
        let (carried, kind) = space.copyout(right)?;
        if carried.is_valid() {
            owned.push((carried, kind));
        }
        match slot {
            Slot::Inline { offset } => {
                write_u32(&mut bytes, offset, carried.as_raw());
                bytes[offset + DISPOSITION_OFFSET] = kind.move_disposition() as u8;
            }
            Slot::Array { region, index } => {
                if let Some(OolRegion::Ports(names)) = out_regions.get_mut(region) {
                    names[index] = carried;
                }
            }
        }
    }

    append_audit_trailer(&mut bytes, seqno, &sender);
    log::debug!(
        "receive id {:#x} on {} (seqno {}, {} rights)",
        header.id,
        name,
        seqno,
        owned.len()
    );
    Message::received(Arc::clone(space), bytes, out_regions, owned, reply_owned).map(Some)
}

/// Messages waiting on the receive right `name`
pub fn msg_pending(space: &IpcSpace, name: PortName) -> IpcResult<usize> {
    Ok(space.port(name, RightKind::Receive)?.queue_len())
}
