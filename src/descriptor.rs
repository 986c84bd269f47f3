//! Descriptor walker
//!
//! Descriptors in a complex body are not fixed-stride: each one's size is
//! only known after decoding its kind (and, for inline data, its length).
//! The reader advances a cursor descriptor by descriptor and checks every
//! step against the message's own declared size, so a hostile count or
//! length fails with `Malformed` instead of reading past the buffer.

use crate::error::{IpcError, IpcResult};
use crate::message::{
    read_u32, read_u64, Message, MsgHeader, BODY_SIZE, DESCRIPTOR_HEAD_SIZE,
    DESCRIPTOR_KIND_OFFSET, HEADER_SIZE, OOL_DESCRIPTOR_SIZE, OOL_PORTS_DESCRIPTOR_SIZE,
    PORT_DESCRIPTOR_SIZE,
};
use crate::types::PortName;

/// Offset of the disposition byte in port and port-array descriptors
pub const DISPOSITION_OFFSET: usize = 10;

/// Descriptor kinds (byte 11 of every descriptor head)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorKind {
    Port = 0,
    OutOfLine = 1,
    OutOfLinePorts = 2,
    OutOfLineVolatile = 3,
    Inline = 4,
}

impl DescriptorKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DescriptorKind::Port),
            1 => Some(DescriptorKind::OutOfLine),
            2 => Some(DescriptorKind::OutOfLinePorts),
            3 => Some(DescriptorKind::OutOfLineVolatile),
            4 => Some(DescriptorKind::Inline),
            _ => None,
        }
    }
}

/// One decoded descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor<'a> {
    /// A single port right
    Port { name: PortName, disposition: u8 },
    /// Out-of-line memory
    OutOfLine {
        region: u64,
        size: u32,
        deallocate: bool,
        volatile: bool,
    },
    /// Out-of-line array of port rights, all with one disposition
    OutOfLinePorts {
        region: u64,
        count: u32,
        disposition: u8,
        deallocate: bool,
    },
    /// Inline bytes
    Inline { data: &'a [u8] },
}

fn padded(len: usize) -> Option<usize> {
    len.checked_add(3).map(|l| l & !3)
}

impl<'a> Descriptor<'a> {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Descriptor::Port { .. } => DescriptorKind::Port,
            Descriptor::OutOfLine { volatile: false, .. } => DescriptorKind::OutOfLine,
            Descriptor::OutOfLine { volatile: true, .. } => DescriptorKind::OutOfLineVolatile,
            Descriptor::OutOfLinePorts { .. } => DescriptorKind::OutOfLinePorts,
            Descriptor::Inline { .. } => DescriptorKind::Inline,
        }
    }

    /// Bytes this descriptor occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            Descriptor::Port { .. } => PORT_DESCRIPTOR_SIZE,
            Descriptor::OutOfLine { .. } => OOL_DESCRIPTOR_SIZE,
            Descriptor::OutOfLinePorts { .. } => OOL_PORTS_DESCRIPTOR_SIZE,
            Descriptor::Inline { data } => DESCRIPTOR_HEAD_SIZE + (data.len() + 3) / 4 * 4,
        }
    }

    /// Number of port rights the descriptor carries
    pub fn right_count(&self) -> usize {
        match self {
            Descriptor::Port { .. } => 1,
            Descriptor::OutOfLinePorts { count, .. } => *count as usize,
            _ => 0,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let kind = self.kind() as u8;
        match *self {
            Descriptor::Port { name, disposition } => {
                out.extend_from_slice(&name.as_raw().to_le_bytes());
                out.extend_from_slice(&[0u8; 6]);
                out.push(disposition);
                out.push(kind);
            }
            Descriptor::OutOfLine {
                region,
                size,
                deallocate,
                ..
            } => {
                out.extend_from_slice(&region.to_le_bytes());
                out.extend_from_slice(&[deallocate as u8, 0, 0, kind]);
                out.extend_from_slice(&size.to_le_bytes());
            }
            Descriptor::OutOfLinePorts {
                region,
                count,
                disposition,
                deallocate,
            } => {
                out.extend_from_slice(&region.to_le_bytes());
                out.extend_from_slice(&[deallocate as u8, 0, disposition, kind]);
                out.extend_from_slice(&count.to_le_bytes());
            }
            Descriptor::Inline { data } => {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(&[0u8; 6]);
                out.push(0);
                out.push(kind);
                out.extend_from_slice(data);
                let pad = (4 - data.len() % 4) % 4;
                out.extend_from_slice(&[0u8; 3][..pad]);
            }
        }
    }
}

/// Decode the descriptor at `offset` and return it with the offset of the
/// next one. `end` is the message's declared size.
pub fn next_descriptor(buf: &[u8], offset: usize, end: usize) -> IpcResult<(Descriptor<'_>, usize)> {
    let end = end.min(buf.len());
    let head_end = offset
        .checked_add(DESCRIPTOR_HEAD_SIZE)
        .ok_or(IpcError::Malformed("descriptor offset overflow"))?;
    if head_end > end {
        return Err(IpcError::Malformed("descriptor overruns message"));
    }

    let kind = DescriptorKind::from_u8(buf[offset + DESCRIPTOR_KIND_OFFSET])
        .ok_or(IpcError::Malformed("unknown descriptor kind"))?;

    let (descriptor, len) = match kind {
        DescriptorKind::Port => (
            Descriptor::Port {
                name: PortName(read_u32(buf, offset)?),
                disposition: buf[offset + DISPOSITION_OFFSET],
            },
            PORT_DESCRIPTOR_SIZE,
        ),
        DescriptorKind::OutOfLine | DescriptorKind::OutOfLineVolatile => {
            if offset + OOL_DESCRIPTOR_SIZE > end {
                return Err(IpcError::Malformed("descriptor overruns message"));
            }
            (
                Descriptor::OutOfLine {
                    region: read_u64(buf, offset)?,
                    size: read_u32(buf, offset + 12)?,
                    deallocate: buf[offset + 8] != 0,
                    volatile: kind == DescriptorKind::OutOfLineVolatile,
                },
                OOL_DESCRIPTOR_SIZE,
            )
        }
        DescriptorKind::OutOfLinePorts => {
            if offset + OOL_PORTS_DESCRIPTOR_SIZE > end {
                return Err(IpcError::Malformed("descriptor overruns message"));
            }
            (
                Descriptor::OutOfLinePorts {
                    region: read_u64(buf, offset)?,
                    count: read_u32(buf, offset + 12)?,
                    disposition: buf[offset + DISPOSITION_OFFSET],
                    deallocate: buf[offset + 8] != 0,
                },
                OOL_PORTS_DESCRIPTOR_SIZE,
            )
        }
        DescriptorKind::Inline => {
            let data_len = read_u32(buf, offset)? as usize;
            let total = padded(data_len)
                .and_then(|p| p.checked_add(DESCRIPTOR_HEAD_SIZE))
                .ok_or(IpcError::Malformed("inline length overflow"))?;
            if offset + total > end {
                return Err(IpcError::Malformed("inline data overruns message"));
            }
            let data = &buf[head_end..head_end + data_len];
            (Descriptor::Inline { data }, total)
        }
    };

    log::trace!("descriptor {:?} at {} ({} bytes)", kind, offset, len);
    Ok((descriptor, offset + len))
}

/// Cursor over the descriptors of one complex message
#[derive(Debug, Clone)]
pub struct DescriptorReader<'a> {
    buf: &'a [u8],
    offset: usize,
    end: usize,
    count: u32,
    remaining: u32,
    failed: bool,
}

impl<'a> DescriptorReader<'a> {
    pub fn new(msg: &'a Message) -> IpcResult<Self> {
        Self::from_bytes(msg.as_bytes())
    }

    /// Walk raw message bytes; the header must mark the message complex
    pub fn from_bytes(bytes: &'a [u8]) -> IpcResult<Self> {
        let header = MsgHeader::decode(bytes)?;
        if !header.is_complex() {
            return Err(IpcError::ProtocolMismatch(
                "descriptor walk on a simple message",
            ));
        }
        let end = header.size as usize;
        let count = read_u32(bytes, HEADER_SIZE)?;
        let room = end - HEADER_SIZE - BODY_SIZE;
        let fits = (count as usize)
            .checked_mul(DESCRIPTOR_HEAD_SIZE)
            .map_or(false, |need| need <= room);
        if !fits {
            return Err(IpcError::Malformed("descriptor count exceeds message size"));
        }
        Ok(Self {
            buf: bytes,
            offset: HEADER_SIZE + BODY_SIZE,
            end,
            count,
            remaining: count,
            failed: false,
        })
    }

    /// Descriptor count declared by the message
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Cursor position; once exhausted, the start of the payload
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Like `next`, also reporting where the descriptor starts
    pub fn next_with_offset(&mut self) -> Option<IpcResult<(usize, Descriptor<'a>)>> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        let start = self.offset;
        match next_descriptor(self.buf, start, self.end) {
            Ok((descriptor, next)) => {
                self.offset = next;
                self.remaining -= 1;
                Some(Ok((start, descriptor)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> Iterator for DescriptorReader<'a> {
    type Item = IpcResult<Descriptor<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with_offset().map(|r| r.map(|(_, d)| d))
    }
}

impl core::iter::FusedIterator for DescriptorReader<'_> {}
