//! Message wire format
//!
//! A message is a fixed 24-byte header, optionally followed (when the
//! complex bit is set) by a descriptor count and a sequence of
//! self-describing descriptors, then inline payload. Messages handed to a
//! receiver additionally carry a kernel-written audit trailer after
//! `msgh_size` bytes.
//!
//! All integers are little-endian. Out-of-line memory and port arrays do not
//! travel inside the byte stream; descriptors address them by index into the
//! message's region list.

use std::sync::Arc;

use crate::descriptor::{self, Descriptor};
use crate::error::{IpcError, IpcResult};
use crate::handle::Handle;
use crate::ipc::right::{MsgTypeName, RightKind};
use crate::ipc::space::IpcSpace;
use crate::types::PortName;

// ============================================================================
// Layout constants
// ============================================================================

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 24;

/// Size of the descriptor count that opens a complex body
pub const BODY_SIZE: usize = 4;

/// Size of a single port descriptor
pub const PORT_DESCRIPTOR_SIZE: usize = 12;

/// Size of an out-of-line memory descriptor
pub const OOL_DESCRIPTOR_SIZE: usize = 16;

/// Size of an out-of-line port array descriptor
pub const OOL_PORTS_DESCRIPTOR_SIZE: usize = 16;

/// Every descriptor starts with a head of this size
pub const DESCRIPTOR_HEAD_SIZE: usize = 12;

/// Offset of the kind byte within every descriptor head
pub const DESCRIPTOR_KIND_OFFSET: usize = 11;

/// Format-0 trailer type (the only one the kernel writes)
pub const TRAILER_FORMAT_0: u32 = 0;

/// Size of the audit trailer appended to received messages
pub const AUDIT_TRAILER_SIZE: usize = 52;

/// Header bit: body holds descriptors
pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;

/// Mask for remote port disposition
pub const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_00ff;

/// Mask for local port disposition
pub const MACH_MSGH_BITS_LOCAL_MASK: u32 = 0x0000_ff00;

/// Compose header bits from dispositions
pub const fn msgh_bits(remote: u32, local: u32) -> u32 {
    (remote & 0xff) | ((local & 0xff) << 8)
}

/// Remote disposition from header bits
pub const fn msgh_bits_remote(bits: u32) -> u32 {
    bits & MACH_MSGH_BITS_REMOTE_MASK
}

/// Local disposition from header bits
pub const fn msgh_bits_local(bits: u32) -> u32 {
    (bits & MACH_MSGH_BITS_LOCAL_MASK) >> 8
}

// ============================================================================
// Byte helpers
// ============================================================================

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> IpcResult<u32> {
    let end = offset
        .checked_add(4)
        .ok_or(IpcError::Malformed("offset overflow"))?;
    let bytes = buf
        .get(offset..end)
        .ok_or(IpcError::Malformed("truncated u32"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> IpcResult<u64> {
    let lo = read_u32(buf, offset)? as u64;
    let hi = read_u32(buf, offset + 4)? as u64;
    Ok(lo | (hi << 32))
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

// ============================================================================
// Header
// ============================================================================

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Dispositions and the complex flag
    pub bits: u32,
    /// Size of header and body in bytes, trailer excluded
    pub size: u32,
    /// Destination on send; reply right on receive
    pub remote_port: PortName,
    /// Reply right on send; receiving port on receive
    pub local_port: PortName,
    /// Unused, always null
    pub voucher_port: PortName,
    /// Message ID
    pub id: i32,
}

impl MsgHeader {
    pub fn new(id: i32) -> Self {
        Self {
            bits: 0,
            size: HEADER_SIZE as u32,
            remote_port: PortName::NULL,
            local_port: PortName::NULL,
            voucher_port: PortName::NULL,
            id,
        }
    }

    pub fn is_complex(&self) -> bool {
        self.bits & MACH_MSGH_BITS_COMPLEX != 0
    }

    pub fn remote_disposition(&self) -> u32 {
        msgh_bits_remote(self.bits)
    }

    pub fn local_disposition(&self) -> u32 {
        msgh_bits_local(self.bits)
    }

    /// Parse a header and check its declared size against the buffer
    pub fn decode(buf: &[u8]) -> IpcResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(IpcError::Malformed("buffer shorter than header"));
        }
        let header = Self {
            bits: read_u32(buf, 0)?,
            size: read_u32(buf, 4)?,
            remote_port: PortName(read_u32(buf, 8)?),
            local_port: PortName(read_u32(buf, 12)?),
            voucher_port: PortName(read_u32(buf, 16)?),
            id: read_u32(buf, 20)? as i32,
        };
        let size = header.size as usize;
        if size < HEADER_SIZE || size > buf.len() {
            return Err(IpcError::Malformed("declared size out of range"));
        }
        if header.is_complex() && size < HEADER_SIZE + BODY_SIZE {
            return Err(IpcError::Malformed("complex message without body"));
        }
        Ok(header)
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.bits);
        write_u32(buf, 4, self.size);
        write_u32(buf, 8, self.remote_port.0);
        write_u32(buf, 12, self.local_port.0);
        write_u32(buf, 16, self.voucher_port.0);
        write_u32(buf, 20, self.id as u32);
    }
}

// ============================================================================
// Out-of-line regions
// ============================================================================

/// Memory or port names travelling beside the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OolRegion {
    /// Out-of-line bytes
    Memory(Vec<u8>),
    /// Out-of-line port names (sender's names on send, receiver's on receive)
    Ports(Vec<PortName>),
}

// ============================================================================
// Outgoing messages
// ============================================================================

/// An encoded message ready for the kernel send path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    bytes: Vec<u8>,
    regions: Vec<OolRegion>,
}

impl OutgoingMessage {
    /// Wrap raw bytes; the kernel validates everything on send
    pub fn from_parts(bytes: Vec<u8>, regions: Vec<OolRegion>) -> Self {
        Self { bytes, regions }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn regions(&self) -> &[OolRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Builds outgoing messages descriptor by descriptor
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    header: MsgHeader,
    complex: bool,
    descriptor_count: u32,
    descriptors: Vec<u8>,
    payload: Vec<u8>,
    regions: Vec<OolRegion>,
}

impl MessageBuilder {
    pub fn new(id: i32) -> Self {
        Self {
            header: MsgHeader::new(id),
            complex: false,
            descriptor_count: 0,
            descriptors: Vec::new(),
            payload: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Set the destination right and how it is used
    pub fn remote(mut self, name: PortName, disposition: MsgTypeName) -> Self {
        self.header.remote_port = name;
        self.header.bits = (self.header.bits & !MACH_MSGH_BITS_REMOTE_MASK)
            | msgh_bits(disposition as u32, 0);
        self
    }

    /// Attach a reply right
    pub fn reply(mut self, name: PortName, disposition: MsgTypeName) -> Self {
        self.header.local_port = name;
        self.header.bits = (self.header.bits & !MACH_MSGH_BITS_LOCAL_MASK)
            | msgh_bits(0, disposition as u32);
        self
    }

    /// Mark the message complex even without descriptors
    pub fn complex(mut self) -> Self {
        self.complex = true;
        self
    }

    /// Append a single port-right descriptor
    pub fn port(mut self, name: PortName, disposition: MsgTypeName) -> Self {
        Descriptor::Port {
            name,
            disposition: disposition as u8,
        }
        .encode(&mut self.descriptors);
        self.push_descriptor()
    }

    /// Append an out-of-line memory descriptor
    pub fn out_of_line(mut self, data: Vec<u8>, deallocate: bool) -> Self {
        let region = self.regions.len() as u64;
        Descriptor::OutOfLine {
            region,
            size: data.len() as u32,
            deallocate,
            volatile: false,
        }
        .encode(&mut self.descriptors);
        self.regions.push(OolRegion::Memory(data));
        self.push_descriptor()
    }

    /// Append an out-of-line port array descriptor
    pub fn out_of_line_ports(mut self, names: Vec<PortName>, disposition: MsgTypeName) -> Self {
        let region = self.regions.len() as u64;
        Descriptor::OutOfLinePorts {
            region,
            count: names.len() as u32,
            disposition: disposition as u8,
            deallocate: false,
        }
        .encode(&mut self.descriptors);
        self.regions.push(OolRegion::Ports(names));
        self.push_descriptor()
    }

    /// Append an inline data descriptor
    pub fn inline_data(mut self, data: &[u8]) -> Self {
        Descriptor::Inline { data }.encode(&mut self.descriptors);
        self.push_descriptor()
    }

    /// Append untyped payload after the descriptors
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    fn push_descriptor(mut self) -> Self {
        self.complex = true;
        self.descriptor_count += 1;
        self
    }

    pub fn build(self) -> OutgoingMessage {
        let body_len = if self.complex {
            BODY_SIZE + self.descriptors.len()
        } else {
            0
        };
        let size = HEADER_SIZE + body_len + self.payload.len();

        let mut header = self.header;
        header.size = size as u32;
        if self.complex {
            header.bits |= MACH_MSGH_BITS_COMPLEX;
        }

        let mut bytes = vec![0u8; HEADER_SIZE];
        header.encode_into(&mut bytes);
        if self.complex {
            bytes.extend_from_slice(&self.descriptor_count.to_le_bytes());
            bytes.extend_from_slice(&self.descriptors);
        }
        bytes.extend_from_slice(&self.payload);

        OutgoingMessage {
            bytes,
            regions: self.regions,
        }
    }
}

// ============================================================================
// Audit trailer
// ============================================================================

/// Kernel-verified sender identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditToken {
    pub auid: u32,
    pub euid: u32,
    pub egid: u32,
    pub ruid: u32,
    pub rgid: u32,
    pub pid: u32,
    pub asid: u32,
    pub pidversion: u32,
}

impl AuditToken {
    pub const SIZE: usize = 32;

    fn encode(&self, out: &mut Vec<u8>) {
        for word in [
            self.auid,
            self.euid,
            self.egid,
            self.ruid,
            self.rgid,
            self.pid,
            self.asid,
            self.pidversion,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    fn decode(buf: &[u8], offset: usize) -> IpcResult<Self> {
        let word = |i: usize| read_u32(buf, offset + i * 4);
        Ok(Self {
            auid: word(0)?,
            euid: word(1)?,
            egid: word(2)?,
            ruid: word(3)?,
            rgid: word(4)?,
            pid: word(5)?,
            asid: word(6)?,
            pidversion: word(7)?,
        })
    }
}

/// Append the format-0 audit trailer the kernel writes on receive
pub(crate) fn append_audit_trailer(out: &mut Vec<u8>, seqno: u32, token: &AuditToken) {
    out.extend_from_slice(&TRAILER_FORMAT_0.to_le_bytes());
    out.extend_from_slice(&(AUDIT_TRAILER_SIZE as u32).to_le_bytes());
    out.extend_from_slice(&seqno.to_le_bytes());
    out.extend_from_slice(&token.euid.to_le_bytes());
    out.extend_from_slice(&token.egid.to_le_bytes());
    token.encode(out);
}

// ============================================================================
// Received messages
// ============================================================================

/// A received message.
///
/// The message owns every right the kernel copied out into the receiver's
/// space for it. Rights claimed through [`Message::claim_right`] or
/// [`Message::take_reply_port`] move to the caller; whatever is left is
/// released when the message drops.
pub struct Message {
    header: MsgHeader,
    bytes: Vec<u8>,
    regions: Vec<OolRegion>,
    space: Option<Arc<IpcSpace>>,
    owned: Vec<(PortName, RightKind)>,
    reply: Option<(PortName, RightKind)>,
}

impl Message {
    pub(crate) fn received(
        space: Arc<IpcSpace>,
        bytes: Vec<u8>,
        regions: Vec<OolRegion>,
        owned: Vec<(PortName, RightKind)>,
        reply: Option<(PortName, RightKind)>,
    ) -> IpcResult<Self> {
        let header = MsgHeader::decode(&bytes)?;
        Ok(Self {
            header,
            bytes,
            regions,
            space: Some(space),
            owned,
            reply,
        })
    }

    /// A message that owns no rights, e.g. bytes read off another channel
    pub fn detached(bytes: Vec<u8>, regions: Vec<OolRegion>) -> IpcResult<Self> {
        let header = MsgHeader::decode(&bytes)?;
        Ok(Self {
            header,
            bytes,
            regions,
            space: None,
            owned: Vec::new(),
            reply: None,
        })
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    pub fn id(&self) -> i32 {
        self.header.id
    }

    /// Header and body size, trailer excluded
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn is_complex(&self) -> bool {
        self.header.is_complex()
    }

    /// Reply right name in the receiver's space, or null
    pub fn reply_port(&self) -> PortName {
        self.header.remote_port
    }

    /// The port the message arrived on
    pub fn local_port(&self) -> PortName {
        self.header.local_port
    }

    /// Header and body bytes, trailer excluded
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size()]
    }

    /// Everything after the header up to `size`
    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..self.size()]
    }

    pub fn trailer(&self) -> &[u8] {
        &self.bytes[self.size()..]
    }

    pub fn regions(&self) -> &[OolRegion] {
        &self.regions
    }

    /// Out-of-line memory addressed by a descriptor
    pub fn ool_memory(&self, region: u64) -> Option<&[u8]> {
        match self.regions.get(usize::try_from(region).ok()?)? {
            OolRegion::Memory(data) => Some(data),
            OolRegion::Ports(_) => None,
        }
    }

    /// Out-of-line port names addressed by a descriptor
    pub fn ool_ports(&self, region: u64) -> Option<&[PortName]> {
        match self.regions.get(usize::try_from(region).ok()?)? {
            OolRegion::Ports(names) => Some(names),
            OolRegion::Memory(_) => None,
        }
    }

    /// Payload following the descriptors (or the header, when simple)
    pub fn payload(&self) -> IpcResult<&[u8]> {
        if !self.is_complex() {
            return Ok(self.body());
        }
        let mut reader = descriptor::DescriptorReader::new(self)?;
        for item in reader.by_ref() {
            item?;
        }
        Ok(&self.bytes[reader.offset()..self.size()])
    }

    /// Sender identity from the kernel trailer, if a valid one is present
    pub fn audit_token(&self) -> Option<AuditToken> {
        let trailer = self.trailer();
        if trailer.len() < AUDIT_TRAILER_SIZE {
            return None;
        }
        if read_u32(trailer, 0).ok()? != TRAILER_FORMAT_0 {
            return None;
        }
        let declared = read_u32(trailer, 4).ok()? as usize;
        if declared < AUDIT_TRAILER_SIZE || declared > trailer.len() {
            return None;
        }
        AuditToken::decode(trailer, AUDIT_TRAILER_SIZE - AuditToken::SIZE).ok()
    }

    /// Per-port sequence number from the trailer
    pub fn sequence(&self) -> Option<u32> {
        self.audit_token()?;
        read_u32(self.trailer(), 8).ok()
    }

    /// Number of rights still owned by the message
    pub fn owned_rights(&self) -> usize {
        self.owned.len()
    }

    /// Move one carried right out of the message
    pub fn claim_right(&mut self, name: PortName) -> Option<Handle> {
        let space = self.space.as_ref()?;
        let index = self.owned.iter().position(|(n, _)| *n == name)?;
        let (name, kind) = self.owned.swap_remove(index);
        Some(Handle::from_raw(Arc::clone(space), name, kind))
    }

    /// Move the reply right out of the message
    pub fn take_reply_port(&mut self) -> Option<Handle> {
        let space = self.space.as_ref()?;
        let (name, kind) = self.reply.take()?;
        Some(Handle::from_raw(Arc::clone(space), name, kind))
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("regions", &self.regions.len())
            .field("owned", &self.owned)
            .field("reply", &self.reply)
            .finish()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        let Some(space) = self.space.take() else {
            return;
        };
        for (name, kind) in self.owned.drain(..).chain(self.reply.take()) {
            if let Err(err) = space.release(name, kind) {
                log::debug!("dropping unclaimed {:?} right {}: {}", kind, name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_message_layout() {
        let msg = MessageBuilder::new(7)
            .remote(PortName(0x103), MsgTypeName::CopySend)
            .payload(&42i32.to_le_bytes())
            .build();
        assert_eq!(msg.len(), HEADER_SIZE + 4);

        let header = MsgHeader::decode(msg.bytes()).unwrap();
        assert_eq!(header.id, 7);
        assert_eq!(header.size as usize, HEADER_SIZE + 4);
        assert!(!header.is_complex());
        assert_eq!(header.remote_port, PortName(0x103));
        assert_eq!(header.remote_disposition(), MsgTypeName::CopySend as u32);
        assert_eq!(header.local_disposition(), 0);
    }

    #[test]
    fn complex_message_layout() {
        let msg = MessageBuilder::new(1)
            .remote(PortName(0x103), MsgTypeName::CopySend)
            .reply(PortName(0x203), MsgTypeName::MakeSendOnce)
            .port(PortName(0x303), MsgTypeName::MoveSend)
            .out_of_line(vec![1, 2, 3], false)
            .build();
        let header = MsgHeader::decode(msg.bytes()).unwrap();
        assert!(header.is_complex());
        assert_eq!(
            header.size as usize,
            HEADER_SIZE + BODY_SIZE + PORT_DESCRIPTOR_SIZE + OOL_DESCRIPTOR_SIZE
        );
        assert_eq!(read_u32(msg.bytes(), HEADER_SIZE).unwrap(), 2);
        assert_eq!(header.local_disposition(), MsgTypeName::MakeSendOnce as u32);
        assert_eq!(msg.regions().len(), 1);
    }

    #[test]
    fn header_rejects_bad_sizes() {
        assert!(MsgHeader::decode(&[0u8; 10]).is_err());

        let mut bytes = MessageBuilder::new(1).build().bytes().to_vec();
        write_u32(&mut bytes, 4, 1000);
        assert_eq!(
            MsgHeader::decode(&bytes),
            Err(IpcError::Malformed("declared size out of range"))
        );

        write_u32(&mut bytes, 0, MACH_MSGH_BITS_COMPLEX);
        write_u32(&mut bytes, 4, HEADER_SIZE as u32);
        assert!(MsgHeader::decode(&bytes).is_err());
    }

    #[test]
    fn audit_trailer_validation() {
        let token = AuditToken {
            euid: 501,
            egid: 20,
            pid: 77,
            ..Default::default()
        };
        let mut bytes = MessageBuilder::new(3).build().bytes().to_vec();
        append_audit_trailer(&mut bytes, 9, &token);

        let msg = Message::detached(bytes.clone(), Vec::new()).unwrap();
        assert_eq!(msg.audit_token(), Some(token));
        assert_eq!(msg.sequence(), Some(9));

        // Wrong trailer format
        write_u32(&mut bytes, HEADER_SIZE, 3);
        let msg = Message::detached(bytes.clone(), Vec::new()).unwrap();
        assert_eq!(msg.audit_token(), None);

        // No trailer at all
        let msg = Message::detached(bytes[..HEADER_SIZE].to_vec(), Vec::new()).unwrap();
        assert_eq!(msg.audit_token(), None);
    }

    #[test]
    fn payload_skips_descriptors() {
        let out = MessageBuilder::new(1)
            .inline_data(b"abcde")
            .payload(b"tail")
            .build();
        let msg = Message::detached(out.bytes().to_vec(), Vec::new()).unwrap();
        assert_eq!(msg.payload().unwrap(), b"tail");
    }
}
