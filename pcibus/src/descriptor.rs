//! The resource-request wire format shared with the platform's
//! resource authority.
//!
//! A request is a sequence of ACPI QWORD address space descriptors
//! terminated by a small end tag. The same stream shape comes back from
//! [`get_proposed`](crate::authority::ResourceAuthority::get_proposed),
//! with the range minimum holding the proposed base and the translation
//! offset holding a per-descriptor satisfaction status.

use alloc_crate::vec::Vec;
use core::fmt;
use core::fmt::Display;

use num_enum::TryFromPrimitive;

use crate::resource::{HostBridgeResources, ResourceKind};

/// QWORD address space descriptor tag.
pub const QWORD_TAG: u8 = 0x8A;
/// Payload length of a QWORD descriptor (bytes after the 3-byte header).
pub const QWORD_LEN: u16 = 0x2B;
/// Small end tag (with zero checksum byte).
pub const END_TAG: u8 = 0x79;

/// Total encoded size of one QWORD descriptor.
pub const QWORD_SIZE: usize = 3 + QWORD_LEN as usize;

/// Satisfaction status carried in the translation-offset field on the
/// return path.
pub const STATUS_SATISFIED: u64 = 0;
pub const STATUS_NOT_SATISFIED: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum RawResourceType {
    Memory = 0,
    Io = 1,
}

/// Type-specific flag bits for prefetchable, cacheable memory.
const MEM_FLAG_PREFETCHABLE: u8 = 0x06;

/// One decoded descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    /// Range minimum: zero on submission, proposed base on return.
    pub base: u64,
    pub length: u64,
    /// Alignment mask, carried in the range maximum field.
    pub align: u64,
    /// Translation offset: zero on submission, status on return.
    pub status: u64,
}

impl ResourceDescriptor {
    pub fn request(kind: ResourceKind, length: u64, align: u64) -> ResourceDescriptor {
        ResourceDescriptor {
            kind,
            base: 0,
            length,
            align,
            status: 0,
        }
    }

    pub fn satisfied(&self) -> bool {
        self.status == STATUS_SATISFIED
    }

    fn granularity(&self) -> u64 {
        match self.kind {
            ResourceKind::Io => 0,
            ResourceKind::Mem32 | ResourceKind::PMem32 => 32,
            ResourceKind::Mem64 | ResourceKind::PMem64 => 64,
        }
    }

    fn type_flags(&self) -> u8 {
        if self.kind.is_prefetchable() {
            MEM_FLAG_PREFETCHABLE
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    Truncated,
    UnexpectedTag(u8),
    BadLength(u16),
    BadType(u8),
    BadGranularity(u64),
    MissingEndTag,
}

impl Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::Truncated => write!(f, "descriptor stream truncated"),
            DescriptorError::UnexpectedTag(tag) => {
                write!(f, "unexpected descriptor tag {:#04x}", tag)
            }
            DescriptorError::BadLength(len) => {
                write!(f, "bad descriptor length {:#06x}", len)
            }
            DescriptorError::BadType(ty) => write!(f, "bad resource type {:#04x}", ty),
            DescriptorError::BadGranularity(g) => {
                write!(f, "bad address space granularity {}", g)
            }
            DescriptorError::MissingEndTag => write!(f, "descriptor stream missing end tag"),
        }
    }
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Encode `descriptors` followed by the end tag.
pub fn serialize(descriptors: &[ResourceDescriptor], out: &mut Vec<u8>) {
    for desc in descriptors.iter() {
        out.push(QWORD_TAG);
        out.extend_from_slice(&QWORD_LEN.to_le_bytes());

        let raw_type = match desc.kind {
            ResourceKind::Io => RawResourceType::Io,
            _ => RawResourceType::Memory,
        };
        out.push(raw_type as u8);
        out.push(0); // general flags
        out.push(desc.type_flags());

        push_u64(out, desc.granularity());
        push_u64(out, desc.base);
        push_u64(out, desc.align);
        push_u64(out, desc.status);
        push_u64(out, desc.length);
    }

    out.push(END_TAG);
    out.push(0);
}

/// Decode a stream produced by [`serialize`].
pub fn parse(bytes: &[u8]) -> Result<Vec<ResourceDescriptor>, DescriptorError> {
    let mut out = Vec::new();
    let mut cursor = 0usize;

    loop {
        let tag = *bytes.get(cursor).ok_or(DescriptorError::MissingEndTag)?;

        if tag == END_TAG {
            return Ok(out);
        }
        if tag != QWORD_TAG {
            return Err(DescriptorError::UnexpectedTag(tag));
        }
        if bytes.len() < cursor + QWORD_SIZE {
            return Err(DescriptorError::Truncated);
        }

        let len = u16::from_le_bytes([bytes[cursor + 1], bytes[cursor + 2]]);
        if len != QWORD_LEN {
            return Err(DescriptorError::BadLength(len));
        }

        let raw_type = RawResourceType::try_from(bytes[cursor + 3])
            .map_err(|_| DescriptorError::BadType(bytes[cursor + 3]))?;
        let type_flags = bytes[cursor + 5];

        let granularity = read_u64(bytes, cursor + 6);
        let base = read_u64(bytes, cursor + 14);
        let align = read_u64(bytes, cursor + 22);
        let status = read_u64(bytes, cursor + 30);
        let length = read_u64(bytes, cursor + 38);

        let prefetchable = (type_flags & MEM_FLAG_PREFETCHABLE) == MEM_FLAG_PREFETCHABLE;
        let kind = match (raw_type, granularity, prefetchable) {
            (RawResourceType::Io, _, _) => ResourceKind::Io,
            (RawResourceType::Memory, 32, false) => ResourceKind::Mem32,
            (RawResourceType::Memory, 32, true) => ResourceKind::PMem32,
            (RawResourceType::Memory, 64, false) => ResourceKind::Mem64,
            (RawResourceType::Memory, 64, true) => ResourceKind::PMem64,
            (RawResourceType::Memory, g, _) => return Err(DescriptorError::BadGranularity(g)),
        };

        out.push(ResourceDescriptor {
            kind,
            base,
            length,
            align,
            status,
        });

        cursor += QWORD_SIZE;
    }
}

/// Serialize one host bridge's root demands, in resource-kind order,
/// skipping empty trees.
pub(crate) fn serialize_roots(res: &HostBridgeResources) -> Vec<u8> {
    let mut descriptors = Vec::new();

    for kind in ResourceKind::ALL {
        let root = res.root(kind);
        if root.length() == 0 {
            continue;
        }

        descriptors.push(ResourceDescriptor::request(
            kind,
            root.length(),
            root.alignment(),
        ));
    }

    let mut out = Vec::new();
    serialize(&descriptors, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::prelude::v1::*;

    #[test]
    fn wire_layout_is_bit_exact() {
        let desc = ResourceDescriptor::request(ResourceKind::PMem32, 0x4000, 0x1FFF);

        let mut bytes = Vec::new();
        serialize(&[desc], &mut bytes);

        assert_eq!(bytes.len(), QWORD_SIZE + 2);
        assert_eq!(bytes[0], 0x8A);
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]), 0x2B);
        assert_eq!(bytes[3], 0); // memory
        assert_eq!(bytes[4], 0); // general flags
        assert_eq!(bytes[5], 0x06); // cacheable + prefetchable
        assert_eq!(read_u64(&bytes, 6), 32); // granularity
        assert_eq!(read_u64(&bytes, 14), 0); // range minimum
        assert_eq!(read_u64(&bytes, 22), 0x1FFF); // alignment in range maximum
        assert_eq!(read_u64(&bytes, 30), 0); // translation offset
        assert_eq!(read_u64(&bytes, 38), 0x4000); // length
        assert_eq!(bytes[QWORD_SIZE], END_TAG);
        assert_eq!(bytes[QWORD_SIZE + 1], 0);
    }

    #[test]
    fn roundtrip_all_kinds() {
        let descs: Vec<ResourceDescriptor> = ResourceKind::ALL
            .iter()
            .enumerate()
            .map(|(i, kind)| ResourceDescriptor {
                kind: *kind,
                base: (i as u64) << 20,
                length: 0x1000 << i,
                align: (0x1000u64 << i) - 1,
                status: if i % 2 == 0 {
                    STATUS_SATISFIED
                } else {
                    STATUS_NOT_SATISFIED
                },
            })
            .collect();

        let mut bytes = Vec::new();
        serialize(&descs, &mut bytes);

        assert_eq!(parse(&bytes).unwrap(), descs);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse(&[]), Err(DescriptorError::MissingEndTag));
        assert_eq!(parse(&[0x42]), Err(DescriptorError::UnexpectedTag(0x42)));
        assert_eq!(parse(&[QWORD_TAG, 0x2B]), Err(DescriptorError::Truncated));

        let mut bytes = Vec::new();
        serialize(
            &[ResourceDescriptor::request(ResourceKind::Io, 0x100, 0xFF)],
            &mut bytes,
        );
        bytes[1] = 0x10; // corrupt the length field
        assert_eq!(parse(&bytes), Err(DescriptorError::BadLength(0x10)));
    }
}
