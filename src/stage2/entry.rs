//! The wire layout of a single stage-2 page-table entry, and the tagged
//! union used everywhere else in this crate to reason about one.
//!
//! Earlier revisions of this hypervisor's design scattered raw 64-bit
//! words and bit macros through the walker, which made it easy to set the
//! valid bit without the attribute bits that give it meaning (or vice
//! versa). Modeling an entry as `Stage2Descriptor` instead means there is
//! no way to construct a "valid but attribute-less" descriptor: the
//! variant itself carries the data a valid entry needs.

use bitfield_struct::bitfield;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// Index into `MAIR_EL2` selecting a stage-2 leaf's memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MemoryAttribute {
    Device = 0,
    Normal = 1,
}

impl From<u8> for MemoryAttribute {
    fn from(value: u8) -> Self {
        FromPrimitive::from_u8(value).expect("invalid stage-2 memory attribute index")
    }
}

impl From<MemoryAttribute> for u8 {
    #[inline]
    fn from(value: MemoryAttribute) -> Self {
        // SAFETY: `MemoryAttribute` always fits in a `u8`.
        unsafe { ToPrimitive::to_u8(&value).unwrap_unchecked() }
    }
}

/// Stage-2 shareability domain for a leaf descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Shareability {
    Non = 0b00,
    Outer = 0b10,
    Inner = 0b11,
}

impl From<u8> for Shareability {
    fn from(value: u8) -> Self {
        FromPrimitive::from_u8(value).expect("invalid stage-2 shareability value")
    }
}

impl From<Shareability> for u8 {
    #[inline]
    fn from(value: Shareability) -> Self {
        // SAFETY: `Shareability` always fits in a `u8`.
        unsafe { ToPrimitive::to_u8(&value).unwrap_unchecked() }
    }
}

/// Attributes carried by a leaf (`Page`) descriptor: the stage-2
/// memory-attribute index (into `MAIR_EL2`), the access permission, and
/// the shareability domain. The access flag is not modeled here because
/// this design always sets it for any mapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAttr {
    pub mem_attr_index: MemoryAttribute,
    /// Stage-2 access permission field (`S2AP`); `0b11` is read-write.
    pub access_perm: u8,
    pub shareability: Shareability,
}

impl PageAttr {
    /// Device-nGnRE, read-write, inner-shareable. Used for the UART page.
    pub const DEVICE_RW: Self = Self {
        mem_attr_index: MemoryAttribute::Device,
        access_perm: 0b11,
        shareability: Shareability::Inner,
    };

    /// Normal write-back, read-write, inner-shareable. Used for guest RAM.
    pub const NORMAL_RW: Self = Self {
        mem_attr_index: MemoryAttribute::Normal,
        access_perm: 0b11,
        shareability: Shareability::Inner,
    };
}

#[bitfield(u64)]
struct RawDescriptor {
    valid: bool,
    /// Set for every non-invalid entry this design produces: a `TABLE`
    /// descriptor at L1/L2, or a `PAGE` descriptor at L3. ARM gives these
    /// two meanings to the same bit depending on the walk level; this type
    /// does not know which level it belongs to, so callers in `stage2::walk`
    /// are the ones who know whether to build a `Table` or `Page` variant.
    table_or_page: bool,
    #[bits(3)]
    mem_attr_index: u8,
    #[bits(1)]
    _res0: u8,
    #[bits(2)]
    access_perm: u8,
    #[bits(2)]
    shareability: u8,
    access_flag: bool,
    #[bits(1)]
    _res1: u8,
    /// Output address bits `[47:12]`, i.e. the target physical page number.
    #[bits(36)]
    ppn: u64,
    #[bits(16)]
    _res2: u16,
}

/// A decoded stage-2 page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2Descriptor {
    /// No translation installed.
    Invalid,
    /// Points at the next-level table, physically addressed.
    Table(u64),
    /// A 4 KiB leaf mapping, physically addressed, with its attributes.
    Page(u64, PageAttr),
}

impl Stage2Descriptor {
    /// Encodes this descriptor to its 64-bit wire representation.
    #[must_use]
    pub fn encode(self) -> u64 {
        let raw = match self {
            Self::Invalid => RawDescriptor::new(),
            Self::Table(pa) => RawDescriptor::new()
                .with_valid(true)
                .with_table_or_page(true)
                .with_ppn(pa >> 12),
            Self::Page(pa, attr) => RawDescriptor::new()
                .with_valid(true)
                .with_table_or_page(true)
                .with_mem_attr_index(attr.mem_attr_index.into())
                .with_access_perm(attr.access_perm)
                .with_shareability(attr.shareability.into())
                .with_access_flag(true)
                .with_ppn(pa >> 12),
        };
        raw.into_bits()
    }

    /// Decodes a 64-bit wire representation at an intermediate walk level
    /// (L1 or L2), where a valid entry is always a `Table`.
    #[must_use]
    pub fn decode_table_level(bits: u64) -> Self {
        let raw = RawDescriptor::from_bits(bits);
        if !raw.valid() {
            Self::Invalid
        } else {
            debug_assert!(raw.table_or_page(), "block descriptors are not produced by s2_map");
            Self::Table(raw.ppn() << 12)
        }
    }

    /// Decodes a 64-bit wire representation at the final walk level (L3),
    /// where a valid entry is always a `Page`.
    #[must_use]
    pub fn decode_page_level(bits: u64) -> Self {
        let raw = RawDescriptor::from_bits(bits);
        if !raw.valid() {
            Self::Invalid
        } else {
            debug_assert!(raw.table_or_page());
            Self::Page(
                raw.ppn() << 12,
                PageAttr {
                    mem_attr_index: raw.mem_attr_index().into(),
                    access_perm: raw.access_perm(),
                    shareability: raw.shareability().into(),
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_descriptor_round_trips() {
        let pa = 0x4010_0000_u64;
        let bits = Stage2Descriptor::Table(pa).encode();
        assert_eq!(Stage2Descriptor::decode_table_level(bits), Stage2Descriptor::Table(pa));
    }

    #[test]
    fn page_descriptor_round_trips() {
        let pa = 0x0900_0000_u64;
        let descriptor = Stage2Descriptor::Page(pa, PageAttr::DEVICE_RW);
        let bits = descriptor.encode();
        assert_eq!(Stage2Descriptor::decode_page_level(bits), descriptor);
    }

    #[test]
    fn zero_bits_decode_as_invalid() {
        assert_eq!(Stage2Descriptor::decode_table_level(0), Stage2Descriptor::Invalid);
        assert_eq!(Stage2Descriptor::decode_page_level(0), Stage2Descriptor::Invalid);
    }

    #[test]
    fn access_flag_always_set_on_pages() {
        let bits = Stage2Descriptor::Page(0x4000_0000, PageAttr::NORMAL_RW).encode();
        assert_eq!(bits & (1 << 10), 1 << 10);
    }
}
