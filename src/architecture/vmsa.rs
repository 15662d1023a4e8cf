//! AArch64 VMSA stage-1 descriptors, 4 KB granule.
//!
//! Descriptors are built with minimal permissions and widened explicitly;
//! they are written into per-core tables by the map manager and into the
//! shared kernel tables by the boot sequence.
use bitfield_struct::bitfield;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use static_assertions::const_assert_eq;

/// Memory attributes describing a memory region; the values index MAIR_EL1.
///
/// The values of this enum reference the bytes of [`MAIR_VALUE`].
/// Do not change one without the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MemoryType {
    DeviceNGnRnE = 0,
    DeviceNGnRE = 1,
    NonCacheable = 2,
    InnerWriteThrough = 3,
    OuterWriteThrough = 4,
    WriteBack = 5,
}

/// The MAIR_EL1 value the [`MemoryType`] indices refer to.
pub const MAIR_VALUE: u64 = 0xffbb_f444_0400;

impl From<u64> for MemoryType {
    fn from(value: u64) -> Self {
        #[expect(
            clippy::expect_used,
            reason = "This implementation is necessary for bitfield derivation"
        )]
        FromPrimitive::from_u64(value).expect("Invalid memory attribute provided")
    }
}

impl From<MemoryType> for u64 {
    #[inline]
    fn from(value: MemoryType) -> Self {
        // SAFETY: `MemoryType` can always fit into a `u64`
        unsafe { ToPrimitive::to_u64(&value).unwrap_unchecked() }
    }
}

/// One stage-1 translation table entry.
///
/// The same layout serves levels 1 through 3: at levels 1 and 2 a set
/// `table` bit means the entry points at a subtable, clear means a block;
/// at level 3 the bit must be set for a page.
#[bitfield(u64)]
pub struct Descriptor {
    /// Whether or not this descriptor is valid
    pub valid: bool,
    /// Table/page at levels 1-2/3; clear for a block mapping
    pub table: bool,
    /// Attributes for this memory region. Used to index into `MAIR_EL1`
    #[bits(3)]
    pub memory_type: MemoryType,
    /// Security state of the output address
    pub not_secure: bool,
    /// Whether or not EL0 can access this entry
    pub el0_accessible: bool,
    /// Disables writes to this mapping
    pub read_only: bool,
    /// Shareability for this memory region
    #[bits(2)]
    pub shareability: u8,
    /// Cleared entries fault on first access; the kernel always sets this,
    /// it does not want the notification
    pub access_flag: bool,
    /// ASID-specific when set
    pub not_global: bool,
    /// The output address, in 4 KB pages
    #[bits(39)]
    pub page_number: u64,
    pub dirty_bit_modifier: bool,
    /// Whether or not the nearby mappings map a contiguous range, allowing
    /// for TLB caching optimizations
    pub contiguous: bool,
    /// Whether or not EL1 can execute in this mapping
    pub privileged_execute_never: bool,
    /// Whether or not EL0 can execute in this mapping
    pub unprivileged_execute_never: bool,
    #[bits(4)]
    _reserved: u8,
    #[bits(4)]
    _hw_use: u8,
    _ignored: bool,
}

// The descriptor is written raw into live translation tables.
const_assert_eq!(core::mem::size_of::<Descriptor>(), 8);

/// Guaranteed invalid; not the only invalid value.
pub const INVALID: Descriptor = Descriptor::new();

impl Descriptor {
    /// A level-3 page entry for the given physical address.
    pub fn page_at(physical: u64) -> Self {
        Self::new()
            .with_valid(true)
            .with_table(true)
            .with_page_number(physical >> 12)
    }

    /// A level-1 or level-2 block entry for the given physical address.
    pub fn block_at(physical: u64) -> Self {
        Self::new().with_valid(true).with_page_number(physical >> 12)
    }

    /// A level-1 or level-2 entry pointing at the next-level table.
    pub fn subtable_at(physical: u64) -> Self {
        Self::new()
            .with_valid(true)
            .with_table(true)
            .with_page_number(physical >> 12)
    }

    /// Strongly-ordered device memory, no execution at any level.
    pub fn device_memory(self) -> Self {
        self.with_memory_type(MemoryType::DeviceNGnRnE)
            .with_privileged_execute_never(true)
            .with_unprivileged_execute_never(true)
    }

    pub fn write_back_memory(self) -> Self {
        self.with_memory_type(MemoryType::WriteBack)
    }

    pub fn uncached_memory(self) -> Self {
        self.with_memory_type(MemoryType::NonCacheable)
    }

    pub fn el0_read_write(self) -> Self {
        self.with_privileged_execute_never(true)
            .with_unprivileged_execute_never(true)
            .with_read_only(false)
            .with_el0_accessible(true)
    }

    pub fn el0_read_only(self) -> Self {
        self.with_privileged_execute_never(true)
            .with_unprivileged_execute_never(true)
            .with_read_only(true)
            .with_el0_accessible(true)
    }

    pub fn el0_read_execute(self) -> Self {
        self.with_privileged_execute_never(false)
            .with_unprivileged_execute_never(false)
            .with_read_only(true)
            .with_el0_accessible(true)
    }

    pub fn el0_read_write_execute(self) -> Self {
        self.with_privileged_execute_never(false)
            .with_unprivileged_execute_never(false)
            .with_read_only(false)
            .with_el0_accessible(true)
    }

    pub fn privileged_read_write(self) -> Self {
        self.with_privileged_execute_never(true)
            .with_unprivileged_execute_never(true)
            .with_read_only(false)
            .with_el0_accessible(false)
    }

    pub fn privileged_read_execute(self) -> Self {
        self.with_privileged_execute_never(false)
            .with_unprivileged_execute_never(true)
            .with_read_only(true)
            .with_el0_accessible(false)
    }
}

#[cfg(test)]
mod tests {
    use super::{Descriptor, MemoryType};
    use crate::add_test;

    add_test!(descriptor_layout_matches_vmsa, {
        // A block at 0x8000_0000: valid, not table, output address
        // preserved in bits [47:12].
        let block = Descriptor::block_at(0x8000_0000);
        assert_eq!(u64::from(block) & 0x3, 0b01);
        assert_eq!(u64::from(block) & 0x0000_ffff_ffff_f000, 0x8000_0000);

        // Memory type occupies bits [4:2].
        let wb = block.write_back_memory();
        assert_eq!((u64::from(wb) >> 2) & 0x7, MemoryType::WriteBack as u64);

        // EL0 read-write sets AP[1] (bit 6), clears AP[2] (bit 7), and
        // forbids execution at both levels (bits 53, 54).
        let rw = wb.el0_read_write().with_access_flag(true);
        let raw = u64::from(rw);
        assert_eq!((raw >> 6) & 1, 1);
        assert_eq!((raw >> 7) & 1, 0);
        assert_eq!((raw >> 53) & 0b11, 0b11);
    });
}
