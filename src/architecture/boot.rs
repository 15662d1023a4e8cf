//! The boot sequence: assembles `boot.s` with the layout constants it
//! needs and provides the first Rust code each core runs.
use super::machine;
use crate::kernel::{
    init,
    per_core::{Core, POINTER_PAIR_OFFSET},
};
use core::arch::global_asm;
use core::mem::offset_of;

/// A page-aligned translation table for the kernel's own mapping.
#[repr(C, align(4096))]
struct TablePage<T>(T);

/// Attributes of a kernel 2 MB block: write-back, inner shareable,
/// accessed, privileged-only, EL0-execute-never.
const BLOCK_NORMAL: u64 = 0x1 | (5 << 2) | (3 << 8) | (1 << 10) | (1 << 54);

/// Attributes of a device 2 MB block: nGnRnE, outer shareable, accessed,
/// execute-never at both levels.
const BLOCK_DEVICE: u64 = 0x1 | (2 << 8) | (1 << 10) | (1 << 53) | (1 << 54);

/// The level-2 table mapping the kernel's gigabyte: the image and its RAM
/// in 2 MB blocks, the BCM peripheral window as device memory.
const fn kernel_level2() -> [u64; 512] {
    let mut table = [0_u64; 512];
    let mut block = 0;
    // 32 MB covers the image, the core blocks and the early free RAM
    while block < 16 {
        table[block] = ((block as u64) << 21) | BLOCK_NORMAL;
        block += 1;
    }
    let mut block = 0x1f8; // 0x3f00_0000
    while block < 0x200 {
        table[block] = ((block as u64) << 21) | BLOCK_DEVICE;
        block += 1;
    }
    table
}

/// Level 2 of the shared kernel tables; constant for the life of the
/// system.
static KERNEL_TT_L2: TablePage<[u64; 512]> = TablePage(kernel_level2());

/// Level 1 of the shared kernel tables: one entry, pointed at level 2 by
/// the boot assembly (a table descriptor needs the physical address).
static mut KERNEL_TT_L1: TablePage<[u64; 4]> = TablePage([0; 4]);

/// TCR_EL1: 4 KB granules both halves, write-back write-allocate
/// cacheable walks, inner shareable, 40-bit PA. The low half spans 16 GB
/// (T0SZ 30: the sixteen level-1 entries of a map, enough for the memory
/// allocator's 8 GB window), the high half 4 GB of kernel alias (T1SZ 32).
const TCR_VALUE: u64 = 0x2_b520_351e;

/// SCTLR_EL1: MMU, data and instruction caches on, plus the mandatory
/// RES1 bits.
const SCTLR_VALUE: u64 = 0x30d0_1805;

global_asm!(
    include_str!("boot.s"),
    core_size = const core::mem::size_of::<Core>(),
    pair_off = const POINTER_PAIR_OFFSET,
    tt_l1_off = const offset_of!(Core, tt_l1),
    mair = const super::vmsa::MAIR_VALUE,
    tcr = const TCR_VALUE,
    sctlr = const SCTLR_VALUE,
    kernel_l1 = sym KERNEL_TT_L1,
    kernel_l2 = sym KERNEL_TT_L2,
    el1_entry = sym el1_boot_entry,
);

/// The first Rust code on each core: secure EL1, MMU on, running high.
extern "C" fn el1_boot_entry(core: *mut Core) -> ! {
    let physical = (core as u64 & 0xffff_ffff) as *mut Core;
    // SAFETY: The boot assembly hands each core its own zeroed block
    let core = unsafe { &mut *core };
    core.core_number = machine::core_number().into();
    core.physical_address = physical;
    // SAFETY: Reached exactly once per core
    unsafe { init::secure_el1_entry(core) }
}

/// This core's block, if the boot sequence has set it up.
pub fn try_current_core() -> Option<&'static mut Core> {
    let number = machine::core_number() as usize;
    // SAFETY: The blocks exist for the life of the system; the caller is
    // the diagnostics path on its own core
    let core = unsafe { machine::core_block(number) };
    (core.physical_address as u64 != 0).then_some(core)
}
