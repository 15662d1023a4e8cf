//! The Rust face of the EL3 trampoline.
//!
//! The real work happens in `el3.s`; this module assembles it with the
//! structure offsets it hard-codes, and records the secure world's EL1
//! system registers for the trampoline to restore after guest execution.
use crate::kernel::{
    per_core::Core,
    thread::{ThreadContext, ThreadSlot},
};
use aarch64_cpu::registers::{MAIR_EL1, SCTLR_EL1, TCR_EL1, TTBR1_EL1, VBAR_EL1};
use core::arch::global_asm;
use core::mem::offset_of;
use tock_registers::interfaces::Readable;

global_asm!(
    include_str!("el3.s"),
    regs_off = const offset_of!(ThreadContext, regs),
    pc_off = const offset_of!(ThreadContext, pc),
    spsr_off = const offset_of!(ThreadContext, spsr),
    partner_off = const offset_of!(ThreadContext, partner_slot),
    vm_off = const offset_of!(ThreadSlot, vm),
    tt_l1_off = const offset_of!(Core, tt_l1),
);

extern "C" {
    /// The shared EL2/EL3 vector table.
    pub static _vbar_el23: core::cell::UnsafeCell<()>;
    static mut _secure_registers: [u64; 5];
}

/// Captures the current secure EL1 register values for the trampoline.
///
/// Must run after the boot sequence has configured secure EL1 and before
/// the first switch into a guest.
///
/// # Safety
/// Must only be called once per configuration, from the boot path.
pub unsafe fn record_secure_registers() {
    let values = [
        MAIR_EL1.get(),
        SCTLR_EL1.get(),
        TCR_EL1.get(),
        TTBR1_EL1.get(),
        VBAR_EL1.get(),
    ];
    // SAFETY: The block is only read by EL3, between configurations
    unsafe {
        _secure_registers = values;
        // EL3 reads it uncached
        crate::architecture::machine::clean_invalidate_line(core::ptr::addr_of!(
            _secure_registers
        ));
        crate::architecture::machine::clean_invalidate_line(
            core::ptr::addr_of!(_secure_registers).cast::<u8>().add(32),
        );
    }
    crate::architecture::machine::dsb_sy();
}
