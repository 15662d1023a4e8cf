//! CP15 emulation: the guest believes it is an ARM1176.
//!
//! `HSTR_EL2` traps the coprocessor space wholesale; reads are answered
//! from a fixed ARM1176 identity file, writes to the translation and
//! fault registers land in the pair's vm_state so they take effect on the
//! next guest entry, and the cache and barrier operations are performed
//! locally on the guest's behalf.
use super::{GuestPort, VmRegister};
use crate::blue_screen;
use bitfield_struct::bitfield;
use core::arch::asm;

/// The trapped MCR/MRC syndrome (ESR_EL2 ISS encoding).
#[bitfield(u32)]
pub struct CoproSyndrome {
    pub is_read: bool,
    #[bits(4)]
    pub crm: u8,
    #[bits(5)]
    pub rt: u8,
    #[bits(4)]
    pub crn: u8,
    #[bits(3)]
    pub opc1: u8,
    #[bits(3)]
    pub opc2: u8,
    #[bits(4)]
    pub cond: u8,
    pub cv: bool,
    #[bits(7)]
    _rest: u8,
}

/// The MIDR the guest sees: an ARM1176JZF-S.
pub const EMULATED_MIDR: u64 = 0x410f_b767;

/// Mask selecting `{CRm, CRn, Opc1, Opc2}` from the syndrome: the
/// register being named, with the direction and Rt masked out.
const REGISTER_MASK: u32 = 0xffc1e;

fn read_only(port: &mut impl GuestPort, cp: CoproSyndrome, value: u64) {
    if cp.is_read() {
        port.set_register(cp.rt().into(), value);
    } else {
        blue_screen!("guest wrote a read-only CP15 register");
    }
}

fn write_only(cp: CoproSyndrome) {
    if cp.is_read() {
        blue_screen!("guest read a write-only CP15 register");
    }
}

/// A register the guest may write freely; the written value reads back,
/// and `vm_register` (when set) mirrors it into the pair's vm_state.
fn read_write(
    port: &mut impl GuestPort,
    cp: CoproSyndrome,
    shadow: &mut u64,
    vm_register: Option<VmRegister>,
) {
    if cp.is_read() {
        port.set_register(cp.rt().into(), *shadow);
    } else {
        *shadow = port.get_register(cp.rt().into());
        if let Some(register) = vm_register {
            port.change_vm_register(register, *shadow, true);
        }
    }
}

/// Shadow values for the handful of writable registers.
pub struct Cp15Shadow {
    sctlr: u64,
    dacr: u64,
    ttbcr: u64,
    ttbr0: u64,
    actlr: u64,
}

impl Cp15Shadow {
    pub const fn new() -> Self {
        Self {
            sctlr: 0,
            dacr: 0,
            ttbcr: 0,
            ttbr0: 0,
            actlr: 7,
        }
    }
}

/// One trapped MCR/MRC. The syndrome keys follow G7.2 of the ARM ARM and
/// the ARM1176 TRM (ARM DDI 0333H).
pub fn access_with_shadow(
    port: &mut impl GuestPort,
    shadow: &mut Cp15Shadow,
    syndrome: u32,
) {
    let cp = CoproSyndrome::from(syndrome);

    match syndrome & REGISTER_MASK {
        0x00000 => read_only(port, cp, EMULATED_MIDR), // MIDR
        0xa0000 => read_only(port, cp, 0x8000_0f00),   // MPIDR
        0x20000 => read_only(port, cp, 0x1d15_2152),   // CTR, Cache Type
        // SCTLR; takes effect at the next guest entry
        0x00400 => read_write(port, cp, &mut shadow.sctlr, Some(VmRegister::SctlrEl1)),
        // DACR, Domain Access Control
        0x00c00 => read_write(port, cp, &mut shadow.dacr, Some(VmRegister::Dacr32El2)),
        // TTBCR
        0x40800 => read_write(port, cp, &mut shadow.ttbcr, Some(VmRegister::TcrEl1)),
        // TTBR0
        0x00800 => read_write(port, cp, &mut shadow.ttbr0, Some(VmRegister::Ttbr0El1)),
        // ACTLR; the guest fixes errata through it, none of which exist here
        0x20400 => read_write(port, cp, &mut shadow.actlr, None),

        // Cache, branch predictor and TLB maintenance: the host's caches
        // are coherent with the guest's view, so completion is all that
        // must be emulated
        0x01c0a => write_only(cp), // ICIALLU
        0x0200e => write_only(cp), // TLBIALL
        0xc1c0a => write_only(cp), // BPIALL
        0x2200a => write_only(cp), // Invalidate instruction TLB entry
        0x2200c => write_only(cp), // Invalidate data TLB entry
        0x41c14 => write_only(cp), // DCCSW, clean by set/way
        0x21c14 => (),             // DCCMVAC, clean by VA
        0x24000 => write_only(cp), // CLIDR
        0x01c0e => {
            // Invalidate both caches, flush the branch target cache
            write_only(cp);
            barrier_isb_dsb();
        }

        // The CP15 barrier instructions
        0x81c14 => {
            write_only(cp);
            barrier_dsb();
        }
        0x81c0a => {
            write_only(cp);
            barrier_isb();
        }
        0xa1c14 | 0x01c1c => {
            write_only(cp);
            barrier_dmb();
        }

        // DFAR and DFSR map onto the vm_state fault registers
        0x01800 => {
            if cp.is_read() {
                let value = port.change_vm_register(VmRegister::FarEl1, 0, false);
                port.set_register(cp.rt().into(), value);
            } else {
                let value = port.get_register(cp.rt().into());
                port.change_vm_register(VmRegister::FarEl1, value, true);
            }
        }
        0x01400 => {
            if cp.is_read() {
                let value = port.change_vm_register(VmRegister::EsrEl1, 0, false);
                port.set_register(cp.rt().into(), value);
            } else {
                let value = port.get_register(cp.rt().into());
                port.change_vm_register(VmRegister::EsrEl1, value, true);
            }
        }

        // The ARM1176 identity block (ARM DDI 0360F; one typo corrected)
        0x00002 => read_only(port, cp, 0x0000_0111), // ID_PFR0
        0x20002 => read_only(port, cp, 0x0000_0001), // ID_PFR1
        0x40002 => read_only(port, cp, 0x0000_0002), // ID_DFR0
        0x80002 => read_only(port, cp, 0x0110_0103), // ID_MMFR0
        0xa0002 => read_only(port, cp, 0x1002_0302), // ID_MMFR1
        0xc0002 => read_only(port, cp, 0x0122_2000), // ID_MMFR2
        0xe0002 => read_only(port, cp, 0x0000_0000), // ID_MMFR3
        0x00004 => read_only(port, cp, 0x0010_0011), // ID_ISAR0
        0x20004 => read_only(port, cp, 0x1200_2111), // ID_ISAR1
        0x40004 => read_only(port, cp, 0x1122_1011), // ID_ISAR2
        0x60004 => read_only(port, cp, 0x0110_2131), // ID_ISAR3
        0x80004 => read_only(port, cp, 0x0000_0141), // ID_ISAR4
        0xa0004 => read_only(port, cp, 0x0000_0000), // ID_ISAR5, not in ARM11
        key => blue_screen!("guest touched unemulated CP15 register {key:#x}"),
    }
}

/// One trapped MCR/MRC against a private shadow file.
pub fn access(port: &mut impl GuestPort, syndrome: u32) {
    static mut SHADOW: Cp15Shadow = Cp15Shadow::new();
    // SAFETY: Only the single supervisor thread of this guest gets here
    let shadow = unsafe { &mut *core::ptr::addr_of_mut!(SHADOW) };
    access_with_shadow(port, shadow, syndrome);
}

fn barrier_dsb() {
    // SAFETY: Barriers have no unsafe effects
    unsafe { asm!("dsb sy") };
}

fn barrier_isb() {
    // SAFETY: As above
    unsafe { asm!("isb sy") };
}

fn barrier_dmb() {
    // SAFETY: As above
    unsafe { asm!("dmb sy") };
}

fn barrier_isb_dsb() {
    // SAFETY: As above
    unsafe { asm!("isb sy", "dsb sy") };
}
