//! The partner-thread guest supervisor.
//!
//! This code runs at EL0, in the map shared by a secure partner thread and
//! its non-secure VCPU. Each `switch_to_partner` hands the CPU to the
//! guest; when the guest traps, the partner resumes with the exception
//! report `{pc, syndrome, fault address, IPA page}` in its first four
//! registers and dispatches on the syndrome's exception class.
//!
//! All access to the stalled guest (its general registers and the pair's
//! system-register block) goes through [`GuestPort`], so the emulated
//! peripherals are plain state machines; the kernel-backed implementation
//! is [`port::SvcPort`].

pub mod bus;
pub mod cp15;
pub mod hvc;
pub mod irq;
pub mod mailbox;
pub mod port;
pub mod supervisor;
pub mod timer;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// A register of the pair's vm_state block, by its fixed index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum VmRegister {
    MairEl1 = 0,
    SctlrEl1 = 1,
    TcrEl1 = 2,
    Ttbr0El1 = 3,
    Ttbr1El1 = 4,
    VbarEl1 = 5,
    ActlrEl1 = 6,
    Fpexc32El2 = 7,
    EsrEl1 = 8,
    FarEl1 = 9,
    VttbrEl2 = 10,
    HcrEl2 = 11,
    HstrEl2 = 12,
    VmpidrEl2 = 13,
    VpidrEl2 = 14,
    VtcrEl2 = 15,
    Dacr32El2 = 16,
    ContextidrEl1 = 17,
}

/// The virtual-interrupt bit of HCR_EL2.
pub const HCR_VI: u64 = 1 << 7;

/// Everything the emulation needs from the kernel while the guest is
/// stalled.
pub trait GuestPort {
    /// One of the guest's general registers (31 is the banked SP).
    fn get_register(&mut self, index: u32) -> u64;
    fn set_register(&mut self, index: u32, value: u64);

    /// The pair's vm_state block; writes return the previous value.
    fn change_vm_register(&mut self, register: VmRegister, value: u64, write: bool) -> u64;

    /// Parks the partner until an emulated interrupt line or helper
    /// thread wakes it.
    fn wait_until_woken(&mut self);

    /// Raises or clears the guest's virtual IRQ line.
    fn assert_virtual_irq(&mut self, asserted: bool) {
        let hcr = self.change_vm_register(VmRegister::HcrEl2, 0, false);
        let wanted = if asserted { hcr | HCR_VI } else { hcr & !HCR_VI };
        if wanted != hcr {
            self.change_vm_register(VmRegister::HcrEl2, wanted, true);
        }
    }
}

/// One guest exception report, as delivered into the partner's registers.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionFrame {
    /// ELR_EL2: where the guest stopped
    pub pc: u64,
    /// ESR_EL2
    pub syndrome: u64,
    /// FAR_EL2
    pub fault_address: u64,
    /// HPFAR_EL2: the faulting IPA page
    pub ipa_page: u64,
}

/// The exception classes the partner handles; everything else means the
/// emulation is incomplete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
enum ExceptionClass {
    TrappedWfiWfe = 0b00_0001,
    TrappedMcrMrc = 0b00_0011,
    TrappedMcrrMrrc = 0b00_0100,
    TrappedCp14 = 0b00_0101,
    TrappedLdcStc = 0b00_0110,
    TrappedFp = 0b00_0111,
    TrappedVmrs = 0b00_1000,
    TrappedPointerAuth = 0b00_1001,
    TrappedCp14RR = 0b00_1100,
    IllegalExecutionState = 0b00_1110,
    Hvc32 = 0b01_0010,
    Smc32 = 0b01_0011,
    Stage2DataAbort = 0b10_0100,
}

/// The emulated peripherals of one guest.
pub struct Devices {
    pub irq: irq::IrqBank,
    pub timer: timer::SystemTimer,
    pub mailbox: mailbox::Mailbox,
    pub bsc: [bus::Bsc; 3],
    pub emmc: bus::Emmc,
    pub hal: hvc::RiscOsHal,
}

impl Devices {
    pub const fn new() -> Self {
        Self {
            irq: irq::IrqBank::new(),
            timer: timer::SystemTimer::new(),
            mailbox: mailbox::Mailbox::new(),
            bsc: [bus::Bsc::new(), bus::Bsc::new(), bus::Bsc::new()],
            emmc: bus::Emmc::new(),
            hal: hvc::RiscOsHal::new(),
        }
    }
}

/// Handles one guest exception. Returns the PC the guest should resume
/// at; by default the trapped instruction is retried.
pub fn handle_trap(
    port: &mut impl GuestPort,
    devices: &mut Devices,
    guest_ram: &mut [u32],
    frame: ExceptionFrame,
) -> u64 {
    let mut next_pc = frame.pc; // Retry instruction by default
    let class = (frame.syndrome >> 26) as u32;
    let Some(class) = ExceptionClass::from_u32(class) else {
        crate::blue_screen!("guest exception class {class:#x} is not emulated");
    };

    match class {
        ExceptionClass::TrappedWfiWfe => port.wait_until_woken(),
        ExceptionClass::TrappedMcrMrc => {
            cp15::access(port, frame.syndrome as u32);
            next_pc += 4;
        }
        ExceptionClass::Hvc32 => hvc::hypercall(port, devices, frame.syndrome as u32),
        ExceptionClass::Stage2DataAbort => {
            bus::stage2_data_abort(port, devices, guest_ram, &frame);
            next_pc += 4;
        }
        ExceptionClass::TrappedMcrrMrrc
        | ExceptionClass::TrappedCp14
        | ExceptionClass::TrappedLdcStc
        | ExceptionClass::TrappedFp
        | ExceptionClass::TrappedVmrs
        | ExceptionClass::TrappedPointerAuth
        | ExceptionClass::TrappedCp14RR
        | ExceptionClass::IllegalExecutionState
        | ExceptionClass::Smc32 => {
            crate::blue_screen!(
                "guest used an unemulated facility (class {:?}, pc {:#x})",
                class,
                frame.pc
            );
        }
    }

    next_pc
}

#[cfg(test)]
mod tests {
    use super::{handle_trap, Devices, ExceptionFrame, GuestPort, VmRegister, HCR_VI};
    use crate::add_test;

    /// A guest stalled in a test bench: its registers and vm_state are
    /// plain arrays.
    struct TestPort {
        regs: [u64; 32],
        vm: [u64; 18],
        waits: u32,
    }

    impl TestPort {
        fn new() -> Self {
            Self {
                regs: [0; 32],
                vm: [0; 18],
                waits: 0,
            }
        }
    }

    impl GuestPort for TestPort {
        fn get_register(&mut self, index: u32) -> u64 {
            self.regs[index as usize]
        }

        fn set_register(&mut self, index: u32, value: u64) {
            self.regs[index as usize] = value;
        }

        fn change_vm_register(&mut self, register: VmRegister, value: u64, write: bool) -> u64 {
            let previous = self.vm[register as usize];
            if write {
                self.vm[register as usize] = value;
            }
            previous
        }

        fn wait_until_woken(&mut self) {
            self.waits += 1;
        }
    }

    /// A trapped `MRC p15, 0, Rt, c0, c0, 0`: EC 0x03, read, Rt in the
    /// syndrome.
    fn mrc_midr_frame(rt: u32) -> ExceptionFrame {
        ExceptionFrame {
            pc: 0x8000,
            syndrome: (0x03 << 26) | u64::from(rt << 5) | 1,
            fault_address: 0,
            ipa_page: 0,
        }
    }

    /// A stage-2 data abort at the given IPA: EC 0x24, ISV, word-sized.
    fn mmio_frame(address: u64, rt: u32, is_write: bool) -> ExceptionFrame {
        let mut syndrome = (0x24_u64 << 26) | (1 << 24) | (2 << 22) | u64::from(rt) << 16;
        if is_write {
            syndrome |= 1 << 6;
        }
        ExceptionFrame {
            pc: 0x8000,
            syndrome,
            fault_address: address & 0xfff,
            ipa_page: address >> 8,
        }
    }

    add_test!(guest_midr_read_sees_an_arm1176, {
        let mut port = TestPort::new();
        let mut devices = Devices::new();
        let mut ram = [0_u32; 4];

        let next = handle_trap(&mut port, &mut devices, &mut ram, mrc_midr_frame(7));
        assert_eq!(port.regs[7], 0x410f_b767);
        assert_eq!(next, 0x8004, "the trapped instruction must be stepped over");
    });

    add_test!(guest_wfi_parks_the_partner, {
        let mut port = TestPort::new();
        let mut devices = Devices::new();
        let mut ram = [0_u32; 4];

        let frame = ExceptionFrame {
            pc: 0x8000,
            syndrome: 0x01 << 26,
            fault_address: 0,
            ipa_page: 0,
        };
        let next = handle_trap(&mut port, &mut devices, &mut ram, frame);
        assert_eq!(port.waits, 1);
        assert_eq!(next, 0x8000, "WFI resumes by retrying");
    });

    add_test!(irq_enable_write_raises_the_virtual_line, {
        let mut port = TestPort::new();
        let mut devices = Devices::new();
        let mut ram = [0_u32; 4];

        // A device raised line 3 while it was masked: no virtual IRQ.
        devices.irq.trigger(&mut port, 3);
        assert_eq!(port.vm[VmRegister::HcrEl2 as usize] & HCR_VI, 0);

        // The guest enables line 3 at 0x2000_b210 through register r5.
        port.regs[5] = 1 << 3;
        handle_trap(
            &mut port,
            &mut devices,
            &mut ram,
            mmio_frame(0x2000_b210, 5, true),
        );
        assert_ne!(port.vm[VmRegister::HcrEl2 as usize] & HCR_VI, 0);

        // Reading the pending register shows the line.
        handle_trap(
            &mut port,
            &mut devices,
            &mut ram,
            mmio_frame(0x2000_b204, 6, false),
        );
        assert_eq!(port.regs[6], 1 << 3);

        // Disabling it drops the virtual line again.
        port.regs[5] = 1 << 3;
        handle_trap(
            &mut port,
            &mut devices,
            &mut ram,
            mmio_frame(0x2000_b21c, 5, true),
        );
        assert_eq!(port.vm[VmRegister::HcrEl2 as usize] & HCR_VI, 0);
    });

    add_test!(property_tags_are_answered_in_place, {
        let mut port = TestPort::new();
        let mut devices = Devices::new();
        // A request buffer at guest word 4: size, code, one tag asking
        // for the board revision.
        let mut ram = [0_u32; 32];
        ram[4] = 8 * 4;
        ram[5] = 0;
        ram[6] = 0x0001_0002;
        ram[7] = 4;
        ram[8] = 0;
        ram[9] = 0;
        ram[10] = 0;

        // The guest posts the buffer address on channel 8.
        port.regs[2] = (4 * 4) | 8;
        handle_trap(
            &mut port,
            &mut devices,
            &mut ram,
            mmio_frame(0x2000_b8a0, 2, true),
        );
        assert_eq!(ram[5], 0x8000_0000);
        assert_eq!(ram[8], 4 | (1 << 31));
        assert_eq!(ram[9], 13, "Model B, 512MB");

        // The status register always reads ready.
        handle_trap(
            &mut port,
            &mut devices,
            &mut ram,
            mmio_frame(0x2000_b898, 3, false),
        );
        assert_eq!(port.regs[3], 0);
    });
}
