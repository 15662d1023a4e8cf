//! The guest's peripheral bus: stage-2 data aborts decoded and routed to
//! the emulated register blocks.
//!
//! The guest is an old BCM2835 image; its peripherals sit at
//! `0x2000_0000`. Nothing behind that window is real: every access traps
//! with a syndrome naming the transfer register, and lands here.
use super::{Devices, ExceptionFrame, GuestPort};
use crate::blue_screen;
use bitfield_struct::bitfield;

/// Where the guest believes the peripherals live.
pub const GUEST_PERIPHERAL_BASE: u64 = 0x2000_0000;

/// The stage-2 data-abort syndrome (ESR_EL2 ISS encoding).
#[bitfield(u32)]
pub struct DataAbortSyndrome {
    #[bits(6)]
    pub dfsc: u8,
    /// Write, not read
    pub wnr: bool,
    /// Fault on a stage-1 walk
    pub s1ptw: bool,
    /// Cache maintenance
    pub cm: bool,
    /// External abort
    pub ea: bool,
    /// FAR not valid
    pub fnv: bool,
    #[bits(2)]
    pub set: u8,
    _res0: bool,
    /// Acquire-release
    pub ar: bool,
    /// 64-bit register
    pub sf: bool,
    /// The register the data moves through
    #[bits(5)]
    pub srt: u8,
    /// Sign extend
    pub sse: bool,
    /// Access size, log2 bytes
    #[bits(2)]
    pub sas: u8,
    /// The above hold valid data
    pub isv: bool,
    #[bits(7)]
    _rest: u8,
}

/// Routes one stage-2 data abort to its peripheral.
pub fn stage2_data_abort(
    port: &mut impl GuestPort,
    devices: &mut Devices,
    guest_ram: &mut [u32],
    frame: &ExceptionFrame,
) {
    let syndrome = DataAbortSyndrome::from(frame.syndrome as u32);
    if !syndrome.isv() {
        blue_screen!("stage-2 abort without a valid syndrome");
    }

    // HPFAR carries the IPA page in bits [43:8]; the page offset comes
    // from the faulting VA.
    let address = (frame.ipa_page << 8) | (frame.fault_address & 0xfff);
    let offset = address - GUEST_PERIPHERAL_BASE;
    let page = offset & !0xfff;
    let is_write = syndrome.wnr();
    let srt: u32 = syndrome.srt().into();

    match (page, offset) {
        (_, 0x10_0020) => {
            // Power management reset status
            if is_write {
                blue_screen!("guest wrote the reset status register");
            }
            port.set_register(srt, 1 << 12); // Power-on reset
        }
        (0xb000, 0xb200..=0xb2ff) => {
            devices.irq.access(port, is_write, srt, offset & 0xfff);
        }
        (_, 0xb880) => {
            if is_write {
                blue_screen!("guest wrote the read mailbox");
            }
            devices.mailbox.read_data(port, srt);
        }
        (_, 0xb898) => {
            if is_write {
                blue_screen!("guest wrote the mailbox status");
            }
            devices.mailbox.read_status(port, srt);
        }
        (_, 0xb8a0) => {
            if !is_write {
                blue_screen!("guest read the write mailbox");
            }
            devices.mailbox.write_data(port, srt, guest_ram);
        }
        (_, 0x20_0000) => {
            // GPIO function select: quietly swallowed, the pins are not
            // the guest's
        }
        (0x20_5000, _) => devices.bsc[0].access(port, is_write, srt, offset & 0xfff),
        (0x80_4000, _) => devices.bsc[1].access(port, is_write, srt, offset & 0xfff),
        (0x80_5000, _) => devices.bsc[2].access(port, is_write, srt, offset & 0xfff),
        (0x3000, _) => devices.timer.access(port, is_write, srt, offset & 0xfff),
        (0x30_0000, _) => devices.emmc.access(port, is_write, srt, offset & 0xfff),
        _ => blue_screen!("guest touched unemulated address {address:#x}"),
    }
}

/// A BSC (I²C) controller register file. BCM2835-ARM-Peripherals.pdf
/// section 3.
pub struct Bsc {
    control: u32,
    status: u32,
    data_length: u32,
    slave_address: u32,
    clock_divider: u32,
    data_delay: u32,
    clock_stretch_timeout: u32,
}

impl Bsc {
    pub const fn new() -> Self {
        Self {
            control: 0,
            status: 0x50, // TXD | TA clear: ready to transmit
            data_length: 0,
            slave_address: 0,
            clock_divider: 0x5dc,
            data_delay: 0x0030_0030,
            clock_stretch_timeout: 0x40,
        }
    }

    pub fn access(&mut self, port: &mut impl GuestPort, is_write: bool, srt: u32, offset: u64) {
        match offset {
            0x00 => {
                if is_write {
                    self.control = port.get_register(srt) as u32;
                    // A start with nothing on the bus completes
                    // immediately with DONE
                    if self.control & (1 << 15) != 0 && self.control & (1 << 7) != 0 {
                        self.status |= 0b10;
                    }
                } else {
                    port.set_register(srt, self.control.into());
                }
            }
            0x04 => {
                if is_write {
                    // Writing status bits clears them
                    self.status &= !(port.get_register(srt) as u32);
                } else {
                    port.set_register(srt, self.status.into());
                }
            }
            0x08 => {
                if is_write {
                    self.data_length = port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.data_length.into());
                }
            }
            0x0c => {
                if is_write {
                    self.slave_address = port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.slave_address.into());
                }
            }
            0x10 => {
                // Data FIFO: nothing is on the other end of the bus
                if !is_write {
                    port.set_register(srt, 0);
                }
            }
            0x14 => {
                if is_write {
                    self.clock_divider = port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.clock_divider.into());
                }
            }
            0x18 => {
                if is_write {
                    self.data_delay = port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.data_delay.into());
                }
            }
            0x1c => {
                if is_write {
                    self.clock_stretch_timeout = port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.clock_stretch_timeout.into());
                }
            }
            _ => blue_screen!("guest touched unknown BSC register {offset:#x}"),
        }
    }
}

/// The EMMC register file. Commands are accepted and latched for the SD
/// helper thread; the guest's own card never answers, the real card
/// belongs to the block-storage driver.
pub struct Emmc {
    arg2: u32,
    blksizecnt: u32,
    arg1: u32,
    cmdtm: u32,
    resp: [u32; 4],
    data: u32,
    status: u32,
    control0: u32,
    control1: u32,
    control2: u32,
    interrupt: u32,
    irpt_mask: u32,
    irpt_en: u32,
    force_irpt: u32,
    boot_timeout: u32,
    dbg_sel: u32,
    exrdfifo_cfg: u32,
    exrdfifo_en: u32,
    tune_step: u32,
    tune_steps_std: u32,
    tune_steps_ddr: u32,
    spi_int_spt: u32,
    slotisr_ver: u32,
    /// Set on CMDTM writes; the SD helper thread consumes it
    pub command_pending: bool,
}

impl Emmc {
    pub const fn new() -> Self {
        Self {
            arg2: 0,
            blksizecnt: 0,
            arg1: 0,
            cmdtm: 0,
            resp: [0; 4],
            data: 0,
            status: 0,
            control0: 0,
            control1: 0,
            control2: 0,
            interrupt: 0,
            irpt_mask: 0,
            irpt_en: 0,
            force_irpt: 0,
            boot_timeout: 0,
            dbg_sel: 0,
            exrdfifo_cfg: 0,
            exrdfifo_en: 0,
            tune_step: 0,
            tune_steps_std: 0,
            tune_steps_ddr: 0,
            spi_int_spt: 0,
            slotisr_ver: 0x9900_0001,
            command_pending: false,
        }
    }

    pub fn access(&mut self, port: &mut impl GuestPort, is_write: bool, srt: u32, offset: u64) {
        let register: &mut u32 = match offset {
            0x00 => &mut self.arg2,
            0x04 => &mut self.blksizecnt,
            0x08 => &mut self.arg1,
            0x0c => &mut self.cmdtm,
            0x10 => &mut self.resp[0],
            0x14 => &mut self.resp[1],
            0x18 => &mut self.resp[2],
            0x1c => &mut self.resp[3],
            0x20 => &mut self.data,
            0x24 => &mut self.status,
            0x28 => &mut self.control0,
            0x2c => &mut self.control1,
            0x30 => {
                // Writing interrupt bits acknowledges them
                if is_write {
                    self.interrupt &= !(port.get_register(srt) as u32);
                } else {
                    port.set_register(srt, self.interrupt.into());
                }
                return;
            }
            0x34 => &mut self.irpt_mask,
            0x38 => &mut self.irpt_en,
            0x3c => &mut self.control2,
            0x50 => &mut self.force_irpt,
            0x70 => &mut self.boot_timeout,
            0x74 => &mut self.dbg_sel,
            0x80 => &mut self.exrdfifo_cfg,
            0x84 => &mut self.exrdfifo_en,
            0x88 => &mut self.tune_step,
            0x8c => &mut self.tune_steps_std,
            0x90 => &mut self.tune_steps_ddr,
            0xf0 => &mut self.spi_int_spt,
            0xfc => &mut self.slotisr_ver,
            _ => blue_screen!("guest touched unknown EMMC register {offset:#x}"),
        };
        if is_write {
            *register = port.get_register(srt) as u32;
            if offset == 0x0c {
                self.command_pending = true;
            }
        } else {
            let value = *register;
            port.set_register(srt, value.into());
        }
    }
}
