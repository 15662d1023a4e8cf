//! The BCM2835 interrupt bank, as the guest sees it.
//!
//! The guest's interrupt controller is entirely virtual: emulated devices
//! raise lines with [`IrqBank::trigger`], the guest manipulates the
//! enable/pending registers through stage-2 traps, and the resulting
//! summary drives the virtual IRQ signal (`HCR_EL2.VI`) so the guest
//! takes an interrupt exactly when its own controller would have fired.
use super::GuestPort;
use crate::blue_screen;

/// Register offsets within the `0xb200` page.
const BASIC_PENDING: u64 = 0x200;
const PENDING_1: u64 = 0x204;
const PENDING_2: u64 = 0x208;
const FIQ_CONTROL: u64 = 0x20c;
const ENABLE_1: u64 = 0x210;
const ENABLE_2: u64 = 0x214;
const ENABLE_BASIC: u64 = 0x218;
const DISABLE_1: u64 = 0x21c;
const DISABLE_2: u64 = 0x220;
const DISABLE_BASIC: u64 = 0x224;

pub struct IrqBank {
    basic_pending: u32,
    pending_1: u32,
    pending_2: u32,
    fiq_control: u32,
    enabled_1: u32,
    enabled_2: u32,
    enabled_basic: u32,
    active: bool,
}

impl IrqBank {
    pub const fn new() -> Self {
        Self {
            basic_pending: 0,
            pending_1: 0,
            pending_2: 0,
            fiq_control: 0,
            enabled_1: 0,
            enabled_2: 0,
            enabled_basic: 0,
            active: false,
        }
    }

    /// Recomputes the virtual IRQ line after any state change.
    fn update_virtual_irq(&mut self, port: &mut impl GuestPort) {
        let now = (self.pending_1 & self.enabled_1) != 0
            || (self.pending_2 & self.enabled_2) != 0
            || (self.basic_pending & self.enabled_basic) != 0;
        if now != self.active {
            port.assert_virtual_irq(now);
        }
        self.active = now;
    }

    /// Raises interrupt line `n` (0..=71: 64 GPU lines, then the basic
    /// bank).
    pub fn trigger(&mut self, port: &mut impl GuestPort, n: u32) {
        self.trigger_deferred(n);
        self.update_virtual_irq(port);
    }

    /// Raises a line without touching the virtual IRQ signal. Helper
    /// threads use this: only the partner may reach the pair's vm_state,
    /// so they defer the signal update to the next [`Self::sync`].
    pub fn trigger_deferred(&mut self, n: u32) {
        match n {
            0..=31 => self.pending_1 |= 1 << n,
            32..=63 => self.pending_2 |= 1 << (n - 32),
            _ => self.basic_pending |= 1 << (n - 64),
        }
    }

    /// Brings the virtual IRQ signal up to date with the pending state;
    /// called by the partner after helper threads have raised lines.
    pub fn sync(&mut self, port: &mut impl GuestPort) {
        self.update_virtual_irq(port);
    }

    /// Clears interrupt line `n`.
    pub fn clear(&mut self, port: &mut impl GuestPort, n: u32) {
        match n {
            0..=31 => self.pending_1 &= !(1 << n),
            32..=63 => self.pending_2 &= !(1 << (n - 32)),
            _ => self.basic_pending &= !(1 << (n - 64)),
        }
        self.update_virtual_irq(port);
    }

    fn enabled_and_pending(&self, n: u32) -> bool {
        match n {
            0..=31 => self.pending_1 & self.enabled_1 & (1 << n) != 0,
            32..=63 => self.pending_2 & self.enabled_2 & (1 << (n - 32)) != 0,
            _ => self.basic_pending & self.enabled_basic & (1 << (n - 64)) != 0,
        }
    }

    /// The basic-pending register folds a handful of frequently used GPU
    /// lines in next to the summary bits.
    fn basic_pending_value(&self) -> u32 {
        let mut pending = self.basic_pending & self.enabled_basic & 0xff;
        for (gpu_line, bit) in [
            (62, 20), // EMMC/SD card interface
            (57, 19),
            (56, 18),
            (55, 17),
            (54, 16),
            (53, 15),
            (19, 14),
            (18, 13),
            (10, 12),
            (9, 11),
            (7, 10),
        ] {
            if self.enabled_and_pending(gpu_line) {
                pending |= 1 << bit;
            }
        }
        if self.pending_1 & self.enabled_1 != 0 {
            pending |= 1 << 9;
        }
        if self.pending_2 & self.enabled_2 != 0 {
            pending |= 1 << 8;
        }
        pending
    }

    /// One guest access to the bank; `srt` is the guest register the data
    /// moves through.
    pub fn access(&mut self, port: &mut impl GuestPort, is_write: bool, srt: u32, offset: u64) {
        match offset {
            BASIC_PENDING if !is_write => {
                port.set_register(srt, self.basic_pending_value().into());
            }
            PENDING_1 if !is_write => {
                port.set_register(srt, (self.pending_1 & self.enabled_1).into());
            }
            PENDING_2 if !is_write => {
                port.set_register(srt, (self.pending_2 & self.enabled_2).into());
            }
            FIQ_CONTROL => {
                if is_write {
                    self.fiq_control = port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.fiq_control.into());
                }
            }
            ENABLE_1 => {
                if is_write {
                    self.enabled_1 |= port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.enabled_1.into());
                }
            }
            ENABLE_2 => {
                if is_write {
                    self.enabled_2 |= port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.enabled_2.into());
                }
            }
            ENABLE_BASIC => {
                if is_write {
                    self.enabled_basic |= port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.enabled_basic.into());
                }
            }
            DISABLE_1 => {
                if is_write {
                    self.enabled_1 &= !(port.get_register(srt) as u32);
                } else {
                    port.set_register(srt, self.enabled_1.into());
                }
            }
            DISABLE_2 => {
                if is_write {
                    self.enabled_2 &= !(port.get_register(srt) as u32);
                } else {
                    port.set_register(srt, self.enabled_2.into());
                }
            }
            DISABLE_BASIC => {
                if is_write {
                    self.enabled_basic &= !(port.get_register(srt) as u32);
                } else {
                    port.set_register(srt, self.enabled_basic.into());
                }
            }
            _ => blue_screen!("guest touched unknown interrupt register {offset:#x}"),
        }
        if is_write {
            self.update_virtual_irq(port);
        }
    }
}
