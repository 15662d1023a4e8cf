//! The BCM2835 system timer at guest offset `0x3000`.
//!
//! The counter is wholly virtual: a helper thread in the supervising
//! driver advances it once per host millisecond, watches the compare
//! registers, and raises interrupt lines 0..=3 through the bank when one
//! passes. It is an inaccurate clock; the guest gets its real timing from
//! the interrupts, not the counter.
use super::{irq::IrqBank, GuestPort};
use crate::blue_screen;

const CONTROL_STATUS: u64 = 0x00;
const COUNTER_LOW: u64 = 0x04;
const COUNTER_HIGH: u64 = 0x08;
const COMPARE_BASE: u64 = 0x0c;
const COMPARE_END: u64 = 0x18;

pub struct SystemTimer {
    control_status: u32,
    counter: u64,
    compare: [u32; 4],
    /// CHI as latched by the last CLO read
    locked_high: u32,
}

impl SystemTimer {
    pub const fn new() -> Self {
        Self {
            control_status: 0,
            counter: 0,
            compare: [0; 4],
            locked_high: 0,
        }
    }

    /// One guest access to the timer block.
    pub fn access(&mut self, port: &mut impl GuestPort, is_write: bool, srt: u32, offset: u64) {
        match offset {
            CONTROL_STATUS => {
                if is_write {
                    // Writing a match bit acknowledges it
                    self.control_status &= !(port.get_register(srt) as u32);
                } else {
                    port.set_register(srt, self.control_status.into());
                }
            }
            COUNTER_LOW => {
                // Reading CLO latches CHI so a 64-bit read is coherent
                self.locked_high = (self.counter >> 32) as u32;
                port.set_register(srt, self.counter & 0xffff_ffff);
            }
            COUNTER_HIGH => {
                port.set_register(srt, self.locked_high.into());
            }
            COMPARE_BASE..=COMPARE_END => {
                let n = ((offset - COMPARE_BASE) / 4) as usize;
                if is_write {
                    self.compare[n] = port.get_register(srt) as u32;
                } else {
                    port.set_register(srt, self.compare[n].into());
                }
            }
            _ => blue_screen!("guest touched unknown timer register {offset:#x}"),
        }
    }

    /// Whether a compare value lies within `(now, now + ticks)`,
    /// modulo 2^32.
    fn passed(now: u32, ticks: u32, compare: u32) -> bool {
        let (end, wraps) = now.overflowing_add(ticks);
        if wraps {
            compare > now || compare < end
        } else {
            compare > now && compare < end
        }
    }

    /// Advances the emulated clock by `ticks` and raises the lines of any
    /// compare channel that passed. Called from the driver's timer
    /// thread, which cannot touch the vm_state itself: the lines are
    /// raised deferred and the partner syncs the virtual IRQ signal.
    pub fn advance(&mut self, bank: &mut IrqBank, ticks: u32) -> bool {
        let now = self.counter as u32;
        self.counter = self.counter.wrapping_add(ticks.into());
        let mut fired = false;
        for channel in 0..4 {
            if Self::passed(now, ticks, self.compare[channel]) {
                self.control_status |= 1 << channel;
                // Only line 1 is used by RISC OS; the others are an
                // educated guess.
                bank.trigger_deferred(channel as u32);
                fired = true;
            }
        }
        fired
    }
}
