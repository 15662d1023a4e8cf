//! HVC32 hypercalls: the RISC OS HAL, made Isambard-aware.
//!
//! The guest's HAL module replaces its timer and interrupt-controller
//! poking with hypercalls, which keeps the hot paths out of the trap-and-
//! emulate machinery. The immediate selects the HAL entry; arguments and
//! results travel in the guest's r0.
use super::{Devices, GuestPort};
use crate::blue_screen;

/// The HAL entries the guest may invoke.
mod hal {
    pub const TIMER_GRANULARITY: u32 = 0xe;
    pub const TIMER_SET_PERIOD: u32 = 0x10;
    pub const TIMER_PERIOD: u32 = 0x11;
    pub const COUNTER_RATE: u32 = 0x13;
    pub const COUNTER_PERIOD: u32 = 0x14;
    pub const DEBUG_TX: u32 = 86;
    pub const DEBUG_RX: u32 = 87;
    pub const IRQ_MAX: u32 = 107;
}

/// HAL state that survives between hypercalls.
pub struct RiscOsHal {
    timer_period: u32,
}

impl RiscOsHal {
    pub const fn new() -> Self {
        Self { timer_period: 0 }
    }
}

/// One HVC32 from the guest.
pub fn hypercall(port: &mut impl GuestPort, devices: &mut Devices, syndrome: u32) {
    match syndrome & 0xffff {
        hal::TIMER_GRANULARITY => match port.get_register(0) {
            // Timer 0 ticks at 100Hz
            0 => port.set_register(0, 100),
            timer => blue_screen!("guest asked for granularity of timer {timer}"),
        },
        hal::TIMER_SET_PERIOD => {
            devices.hal.timer_period = port.get_register(0) as u32;
        }
        hal::TIMER_PERIOD => {
            port.set_register(0, devices.hal.timer_period.into());
        }
        hal::COUNTER_RATE => {
            port.set_register(0, 1000);
        }
        hal::COUNTER_PERIOD => {
            port.set_register(0, devices.hal.timer_period.into());
        }
        hal::DEBUG_TX => {
            // The guest's debug byte is in r0; nothing listens here, the
            // display driver shows it when wired up.
        }
        hal::DEBUG_RX => {
            // Nothing to receive from.
        }
        hal::IRQ_MAX => {
            port.set_register(0, 64 + 21);
        }
        entry => blue_screen!("guest invoked unknown HAL entry {entry:#x}"),
    }
}
