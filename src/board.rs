//! Raspberry Pi 3 board specifics: physical addresses of the peripherals
//! the kernel itself touches, and the debug serial console.
//!
//! Everything else on the peripheral bus belongs either to user-mode
//! drivers (reached through map handles) or to the guest emulation in
//! [`crate::hypervisor`].

mod mmio;
mod uart;

pub use mmio::Mmio;
pub use uart::Uart;

/// Physical base of the BCM2837 peripheral window, as seen by the ARM.
pub const PERIPHERAL_BASE: u64 = 0x3F00_0000;

/// The kernel's own mapping of the peripheral window.
pub const PERIPHERAL_KERNEL_BASE: u64 =
    crate::architecture::machine::KERNEL_BASE + PERIPHERAL_BASE;

/// Physical base of the peripheral window as the emulated guest sees it.
/// The guest is an ARM1176-era image that expects the original BCM2835
/// layout.
pub const GUEST_PERIPHERAL_BASE: u64 = 0x2000_0000;

/// Gets the debug serial connection
pub fn serial() -> &'static Uart {
    uart::serial()
}

/// Initializes board-specific items
/// # Safety
/// Must only be called once, during kernel initialization
pub unsafe fn init() {
    crate::call_once!();
    uart::serial().init();
}
