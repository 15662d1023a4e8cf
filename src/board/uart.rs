//! The PL011 debug console.
//!
//! The kernel only ever transmits on it: boot progress when `verbose` is
//! enabled, and the blue-screen register dump. Reception belongs to the
//! user-mode serial driver.
use super::PERIPHERAL_KERNEL_BASE;
use crate::{architecture::Spinlock, board::Mmio, call_once};
use core::fmt::{self, Write};
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, ReadWrite},
};

register_bitfields! {
    u32,
    /// The UART_DR Register is the data register.
    DR [
        /// Receive (read) data character.\
        /// Transmit (write) data character.
        DATA OFFSET(0) NUMBITS(8)
    ],

    /// The UART_FR Register is the flag register.
    FR [
        /// Transmit FIFO full.
        TXFF OFFSET(5) NUMBITS(1)
    ],

    /// The UART_CR Register is the control register.
    CR [
        /// Transmit enable.
        TXE OFFSET(8) NUMBITS(1),
        /// UART enable.
        UARTEN OFFSET(0) NUMBITS(1)
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => DR: ReadWrite<u32, DR::Register>),
        (0x04 => _reserved),
        (0x18 => FR: ReadOnly<u32, FR::Register>),
        (0x1C => _reserved2),
        (0x30 => CR: ReadWrite<u32, CR::Register>),
        (0x34 => @END),
    }
}

/// Abstraction for the associated MMIO registers.
type Registers = Mmio<RegisterBlock>;

/// Inner representation of the UART
struct UartInner {
    /// The UART registers, memory mapped
    registers: Registers,
}

/// Representation of the UART.
pub struct Uart {
    /// The protected UART
    inner: Spinlock<UartInner>,
}

impl UartInner {
    /// Creates a raw UART instance
    /// # Safety
    /// The start address must be correct, and the range must not be used by
    /// anything else. This includes not initializing the UART multiple times
    const unsafe fn new(mmio_start_addr: *mut RegisterBlock) -> Self {
        Self {
            // SAFETY: By assumption, the start address is correct
            registers: unsafe { Registers::new(mmio_start_addr) },
        }
    }

    /// Enables the transmitter. The firmware has already configured the
    /// baud rate and GPIO alternate functions.
    fn init(&mut self) {
        self.registers.CR.write(CR::UARTEN::SET + CR::TXE::SET);
    }

    /// Sends a byte across the UART
    fn write_byte(&mut self, c: u8) {
        while self.registers.FR.matches_all(FR::TXFF::SET) {
            core::hint::spin_loop();
        }
        self.registers.DR.set(c.into());
    }
}

impl fmt::Write for UartInner {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }

        Ok(())
    }
}

impl Uart {
    /// Creates a UART instance
    /// # Safety
    /// The start address must be correct, and the range must not be used by
    /// anything else
    const unsafe fn new(start_address: *mut RegisterBlock) -> Self {
        Self {
            inner: Spinlock::new(
                // SAFETY: By assumption, the start address must be correct
                unsafe { UartInner::new(start_address) },
            ),
        }
    }

    /// Initializes the UART
    pub fn init(&self) {
        call_once!();
        self.inner.lock(UartInner::init);
    }

    /// Formats the given arguments out over the serial line
    pub fn write_fmt(&self, args: core::fmt::Arguments) {
        self.inner.lock(|uart| {
            uart.write_fmt(args)
                .expect("Writing to the UART should not fail");
        });
    }
}

/// The system-wide UART
// SAFETY: This is the PL011 address on the Raspberry Pi 3
#[allow(clippy::as_conversions)]
static UART: Uart =
    unsafe { Uart::new((PERIPHERAL_KERNEL_BASE + 0x0020_1000) as *mut RegisterBlock) };

/// Gets the system-wide serial connection
pub fn serial() -> &'static Uart {
    &UART
}
