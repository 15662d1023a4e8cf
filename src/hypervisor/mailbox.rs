//! The VideoCore mailboxes and the property-tag channel.
//!
//! There is no VideoCore on the other side any more; the property channel
//! is answered synchronously from fixed board facts, writing the
//! responses straight into the guest's request buffer in its RAM. Status
//! always reads ready.
use super::GuestPort;
use crate::blue_screen;

/// The board facts the property channel reports.
mod board {
    /// Model zero: the guest's HAL locks up in init on anything else.
    pub const MODEL: u32 = 0;
    /// Model B, 512MB; the old numbering scheme.
    pub const REVISION: u32 = 13;
    pub const MAC: [u32; 2] = [0x2a2a_2a2a, 0x2a2a];
    pub const SERIAL: [u32; 2] = [0x2a2a_2a2a, 0x2a2a_2a2a];
    /// EMMC clock, Hz.
    pub const EMMC_CLOCK: u32 = 250_000;
    /// Core clock, Hz.
    pub const CORE_CLOCK: u32 = 250_000_000;
}

pub struct Mailbox {
    /// The last request processed, returned on mailbox-0 reads
    request: u32,
    /// How much guest RAM the property channel reports
    ram_size: u32,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            request: 0xffff_ffff,
            ram_size: 64 << 20,
        }
    }

    pub fn set_ram_size(&mut self, bytes: u32) {
        self.ram_size = bytes;
    }

    /// Mailbox 0 data: the completed request word.
    pub fn read_data(&mut self, port: &mut impl GuestPort, srt: u32) {
        port.set_register(srt, self.request.into());
    }

    /// Mailbox 0 status: always ready.
    pub fn read_status(&mut self, port: &mut impl GuestPort, srt: u32) {
        port.set_register(srt, 0);
    }

    /// Mailbox 1 data: a request arrives.
    pub fn write_data(&mut self, port: &mut impl GuestPort, srt: u32, guest_ram: &mut [u32]) {
        self.request = port.get_register(srt) as u32;
        match self.request & 0xf {
            8 => {
                let offset = ((self.request & 0x3fff_fff0) / 4) as usize;
                self.respond_to_tags(guest_ram, offset);
            }
            0 => {
                // Power control; not the guest's problem any more
            }
            channel => blue_screen!("guest wrote mailbox channel {channel}"),
        }
    }

    /// Walks a property-request buffer, answering each tag in place.
    /// Assumes a well-formed request, the way the firmware does.
    fn respond_to_tags(&mut self, guest_ram: &mut [u32], buffer: usize) {
        guest_ram[buffer + 1] = 0x8000_0000; // Request processed
        let mut p = buffer + 2;
        loop {
            let tag = guest_ram[p];
            if tag == 0 {
                break;
            }
            let value_length = guest_ram[p + 1];
            // Response code: length | processed, unless the tag overrides
            guest_ram[p + 2] = value_length | (1 << 31);
            match tag {
                0x0001_0001 => guest_ram[p + 3] = board::MODEL,
                0x0001_0002 => guest_ram[p + 3] = board::REVISION,
                0x0001_0003 => {
                    guest_ram[p + 2] = 6 | (1 << 31);
                    guest_ram[p + 3] = board::MAC[0];
                    guest_ram[p + 4] = board::MAC[1];
                }
                0x0001_0004 => {
                    guest_ram[p + 3] = board::SERIAL[0];
                    guest_ram[p + 4] = board::SERIAL[1];
                }
                0x0001_0005 => {
                    // ARM memory: base and size
                    guest_ram[p + 3] = 0;
                    guest_ram[p + 4] = self.ram_size;
                }
                0x0001_0006 => {
                    // VC memory: none
                    guest_ram[p + 3] = 0;
                    guest_ram[p + 4] = 0;
                }
                0x0006_0001 => guest_ram[p + 3] = 1 << 4, // DMA channels
                0x0004_0002 => {
                    // Blank screen: the display is not the guest's
                }
                0x0003_0002 => {
                    // Get clock rate
                    guest_ram[p + 4] = match guest_ram[p + 3] {
                        1 => board::EMMC_CLOCK,
                        4 => board::CORE_CLOCK,
                        clock => blue_screen!("guest asked for clock {clock}"),
                    };
                }
                0x0003_8002 => {
                    // Set clock rate: only the UART's is ever set
                    if guest_ram[p + 3] != 2 {
                        blue_screen!("guest set clock {}", guest_ram[p + 3]);
                    }
                }
                0x0004_801f | 0x0004_8020 => {
                    // Touch and virtual-GPIO buffers: accepted and
                    // ignored; success is reported by zeroing the address
                    guest_ram[p + 3] = 0;
                }
                tag => blue_screen!("guest sent unknown property tag {tag:#x}"),
            }
            p += 3 + (value_length as usize) / 4;
        }
    }
}
