//! Bring-up of one guest: the driver-side code that assembles the pair
//! and then sits in the supervise loop for ever.
//!
//! The sequence mirrors what every guest needs: its RAM mapped into this
//! map (the property-tag channel answers in place there), a stage-2
//! table giving the guest its "physical" address space, the kernel pair
//! created over that table, and a helper thread driving the emulated
//! system timer.
use super::{handle_trap, irq, port::SvcPort, Devices};
use crate::client::{self, Capability, DriverSystem, UserLock};

/// Where this map sees the guest's RAM.
pub const GUEST_RAM_VA: u64 = 0x800_0000;

/// Where this map sees the stage-2 table page.
const STAGE2_TABLE_VA: u64 = 0x8_0000;

/// How much RAM the guest is given; must match what the mailbox property
/// channel reports.
pub const GUEST_RAM_SIZE: u64 = 64 << 20;

/// The millisecond period of the emulated system-timer thread, in timer
/// ticks.
const TIMER_PERIOD_TICKS: u64 = 1;

/// A stage-2 block descriptor: 2 MB, write-back, inner shareable,
/// accessed, read-write-execute.
fn stage2_block(physical: u64) -> u64 {
    0x1 | (0xf << 2) | (3 << 6) | (3 << 8) | (1 << 10) | physical
}

/// The one guest of this driver. The supervisor thread owns the loop;
/// the timer thread only touches the devices under the lock.
struct Guest {
    devices: Devices,
    supervisor: u64,
}

static GUEST_LOCK: UserLock = UserLock::new();
static mut GUEST: Guest = Guest {
    devices: Devices::new(),
    supervisor: 0,
};

/// The timer helper: advances the emulated clock once per millisecond
/// and wakes the supervisor whenever a compare channel fires, so the
/// pending line reaches the guest promptly.
extern "C" fn timer_thread() -> ! {
    loop {
        let (fired, supervisor) = GUEST_LOCK.with(|| {
            // SAFETY: The lock serialises all access to the guest state
            let guest = unsafe { &mut *core::ptr::addr_of_mut!(GUEST) };
            let fired = guest
                .devices
                .timer
                .advance(&mut guest.devices.irq, 1000);
            (fired, guest.supervisor)
        });
        if fired && supervisor != 0 {
            client::wake_thread(supervisor);
        }
        client::sleep_ticks(TIMER_PERIOD_TICKS);
    }
}

/// Builds the guest's stage-2 table in the page mapped at
/// [`STAGE2_TABLE_VA`]: 2 MB blocks covering its RAM, invalid beyond.
///
/// # Safety
/// The table page must be mapped, and `vm_memory_base` must be the
/// physical start of the guest's RAM.
unsafe fn build_stage2_table(vm_memory_base: u64) {
    let table = STAGE2_TABLE_VA as *mut u64;
    // SAFETY: The page was mapped for exactly this
    unsafe {
        for entry in 0..512 {
            table.add(entry).write_volatile(0);
        }
        for block in 0..(GUEST_RAM_SIZE >> 21) {
            table
                .add(block as usize)
                .write_volatile(stage2_block(vm_memory_base + (block << 21)));
        }
        // EL2 walks this table with its MMU off
        for line in (0..4096).step_by(64) {
            core::arch::asm!(
                "dc civac, {p}",
                p = in(reg) STAGE2_TABLE_VA + line,
                options(nostack),
            );
        }
        core::arch::asm!("dsb sy");
    }
}

/// Stack for the timer helper thread.
#[repr(align(16))]
struct HelperStack([u64; 64]);
static mut TIMER_STACK: HelperStack = HelperStack([0; 64]);

/// Assembles the pair and runs the guest from IPA zero. `guest_memory`
/// and `stage2_page` are physical memory blocks this map may use.
///
/// # Safety
/// Must be called once, by the thread that is to become the secure
/// partner, in a map with [`GUEST_RAM_VA`] and [`STAGE2_TABLE_VA`] free.
pub unsafe fn run(
    driver_system: DriverSystem,
    guest_memory: Capability,
    stage2_page: Capability,
) -> ! {
    driver_system
        .map_at(guest_memory, GUEST_RAM_VA)
        .unwrap_or_else(|_| crate::blue_screen!("guest memory would not map"));
    driver_system
        .map_at(stage2_page, STAGE2_TABLE_VA)
        .unwrap_or_else(|_| crate::blue_screen!("stage-2 page would not map"));

    let vm_memory_base = driver_system
        .physical_address_of(GUEST_RAM_VA)
        .unwrap_or_else(|_| crate::blue_screen!("guest memory has no physical address"));

    // SAFETY: Mapped just above
    unsafe {
        build_stage2_table(vm_memory_base);
    }

    let stage2_for_system = client::duplicate_to_pass_to(driver_system.0 .0, stage2_page.0)
        .unwrap_or_else(|_| crate::blue_screen!("stage-2 block would not re-mint"));
    driver_system
        .make_partner_thread(stage2_for_system)
        .unwrap_or_else(|_| crate::blue_screen!("partner pair would not form"));

    GUEST_LOCK.with(|| {
        // SAFETY: The lock serialises all access to the guest state
        let guest = unsafe { &mut *core::ptr::addr_of_mut!(GUEST) };
        guest.supervisor = client::current_thread_code();
        guest.devices.mailbox.set_ram_size(GUEST_RAM_SIZE as u32);
    });

    // SAFETY: The stack belongs to the new thread alone
    let stack_top = unsafe { core::ptr::addr_of_mut!(TIMER_STACK).add(1) } as u64;
    driver_system
        .create_thread(timer_thread as usize as u64, stack_top)
        .unwrap_or_else(|_| crate::blue_screen!("timer thread would not start"));

    // SAFETY: This thread is now the secure half of the pair
    let mut port = unsafe { SvcPort::new() };
    // SAFETY: The slice covers the mapping established above
    let guest_ram = unsafe {
        core::slice::from_raw_parts_mut(GUEST_RAM_VA as *mut u32, (GUEST_RAM_SIZE / 4) as usize)
    };

    let mut next_pc = 0;
    loop {
        let frame = port.switch_to_partner(next_pc);
        next_pc = GUEST_LOCK.with(|| {
            // SAFETY: The lock serialises all access to the guest state
            let guest = unsafe { &mut *core::ptr::addr_of_mut!(GUEST) };
            let resume = handle_trap(&mut port, &mut guest.devices, guest_ram, frame);
            // Lines raised by the helpers reach the guest before it runs
            guest.devices.irq.sync(&mut port);
            resume
        });
    }
}

/// The emulated interrupt bank, for drivers that feed the guest device
/// lines of their own (the block-storage completion line, say).
pub fn trigger_guest_irq(n: u32) {
    let supervisor = GUEST_LOCK.with(|| {
        // SAFETY: The lock serialises all access to the guest state
        let guest = unsafe { &mut *core::ptr::addr_of_mut!(GUEST) };
        guest.devices.irq.trigger_deferred(n);
        guest.supervisor
    });
    if supervisor != 0 {
        client::wake_thread(supervisor);
    }
}

// The bank is what the helpers reach for; re-export it where they look.
pub use irq::IrqBank;
