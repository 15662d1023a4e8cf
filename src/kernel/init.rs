//! Secure-EL1 initialisation: one core builds the kernel state and the
//! driver maps, every core then loads its first map and enters its first
//! thread.
//!
//! All mutation of the boot structures happens inside [`initialise`],
//! exactly once, before any secondary core is released; afterwards the
//! driver table and the special interfaces are read-only.
use super::{
    interface::{system_service, Interface, MEMORY_ALLOCATOR_MAP, SYSTEM_MAP},
    map,
    per_core::Core,
    thread::{list, ThreadCode},
    KernelState,
};
use crate::{architecture, blue_screen, board, call_once, log};
use core::sync::atomic::{AtomicBool, Ordering};

/// One entry of the driver table baked into the kernel binary.
#[derive(Clone, Copy, Debug)]
pub struct DriverInfo {
    /// Physical load address of the driver's code
    pub start: u64,
    pub code_pages: u64,
    pub data_pages: u64,
    /// One past the last byte of the image; checked against the page
    /// counts at boot
    pub end: u64,
}

impl DriverInfo {
    const fn new(start: u64, code_pages: u64, data_pages: u64) -> Self {
        Self {
            start,
            code_pages,
            data_pages,
            end: start + ((code_pages + data_pages) << 12),
        }
    }

    /// Where the driver's writable data begins.
    pub const fn data_start(&self) -> u64 {
        self.start + (self.code_pages << 12)
    }
}

/// The driver table. The build system loads each image at its `start`
/// before the kernel gains control; entries 0 and 1 are the two standard
/// drivers backing the special maps.
static DRIVERS: [DriverInfo; 3] = [
    // The system driver: mailbox, timer, frame buffer, physical memory
    DriverInfo::new(0x0040_0000, 16, 16),
    // The physical memory allocator
    DriverInfo::new(0x0048_0000, 8, 8),
    // The partner-thread VM driver (guest supervisor)
    DriverInfo::new(0x0050_0000, 64, 64),
];

pub fn driver_table() -> &'static [DriverInfo] {
    &DRIVERS
}

/// How many system maps head the driver table.
const NUMBER_OF_SYSTEM_MAPS: usize = 2;

/// Initial VMB array capacity for each driver map.
const INITIAL_VMBS_PER_DRIVER: u32 = 8;

/// Backing store for the kernel heap, on the kernel's working pages.
const KERNEL_HEAP_SIZE: usize = 0x10000;
#[repr(align(4096))]
struct HeapBacking([u8; KERNEL_HEAP_SIZE]);
static mut HEAP_BACKING: HeapBacking = HeapBacking([0; KERNEL_HEAP_SIZE]);

/// The number of interface records threaded at boot.
const INITIAL_INTERFACES: u32 = 512;

extern "Rust" {
    /// The main sequence, once the kernel is up. Tests substitute their
    /// own.
    fn kernel_main();
}

/// Builds the kernel state: heap, interface table, special interfaces,
/// shared system map, driver maps and their first threads.
///
/// # Safety
/// Must run exactly once, on core 0, before any other core touches the
/// kernel state.
pub unsafe fn initialise(core0: &mut Core, cores: usize) {
    call_once!();

    // SAFETY: Nothing else runs yet; the backing store is used once
    let state = unsafe { super::state() };
    // SAFETY: The backing region is reserved for the heap
    unsafe {
        state.heap.init(
            core::ptr::addr_of_mut!(HEAP_BACKING).cast(),
            KERNEL_HEAP_SIZE as u32,
        );
    }

    state.interfaces.grow(INITIAL_INTERFACES);

    // The system driver's map: self-owned, dispatched by the driver
    *state.interfaces.get_mut(SYSTEM_MAP) = Interface {
        user: SYSTEM_MAP,
        provider: SYSTEM_MAP,
        handler: system_service::MAP,
        object: 0x53_5953, // "SYS"
    };

    // The memory allocator: enterable from the system map only; its code
    // is mapped above all physical memory
    *state.interfaces.get_mut(MEMORY_ALLOCATOR_MAP) = Interface {
        user: SYSTEM_MAP,
        provider: MEMORY_ALLOCATOR_MAP,
        handler: 8 << 30,
        object: 0x4d_454d, // "MEM"
    };

    state.system_map.initialise(&DRIVERS[0]);

    initialise_driver_maps(state, core0, cores);

    log!("kernel state initialised");
}

/// Creates the per-core system threads and one map + bootstrap thread per
/// driver.
fn initialise_driver_maps(state: &mut KernelState, core0: &mut Core, cores: usize) {
    // Each core gets a system-initialisation thread, entered at the
    // driver's entry point with its identity in the argument registers.
    for core_number in 0..cores {
        let Some(thread) = state.threads.allocate() else {
            blue_screen!("thread arena exhausted at boot");
        };
        state.threads.initialise_new_thread(thread);
        let context = state.threads.context_mut(thread);
        context.current_map = SYSTEM_MAP;
        context.pc = system_service::ENTER_CORE0;
        context.spsr = 0;
        context.regs[0] = SYSTEM_MAP.register();
        context.regs[1] = MEMORY_ALLOCATOR_MAP.register();
        context.regs[2] = core_number as u64;
        context.regs[3] = 12 << 20; // Start of free memory
        context.regs[4] = 256 << 20; // End of free memory

        if core_number == 0 {
            state
                .threads
                .insert_as_head(&mut core0.runnable, list::RUNNABLE, thread);
        } else {
            // SAFETY: Secondary cores are still spinning on the release
            // flag; their blocks are quiescent
            let other = unsafe { crate::architecture::machine::core_block(core_number) };
            state
                .threads
                .insert_as_head(&mut other.runnable, list::RUNNABLE, thread);
        }
    }

    for driver in DRIVERS.iter().skip(NUMBER_OF_SYSTEM_MAPS) {
        let map_index = map::create_driver_map(state, driver, INITIAL_VMBS_PER_DRIVER);

        let Some(thread) = state.threads.allocate() else {
            blue_screen!("thread arena exhausted at boot");
        };
        state.threads.initialise_new_thread(thread);
        let context = state.threads.context_mut(thread);
        context.current_map = map_index;
        context.pc = 0;
        context.spsr = 0;
        context.regs[0] = map_index.register();

        state
            .threads
            .insert_at_tail(&mut core0.runnable, list::RUNNABLE, thread);
    }
}

/// Set once core 0 has finished [`initialise`].
static INITIALISED: AtomicBool = AtomicBool::new(false);

/// The per-core entry point at secure EL1, with the MMU on. Never
/// returns: ends by entering the core's first thread.
///
/// # Safety
/// Must be called exactly once per core, from the boot path.
pub unsafe fn secure_el1_entry(core: &mut Core) -> ! {
    use aarch64_cpu::asm::{sev, wfe};

    let self_pointer: *mut Core = core;
    core.stack_page.core = self_pointer;

    if core.core_number == 0 {
        // SAFETY: First core, first call
        unsafe {
            board::init();
            architecture::init();
            initialise(core, crate::architecture::machine::core_count());
        }
        INITIALISED.store(true, Ordering::Release);
        sev();
    } else {
        while !INITIALISED.load(Ordering::Acquire) {
            wfe();
        }
        while core.runnable.is_none() {
            wfe();
        }
    }

    // SAFETY: Once per core
    unsafe {
        architecture::per_core_init();
    }
    if core.core_number == 0 {
        // SAFETY: Secure EL1 is fully configured and no guest has run
        unsafe {
            architecture::el3::record_secure_registers();
        }
    }

    // SAFETY: Initialisation above is complete
    let state = unsafe { super::state() };
    let Some(first) = core.runnable else {
        blue_screen!("no runnable thread at boot");
    };
    let first_map = state.threads.context(first).current_map;
    map::load_this_map(state, core, first_map);

    if core.core_number == 0 {
        // SAFETY: The build provides exactly one definition
        unsafe {
            kernel_main();
        }
    }

    // SAFETY: The thread and its map are fully initialised
    unsafe {
        architecture::exception::enter_first_thread(state, core, first);
    }
}

/// Marks the calling thread finished and recycles its slot.
pub fn thread_exit(state: &mut KernelState, core: &mut Core, thread: ThreadCode) -> ThreadCode {
    let next = state.threads.context(thread).next;
    if next == thread.raw() {
        blue_screen!("last thread exited");
    }
    let Some(next) = ThreadCode::from_raw(next) else {
        blue_screen!("corrupt runnable list");
    };
    core.runnable = Some(next);
    state.threads.remove(&mut core.runnable, thread);
    let mut finished = core.finished_threads;
    state
        .threads
        .insert_at_tail(&mut finished, list::FINISHED, thread);
    core.finished_threads = finished;
    next
}
