//! The portable kernel core: interface table, kernel heap, thread pool,
//! scheduler, locks, maps and the SVC shell. Nothing below here contains
//! inline assembly; the architecture layer hands exceptions in as typed
//! events and receives a [`thread::ThreadSwitch`] back.

pub mod error;
pub mod heap;
pub mod init;
pub mod interface;
pub mod lock;
pub mod map;
pub mod panic;
pub mod partner;
pub mod per_core;
pub mod print;
pub mod scheduler;
pub mod svc;
pub mod system;
pub mod thread;

pub use error::Fault;

use heap::KernelHeap;
use interface::InterfaceTable;
use map::SharedSystemMap;
use thread::ThreadArena;

/// The mutable kernel state shared by every core.
///
/// Allocation paths (interface records, heap bottom, thread slots) are
/// multi-core safe through exclusive monitors; everything else is only
/// touched by the owning core with interrupts masked.
pub struct KernelState {
    pub threads: ThreadArena,
    pub interfaces: InterfaceTable,
    pub heap: KernelHeap,
    /// The shared stage-1 view of the system driver; each core copies it
    /// into its own tables when the system map loads.
    pub system_map: SharedSystemMap,
}

impl KernelState {
    pub const fn new() -> Self {
        Self {
            threads: ThreadArena::new(),
            interfaces: InterfaceTable::new(),
            heap: KernelHeap::empty(),
            system_map: SharedSystemMap::new(),
        }
    }

    /// Returns the state to its boot condition, in place.
    #[cfg(test)]
    pub fn reset(&mut self) {
        self.threads.reset();
        self.interfaces.reset();
        self.heap = KernelHeap::empty();
        self.system_map = SharedSystemMap::new();
    }
}

/// Test fixtures. A `KernelState` and a `Core` are far larger than the
/// exception stack the test runner borrows, so tests work on statics,
/// reset between runs; the custom test framework runs them sequentially.
#[cfg(test)]
pub mod testing {
    use super::{per_core::Core, KernelState};

    pub fn fixture() -> (&'static mut KernelState, &'static mut Core) {
        static mut STATE: KernelState = KernelState::new();
        static mut CORE: Core = Core::new();
        // SAFETY: Tests run one at a time, on one core
        unsafe {
            let state = &mut *core::ptr::addr_of_mut!(STATE);
            let core = &mut *core::ptr::addr_of_mut!(CORE);
            state.reset();
            core.reset();
            (state, core)
        }
    }
}

/// The kernel state of the running system.
static mut KERNEL: KernelState = KernelState::new();

/// The live kernel state.
///
/// # Safety
/// The caller must be a single-core kernel path (exceptions masked), or the
/// boot sequence before secondary cores are released. Allocation paths
/// within are additionally guarded by exclusive monitors.
pub unsafe fn state() -> &'static mut KernelState {
    // SAFETY: By assumption, access is serialised per the rules above
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) }
}
