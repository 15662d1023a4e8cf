//! The per-core block.
//!
//! One `Core` lives in RAM behind the kernel image for each CPU, zeroed
//! before the core's Rust entry point runs. It owns the core's stage-1
//! tables, the exception stack, and the scheduling state. The last sixteen
//! bytes of the exception stack page hold the core's self-pointer and the
//! running thread's slot address: the EL2/EL3 trampolines locate both by
//! rounding the stack pointer up within its page, so the layout here is
//! load-bearing.
use super::{
    interface::{InterfaceIndex, ILLEGAL_INTERFACE},
    thread::{ThreadCode, ThreadSlot},
};
use crate::architecture::vmsa::Descriptor;
use core::mem::{offset_of, size_of};
use static_assertions::const_assert_eq;

/// Entries in a full translation table page.
pub const TABLE_ENTRIES: usize = 512;
/// Entries in the level-1 table: 16 GB of address space.
pub const L1_ENTRIES: usize = 16;

/// The last page of the core block: the exception stack, topped by the
/// `{core, running thread}` pair the trampolines rely on.
#[repr(C, align(4096))]
pub struct ExceptionStackPage {
    /// Stack for exception handling; grows down from the pointer pair
    pub stack: [u128; 255],
    /// This core's block; never changes after boot
    pub core: *mut Core,
    /// The running thread's slot; rewritten on every context switch
    pub runnable_slot: *mut ThreadSlot,
}

const_assert_eq!(size_of::<ExceptionStackPage>(), 4096);
const_assert_eq!(offset_of!(ExceptionStackPage, core), 0xff0);

/// Byte offset of the self-pointer within its page; the trampolines OR
/// this into the stack pointer to find it.
pub const STACK_PAGE_POINTER_PAIR: u64 = 0xff0;

/// Stage-1 tables owned by one core plus its scheduling state.
#[repr(C, align(4096))]
pub struct Core {
    /// The system driver's core-local stack page, mapped into the shared
    /// system map at a fixed slot
    pub system_thread_stack: [u64; TABLE_ENTRIES],
    /// 4 KB pages
    pub tt_l3: [Descriptor; TABLE_ENTRIES],
    /// 2 MB blocks or level-3 tables
    pub tt_l2: [Descriptor; TABLE_ENTRIES],
    /// 1 GB blocks or level-2 tables
    pub tt_l1: [Descriptor; L1_ENTRIES],

    pub core_number: u32,
    /// The map whose stage-1 tables are currently live on this core
    pub loaded_map: InterfaceIndex,
    /// Head of the circular runnable list; the running thread is the head.
    /// Never empty once the scheduler has started.
    pub runnable: Option<ThreadCode>,
    /// Head of the delta-encoded timeout queue
    pub blocked_with_timeout: Option<ThreadCode>,
    /// Thread that calls interrupt handlers (with IRQs masked)
    pub interrupt_thread: Option<ThreadCode>,
    /// Store of threads that have completed, for recycling
    pub finished_threads: Option<ThreadCode>,
    /// Threads parked because their inter-map call stack is full
    pub needs_stack: Option<ThreadCode>,
    /// Thread whose floating-point context is live on this core
    pub fp_owner: Option<ThreadCode>,
    /// Physical address of this block, for table descriptors and the EL3
    /// trampoline
    pub physical_address: *mut Core,

    /// Must stay last
    pub stack_page: ExceptionStackPage,
}

impl Core {
    pub const fn new() -> Self {
        Self {
            system_thread_stack: [0; TABLE_ENTRIES],
            tt_l3: [Descriptor::new(); TABLE_ENTRIES],
            tt_l2: [Descriptor::new(); TABLE_ENTRIES],
            tt_l1: [Descriptor::new(); L1_ENTRIES],
            core_number: 0,
            loaded_map: ILLEGAL_INTERFACE,
            runnable: None,
            blocked_with_timeout: None,
            interrupt_thread: None,
            finished_threads: None,
            needs_stack: None,
            fp_owner: None,
            physical_address: core::ptr::null_mut(),
            stack_page: ExceptionStackPage {
                stack: [0; 255],
                core: core::ptr::null_mut(),
                runnable_slot: core::ptr::null_mut(),
            },
        }
    }

    /// Wipes the per-core stage-1 tables; the subsequent ASID change
    /// invalidates any cached walks. Entry by entry: the exception stack
    /// is far too small for whole-table temporaries.
    pub fn clear_translation_tables(&mut self) {
        for entry in self.tt_l3.iter_mut() {
            *entry = Descriptor::new();
        }
        for entry in self.tt_l2.iter_mut() {
            *entry = Descriptor::new();
        }
        for entry in self.tt_l1.iter_mut() {
            *entry = Descriptor::new();
        }
    }

    /// Returns the block to its boot state, in place.
    #[cfg(test)]
    pub fn reset(&mut self) {
        self.clear_translation_tables();
        self.loaded_map = ILLEGAL_INTERFACE;
        self.runnable = None;
        self.blocked_with_timeout = None;
        self.interrupt_thread = None;
        self.finished_threads = None;
        self.needs_stack = None;
        self.fp_owner = None;
    }

    /// Physical address of the level-1 table, as loaded into TTBR0_EL1.
    pub fn tt_l1_physical(&self) -> u64 {
        let offset = offset_of!(Core, tt_l1) as u64;
        self.physical_address as u64 + offset
    }

    /// Physical address of a per-core table, for subtable descriptors.
    pub fn table_physical(&self, table_offset: usize) -> u64 {
        self.physical_address as u64 + table_offset as u64
    }

    pub fn tt_l2_physical(&self) -> u64 {
        self.table_physical(offset_of!(Core, tt_l2))
    }

    pub fn tt_l3_physical(&self) -> u64 {
        self.table_physical(offset_of!(Core, tt_l3))
    }

    pub fn system_stack_physical(&self) -> u64 {
        self.table_physical(offset_of!(Core, system_thread_stack))
    }
}

/// Byte offset of the pointer pair from the start of the core block, for
/// the boot assembly's initial stack pointer.
pub const POINTER_PAIR_OFFSET: usize = offset_of!(Core, stack_page) + 0xff0;
