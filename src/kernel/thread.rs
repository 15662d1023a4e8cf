//! The thread pool.
//!
//! Threads live in a fixed arena of slots; a *thread code* is the non-zero
//! arena index of a slot, and it is the only form in which threads are named
//! anywhere else in the kernel, in lock words, or in guest-visible
//! registers. The scheduling links `next`/`prev` are codes too, so every
//! traversal goes through the arena with a bounds check instead of chasing
//! raw pointers.
//!
//! Each slot carries the register context immediately followed by the
//! [`VmState`] block: the EL3 trampoline finds a non-secure thread's system
//! registers at a fixed offset from its context.
use super::{
    heap::KernelHeap,
    interface::{InterfaceIndex, SYSTEM_MAP},
    partner::VmState,
    KernelState,
};
use crate::{architecture::exclusive, blue_screen};
use core::num::NonZeroU32;

/// The capacity of the thread arena.
pub const MAX_THREADS: usize = 64;

/// The initial depth of the inter-map call stack. A thread that calls
/// deeper parks until the system driver grows its frame store onto the
/// kernel heap.
pub const CALL_STACK_DEPTH: usize = 6;

/// An opaque, non-zero handle for a thread, stable for the thread's
/// lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ThreadCode(NonZeroU32);

impl ThreadCode {
    /// Reconstructs a code from its raw register form; zero is the null
    /// thread.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }

    /// The form in which a code travels through a thread register.
    pub fn register(self) -> u64 {
        self.0.get().into()
    }
}

/// Which list a thread's links currently thread it onto.
pub mod list {
    pub const NONE: u32 = 0;
    pub const RUNNABLE: u32 = 1;
    pub const LOCK_WAITERS: u32 = 2;
    pub const FINISHED: u32 = 3;
    pub const NEEDS_STACK: u32 = 4;
}

/// One frame of the inter-map call stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct CallFrame {
    pub caller_sp: u64,
    pub caller_return_address: u64,
    pub caller_map: InterfaceIndex,
    _reserved: u32,
}

impl CallFrame {
    pub const fn new(caller_sp: u64, caller_return_address: u64, caller_map: InterfaceIndex) -> Self {
        Self {
            caller_sp,
            caller_return_address,
            caller_map,
            _reserved: 0,
        }
    }
}

/// A thread and its associated context.
///
/// The first four members (`regs`, `sp`, `pc`, `spsr`) are stored and
/// loaded by the exception vector stubs and must stay in this order;
/// `partner_slot` is read by the EL2 veneer.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ThreadContext {
    /// Integer registers x0..x30
    pub regs: [u64; 31],
    /// The thread's EL0 stack pointer
    pub sp: u64,
    pub pc: u64,
    /// Saved processor state; the V flag carries error returns
    pub spsr: u64,
    /// Physical address of the partner's slot, for the EL2 veneer.
    /// Zero when the thread has no partner.
    pub partner_slot: u64,
    /// The other-security-state thread of this VCPU pair
    pub partner: Option<ThreadCode>,
    /// Scheduling links: thread codes, valid once the thread is initialised
    pub next: u32,
    pub prev: u32,
    /// Which list the links belong to (see [`list`])
    pub list: u32,
    /// The gate counter: 0 no events, >0 pending wakes, -1 waiting
    pub gate: i32,
    /// The map this thread currently executes in
    pub current_map: InterfaceIndex,
    /// Pointer to the floating-point context; zero while the thread has not
    /// touched the FP state
    pub fp: u64,
    /// Index of the innermost occupied [`CallFrame`]
    pub call_stack_pointer: u32,
    /// How many frames the current store holds
    pub call_stack_capacity: u32,
    /// Packed heap offset of the grown frame store; zero while the
    /// inline frames below are still in use
    pub heap_stack_lsr4: u32,
    /// The initial frame store
    pub call_stack: [CallFrame; CALL_STACK_DEPTH],
}

/// The value a thread's `gate` takes while it is blocked in
/// `wait_until_woken`.
pub const THREAD_WAITING: i32 = -1;

// The exception stubs and trampolines store through these offsets.
static_assertions::const_assert_eq!(core::mem::offset_of!(ThreadContext, regs), 0);
static_assertions::const_assert_eq!(core::mem::offset_of!(ThreadContext, sp), 31 * 8);
static_assertions::const_assert_eq!(core::mem::offset_of!(ThreadContext, pc), 32 * 8);
static_assertions::const_assert_eq!(core::mem::offset_of!(ThreadContext, spsr), 33 * 8);
static_assertions::const_assert_eq!(core::mem::offset_of!(ThreadContext, partner_slot), 34 * 8);

impl ThreadContext {
    const EMPTY: Self = Self {
        regs: [0; 31],
        sp: 0,
        pc: 0,
        spsr: 0,
        partner_slot: 0,
        partner: None,
        next: 0,
        prev: 0,
        list: list::NONE,
        gate: 0,
        current_map: SYSTEM_MAP,
        fp: 0,
        call_stack_pointer: 0,
        call_stack_capacity: CALL_STACK_DEPTH as u32,
        heap_stack_lsr4: 0,
        call_stack: [CallFrame::new(0, 0, SYSTEM_MAP); CALL_STACK_DEPTH],
    };

    /// Reads one inter-map call frame, wherever the store lives.
    pub fn frame(&self, heap: &KernelHeap, index: u32) -> CallFrame {
        if index >= self.call_stack_capacity {
            blue_screen!("call frame {index} beyond the stack");
        }
        if self.heap_stack_lsr4 == 0 {
            self.call_stack[index as usize]
        } else {
            let base = heap
                .pointer_from_offset_lsr4(self.heap_stack_lsr4)
                .cast::<CallFrame>();
            // SAFETY: The cell was sized for the capacity when it grew
            unsafe { base.add(index as usize).read() }
        }
    }

    /// Writes one inter-map call frame, wherever the store lives.
    pub fn set_frame(&mut self, heap: &KernelHeap, index: u32, frame: CallFrame) {
        if index >= self.call_stack_capacity {
            blue_screen!("call frame {index} beyond the stack");
        }
        if self.heap_stack_lsr4 == 0 {
            self.call_stack[index as usize] = frame;
        } else {
            let base = heap
                .pointer_from_offset_lsr4(self.heap_stack_lsr4)
                .cast::<CallFrame>();
            // SAFETY: As for `frame`
            unsafe { base.add(index as usize).write(frame) };
        }
    }

    /// The innermost inter-map call frame.
    pub fn top_frame(&self, heap: &KernelHeap) -> CallFrame {
        self.frame(heap, self.call_stack_pointer)
    }
}

/// Doubles a thread's frame store into a fresh kernel-heap cell,
/// preserving each occupied frame's distance from the far end of the
/// stack. The previous cell, if any, is abandoned: the heap does not
/// reclaim.
pub fn grow_call_stack(state: &mut KernelState, thread: ThreadCode) {
    let (old_capacity, pointer) = {
        let context = state.threads.context(thread);
        (context.call_stack_capacity, context.call_stack_pointer)
    };
    let new_capacity = old_capacity * 2;
    let frame_size = core::mem::size_of::<CallFrame>() as u64;
    let offset = state.heap.allocate(u64::from(new_capacity) * frame_size);
    let new_lsr4 = state.heap.offset_lsr4(offset);
    let base = state
        .heap
        .pointer_from_offset_lsr4(new_lsr4)
        .cast::<CallFrame>();

    let shift = new_capacity - old_capacity;
    for index in pointer..old_capacity {
        let frame = state.threads.context(thread).frame(&state.heap, index);
        // SAFETY: The new cell was sized for `new_capacity` frames
        unsafe { base.add((index + shift) as usize).write(frame) };
    }

    let context = state.threads.context_mut(thread);
    context.heap_stack_lsr4 = new_lsr4;
    context.call_stack_capacity = new_capacity;
    context.call_stack_pointer = pointer + shift;
}

/// One arena slot: the context plus the VCPU-pair system registers that the
/// EL3 trampoline swaps. Secure threads without a partner leave `vm` idle.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct ThreadSlot {
    pub context: ThreadContext,
    pub vm: VmState,
}

impl ThreadSlot {
    const EMPTY: Self = Self {
        context: ThreadContext::EMPTY,
        vm: VmState::EMPTY,
    };
}

/// The outcome of a kernel event: which thread was running, and which
/// should run next. Equal members mean no switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadSwitch {
    pub now: ThreadCode,
    pub then: ThreadCode,
}

impl ThreadSwitch {
    /// The do-nothing switch: stay with the same thread.
    pub fn stay(thread: ThreadCode) -> Self {
        Self {
            now: thread,
            then: thread,
        }
    }
}

/// The fixed pool of thread slots.
pub struct ThreadArena {
    slots: [ThreadSlot; MAX_THREADS],
    /// Number of slots handed out so far; never shrinks. Recycling goes
    /// through each core's `finished_threads` list instead.
    allocated: u32,
}

impl ThreadArena {
    pub const fn new() -> Self {
        Self {
            slots: [ThreadSlot::EMPTY; MAX_THREADS],
            allocated: 0,
        }
    }

    /// Forgets every thread, in place.
    #[cfg(test)]
    pub fn reset(&mut self) {
        self.allocated = 0;
    }

    /// Hands out a fresh slot. Multi-core safe: creation can race between
    /// cores' `Create_Thread` requests.
    pub fn allocate(&mut self) -> Option<ThreadCode> {
        let counter: *mut u32 = &mut self.allocated;
        loop {
            // SAFETY: `counter` points into this arena
            let current = unsafe { exclusive::load_exclusive_word(counter) };
            if current as usize >= MAX_THREADS {
                exclusive::clear_exclusive();
                return None;
            }
            // SAFETY: `counter` points into this arena
            if unsafe { exclusive::store_exclusive_word(counter, current + 1) } {
                return ThreadCode::from_raw(current + 1);
            }
        }
    }

    fn index(&self, code: ThreadCode) -> usize {
        let index = code.raw() as usize - 1;
        if index >= self.allocated as usize {
            blue_screen!("invalid thread code {}", code.raw());
        }
        index
    }

    pub fn context(&self, code: ThreadCode) -> &ThreadContext {
        &self.slots[self.index(code)].context
    }

    pub fn context_mut(&mut self, code: ThreadCode) -> &mut ThreadContext {
        let index = self.index(code);
        &mut self.slots[index].context
    }

    pub fn vm_state(&self, code: ThreadCode) -> &VmState {
        &self.slots[self.index(code)].vm
    }

    pub fn vm_state_mut(&mut self, code: ThreadCode) -> &mut VmState {
        let index = self.index(code);
        &mut self.slots[index].vm
    }

    /// The address of a thread's slot, for the assembly paths.
    pub fn slot_address(&self, code: ThreadCode) -> *const ThreadSlot {
        &self.slots[self.index(code)]
    }

    /// Recovers the code of the thread whose context the exception stubs
    /// stored into.
    pub fn code_of_context(&self, context: *const ThreadContext) -> Option<ThreadCode> {
        let base = self.slots.as_ptr() as usize;
        let address = context as usize;
        if address < base {
            return None;
        }
        let offset = address - base;
        let size = core::mem::size_of::<ThreadSlot>();
        if offset % size != 0 || offset / size >= self.allocated as usize {
            return None;
        }
        ThreadCode::from_raw((offset / size) as u32 + 1)
    }

    /// Whether a value plucked from a register or lock word names a live,
    /// coherently linked thread.
    pub fn is_real_thread(&self, raw: u64) -> bool {
        let Ok(raw) = u32::try_from(raw) else {
            return false;
        };
        let Some(code) = ThreadCode::from_raw(raw) else {
            return false;
        };
        if code.raw() as usize > self.allocated as usize {
            return false;
        }
        let thread = &self.slots[code.raw() as usize - 1].context;
        let (Some(next), Some(prev)) = (
            ThreadCode::from_raw(thread.next),
            ThreadCode::from_raw(thread.prev),
        ) else {
            return false;
        };
        if next.raw() as usize > self.allocated as usize
            || prev.raw() as usize > self.allocated as usize
        {
            return false;
        }
        self.context(next).prev == code.raw() && self.context(prev).next == code.raw()
    }

    /// Brings a freshly allocated (or recycled) slot to its initial
    /// state: self-linked, no partner, gate closed, the call stack primed
    /// with a poisoned return frame into the system map.
    pub fn initialise_new_thread(&mut self, code: ThreadCode) {
        let thread = self.context_mut(code);
        thread.next = code.raw();
        thread.prev = code.raw();
        thread.list = list::NONE;
        thread.partner = None;
        thread.partner_slot = 0;
        thread.spsr = 0;
        thread.gate = 0;
        thread.fp = 0;
        thread.regs = [0; 31];
        thread.regs[18] = code.register();
        thread.call_stack_pointer = CALL_STACK_DEPTH as u32 - 1;
        thread.call_stack_capacity = CALL_STACK_DEPTH as u32;
        thread.heap_stack_lsr4 = 0;
        // Returning past the outermost frame lands on a poisoned address.
        thread.call_stack[CALL_STACK_DEPTH - 1] = CallFrame::new(0, 12, SYSTEM_MAP);
    }

    /// Links `new` into the list directly after `old`.
    pub fn insert_after(&mut self, new: ThreadCode, old: ThreadCode) {
        let old_next = self.context(old).next;
        let owner = self.context(old).list;
        let new_thread = self.context_mut(new);
        new_thread.next = old_next;
        new_thread.prev = old.raw();
        new_thread.list = owner;
        self.context_mut(old).next = new.raw();
        let Some(old_next) = ThreadCode::from_raw(old_next) else {
            blue_screen!("corrupt thread list after {}", old.raw());
        };
        self.context_mut(old_next).prev = new.raw();
    }

    /// Links `new` into the list directly before `old`.
    fn insert_before(&mut self, new: ThreadCode, old: ThreadCode) {
        let old_prev = self.context(old).prev;
        let owner = self.context(old).list;
        let new_thread = self.context_mut(new);
        new_thread.next = old.raw();
        new_thread.prev = old_prev;
        new_thread.list = owner;
        self.context_mut(old).prev = new.raw();
        let Some(old_prev) = ThreadCode::from_raw(old_prev) else {
            blue_screen!("corrupt thread list before {}", old.raw());
        };
        self.context_mut(old_prev).next = new.raw();
    }

    /// Appends to the end of a circular list (just before the head).
    pub fn insert_at_tail(&mut self, head: &mut Option<ThreadCode>, tag: u32, new: ThreadCode) {
        match *head {
            None => {
                let thread = self.context_mut(new);
                thread.next = new.raw();
                thread.prev = new.raw();
                thread.list = tag;
                *head = Some(new);
            }
            Some(old_head) => self.insert_before(new, old_head),
        }
    }

    /// Makes `new` the head of the list.
    pub fn insert_as_head(&mut self, head: &mut Option<ThreadCode>, tag: u32, new: ThreadCode) {
        self.insert_at_tail(head, tag, new);
        *head = Some(new);
    }

    /// Unlinks a thread, updating the head if it was the head, and leaves
    /// it self-linked (a thread is never without links).
    pub fn remove(&mut self, head: &mut Option<ThreadCode>, code: ThreadCode) {
        if *head == Some(code) {
            let next = self.context(code).next;
            *head = if next == code.raw() {
                None
            } else {
                ThreadCode::from_raw(next)
            };
        }
        let thread = self.context(code);
        let (next, prev) = (thread.next, thread.prev);
        let (Some(next), Some(prev)) = (ThreadCode::from_raw(next), ThreadCode::from_raw(prev))
        else {
            blue_screen!("removing unlinked thread {}", code.raw());
        };
        self.context_mut(prev).next = next.raw();
        self.context_mut(next).prev = prev.raw();
        let thread = self.context_mut(code);
        thread.next = code.raw();
        thread.prev = code.raw();
        thread.list = list::NONE;
    }

    /// Walks a circular list from its head, yielding each member once.
    pub fn list_members(
        &self,
        head: Option<ThreadCode>,
    ) -> impl Iterator<Item = ThreadCode> + '_ {
        let mut cursor = head;
        core::iter::from_fn(move || {
            let current = cursor?;
            let next = ThreadCode::from_raw(self.context(current).next);
            cursor = if next == head { None } else { next };
            Some(current)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{list, ThreadCode};
    use crate::add_test;
    use crate::kernel::KernelState;

    fn arena_with(count: usize) -> (&'static mut KernelState, [ThreadCode; 4]) {
        let (state, _) = crate::kernel::testing::fixture();
        let mut codes = [ThreadCode::from_raw(1).unwrap(); 4];
        for slot in codes.iter_mut().take(count) {
            let code = state.threads.allocate().expect("arena should not be full");
            state.threads.initialise_new_thread(code);
            *slot = code;
        }
        (state, codes)
    }

    add_test!(fresh_threads_are_self_linked, {
        let (state, [a, ..]) = arena_with(1);
        let arena = &mut state.threads;
        assert_eq!(arena.context(a).next, a.raw());
        assert_eq!(arena.context(a).prev, a.raw());
        assert_eq!(arena.context(a).regs[18], a.register());
        assert!(arena.is_real_thread(a.register()));
        assert!(!arena.is_real_thread(0));
        assert!(!arena.is_real_thread(999));
    });

    add_test!(list_insertion_keeps_order, {
        let (state, [a, b, c, _]) = arena_with(3);
        let arena = &mut state.threads;
        let mut head = None;
        arena.insert_at_tail(&mut head, list::RUNNABLE, a);
        arena.insert_at_tail(&mut head, list::RUNNABLE, b);
        arena.insert_at_tail(&mut head, list::RUNNABLE, c);
        assert_eq!(head, Some(a));
        let order: [Option<ThreadCode>; 3] = [
            Some(a),
            ThreadCode::from_raw(arena.context(a).next),
            ThreadCode::from_raw(arena.context(b).next),
        ];
        assert_eq!(order, [Some(a), Some(b), Some(c)]);
        // Circular: c links back to a
        assert_eq!(arena.context(c).next, a.raw());
    });

    add_test!(removal_relinks_and_updates_head, {
        let (state, [a, b, c, _]) = arena_with(3);
        let arena = &mut state.threads;
        let mut head = None;
        for code in [a, b, c] {
            arena.insert_at_tail(&mut head, list::RUNNABLE, code);
        }
        arena.remove(&mut head, b);
        assert_eq!(arena.context(a).next, c.raw());
        assert_eq!(arena.context(c).prev, a.raw());
        assert_eq!(arena.context(b).next, b.raw());
        arena.remove(&mut head, a);
        assert_eq!(head, Some(c));
        arena.remove(&mut head, c);
        assert_eq!(head, None);
    });

    add_test!(head_insertion_reverses, {
        let (state, [a, b, _, _]) = arena_with(2);
        let arena = &mut state.threads;
        let mut head = None;
        arena.insert_as_head(&mut head, list::RUNNABLE, a);
        arena.insert_as_head(&mut head, list::RUNNABLE, b);
        assert_eq!(head, Some(b));
        assert_eq!(arena.context(b).next, a.raw());
    });
}
