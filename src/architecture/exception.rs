//! Secure-EL1 exception handling.
//!
//! The vector stubs in `vectors.s` save the interrupted thread's full
//! register file into its context and call into [`sel1_sync`] or
//! [`sel1_irq`] with the core and context as arguments. The dispatcher
//! returns a `{now, then}` pair; the exit assembly publishes `now` as the
//! running thread, reloads its context and `eret`s. When `now` belongs to
//! the non-secure world the exit path issues `SMC #0` instead, handing the
//! register reload to the EL3 trampoline.
use crate::{
    blue_screen,
    kernel::{
        map,
        per_core::Core,
        svc,
        thread::{list, ThreadCode, ThreadContext, ThreadSlot, ThreadSwitch},
        KernelState,
    },
};
use aarch64_cpu::registers::{ESR_EL1, FAR_EL1, VBAR_EL1};
use core::arch::global_asm;
use core::mem::offset_of;
use tock_registers::interfaces::{Readable, Writeable};

global_asm!(
    include_str!("vectors.s"),
    sync = sym sel1_sync,
    irq = sym sel1_irq,
    unreachable = sym sel1_unreachable,
    regs_off = const offset_of!(ThreadContext, regs),
    sp_off = const offset_of!(ThreadContext, sp),
    pc_off = const offset_of!(ThreadContext, pc),
    spsr_off = const offset_of!(ThreadContext, spsr),
    partner_off = const offset_of!(ThreadContext, partner_slot),
    slot_size = const core::mem::size_of::<ThreadSlot>(),
);

extern "C" {
    static _vbar_sel1: core::cell::UnsafeCell<()>;
    fn _el1_enter_thread(slot: *mut ThreadSlot) -> !;
}

/// The raw form of a [`ThreadSwitch`], as the exit assembly consumes it:
/// slot addresses in x0/x1.
#[repr(C)]
pub struct RawSwitch {
    now: *mut ThreadSlot,
    then: *mut ThreadSlot,
}

/// Ready exception handling by setting the exception vector base address
/// register.
pub fn per_core_init() {
    VBAR_EL1.set(
        // SAFETY: the vector table is defined in vectors.s
        unsafe { core::ptr::addr_of!(_vbar_sel1) } as u64,
    );
    aarch64_cpu::asm::barrier::isb(aarch64_cpu::asm::barrier::SY);
}

/// The core the current stack pointer belongs to.
fn core_from_pair(core: *mut Core) -> &'static mut Core {
    // SAFETY: The pointer pair always carries this core's block
    unsafe { &mut *core }
}

fn thread_code(state: &KernelState, context: *mut ThreadContext) -> ThreadCode {
    let Some(code) = state.threads.code_of_context(context) else {
        blue_screen!("exception in unknown thread context");
    };
    code
}

/// The thread the current core last dispatched, for diagnostics.
pub fn current_thread(_state: &KernelState) -> Option<ThreadCode> {
    let core = super::boot::try_current_core()?;
    core.runnable
}

/// Converts a handler's verdict into the raw form, loading the incoming
/// thread's map on the way out.
fn depart(state: &mut KernelState, core: &mut Core, switch: ThreadSwitch) -> RawSwitch {
    if switch.now != switch.then {
        let now_map = state.threads.context(switch.now).current_map;
        if core.loaded_map != now_map {
            map::load_this_map(state, core, now_map);
        }
    }
    RawSwitch {
        now: state.threads.slot_address(switch.now).cast_mut(),
        then: state.threads.slot_address(switch.then).cast_mut(),
    }
}

/// Synchronous exceptions from EL0: SVCs and demand faults.
extern "C" fn sel1_sync(core: *mut Core, context: *mut ThreadContext) -> RawSwitch {
    let core = core_from_pair(core);
    // SAFETY: Exceptions are masked; this core owns the kernel right now
    let state = unsafe { crate::kernel::state() };
    let thread = thread_code(state, context);

    let esr = ESR_EL1.get();
    let class = (esr >> 26) & 0x3f;

    let switch = match class {
        // SVC from AArch64
        0b010101 => svc::handle_svc(state, core, thread, (esr & 0xffff) as u32),
        // Instruction or data abort from a lower EL: demand fault
        0b100000 | 0b100100 => {
            let fault_address = FAR_EL1.get();
            let current = state.threads.context(thread).current_map;
            match map::find_and_map(state, core, current, fault_address) {
                map::DemandFault::Mapped => ThreadSwitch::stay(thread),
                map::DemandFault::NoBacking => {
                    // No VMB covers it: unnamed exception, V set, the
                    // map's own supervisor sorts it out.
                    state.threads.context_mut(thread).spsr |= svc::SPSR_V;
                    ThreadSwitch::stay(thread)
                }
            }
        }
        _ => blue_screen!("unhandled exception class {class:#x} (esr {esr:#x})"),
    };

    depart(state, core, switch)
}

/// IRQ or FIQ from EL0: schedule the core's interrupt dispatcher.
extern "C" fn sel1_irq(core: *mut Core, context: *mut ThreadContext) -> RawSwitch {
    let core = core_from_pair(core);
    // SAFETY: Exceptions are masked; this core owns the kernel right now
    let state = unsafe { crate::kernel::state() };
    let thread = thread_code(state, context);

    let Some(dispatcher) = core.interrupt_thread else {
        blue_screen!("interrupt with no interrupt thread");
    };
    state
        .threads
        .insert_as_head(&mut core.runnable, list::RUNNABLE, dispatcher);

    depart(
        state,
        core,
        ThreadSwitch {
            now: dispatcher,
            then: thread,
        },
    )
}

/// Entries that can never legitimately fire.
extern "C" fn sel1_unreachable(_core: *mut Core, _context: *mut ThreadContext) -> RawSwitch {
    blue_screen!("exception from an unreachable vector");
}

/// Enters the first thread on this core, completing boot. The pointer
/// pair at the top of the exception stack is primed so the vector stubs
/// and the EL3 trampoline can find the core and the running thread.
///
/// # Safety
/// Boot only; the thread and its map must be fully initialised.
pub unsafe fn enter_first_thread(state: &mut KernelState, core: &mut Core, thread: ThreadCode) -> ! {
    let slot = state.threads.slot_address(thread).cast_mut();
    let self_pointer: *mut Core = core;
    core.stack_page.core = self_pointer;
    core.stack_page.runnable_slot = slot;
    let pair = core::ptr::addr_of!(core.stack_page.core) as u64;

    // SAFETY: The stack pointer moves to the top of the exception stack
    // and control transfers to the thread-entry assembly, never to return
    unsafe {
        core::arch::asm!(
            "mov sp, {pair}",
            "mov x0, {slot}",
            "b _el1_enter_thread",
            pair = in(reg) pair,
            slot = in(reg) slot,
            options(noreturn),
        );
    }
}

