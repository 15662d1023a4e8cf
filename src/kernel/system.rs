//! The system-driver protocol: operations behind the `SystemRequest` SVC,
//! reachable only from threads in the system map.
//!
//! The system driver is trusted; it is responsible for serialising the
//! shared-map operations across cores. Violations of the protocol are
//! kernel-fatal, not errors: nothing else should ever reach this code.
use super::{
    init, map, partner,
    per_core::Core,
    thread::{self, list, ThreadCode, ThreadSwitch},
    KernelState,
};
use crate::blue_screen;
use core::sync::atomic::{AtomicUsize, Ordering};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Services provided by the kernel only to the system driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u64)]
pub enum SystemRequest {
    /// Identify the thread that will run when a normal interrupt occurs
    SetInterruptThread = 1,
    /// Identify a device page to be mapped into the system map (e.g. to
    /// access a GIC, timer, or GPIO)
    AddDevicePage = 2,
    /// Re-load the system map that has been updated on another core
    UpdatedMap = 3,
    CreateMap = 4,
    NextDriver = 5,
    ReadInterface = 6,
    ReadHeap = 7,
    WriteHeap = 8,
    AllocateHeap = 9,
    FreeHeap = 10,
    ReleaseThread = 12,
    ThreadMakePartner = 16,
    CreateThread = 18,
    /// Grow the frame store of every caller parked on the needs-stack
    /// list and make them runnable again
    GrowCallStacks = 19,
}

/// Dispatches one system request; the operation is in x0, arguments
/// follow in x1..x3.
pub fn system_driver_request(
    state: &mut KernelState,
    core: &mut Core,
    thread: ThreadCode,
) -> ThreadSwitch {
    let mut result = ThreadSwitch::stay(thread);
    let context = state.threads.context(thread);
    let (op, x1, x2, x3) = (
        context.regs[0],
        context.regs[1],
        context.regs[2],
        context.regs[3],
    );

    let Some(op) = SystemRequest::from_u64(op) else {
        blue_screen!("unknown system request {op:#x}");
    };

    match op {
        SystemRequest::SetInterruptThread => {
            match core.interrupt_thread {
                Some(existing) if existing != thread => {
                    blue_screen!("a second interrupt thread volunteered");
                }
                Some(_) => (),
                None => {
                    core.interrupt_thread = Some(thread);
                    // IRQs stay masked while it runs; FIQs do not.
                    state.threads.context_mut(thread).spsr |= 0x80;
                }
            }
            // The dispatcher parks until the first interrupt.
            let next = state.threads.context(thread).next;
            if next == thread.raw() {
                blue_screen!("interrupt thread is the only runnable thread");
            }
            result.now = ThreadCode::from_raw(next).unwrap_or_else(|| {
                blue_screen!("corrupt runnable list");
            });
            core.runnable = Some(result.now);
            state.threads.remove(&mut core.runnable, thread);
        }
        SystemRequest::AddDevicePage => {
            // Only affects the calling core's live tables; other cores
            // pick the page up through `UpdatedMap`.
            let mapped = state.system_map.add_device_page(core, x1, x2);
            state.threads.context_mut(thread).regs[0] = mapped;
        }
        SystemRequest::UpdatedMap => {
            state.system_map.refresh(core);
        }
        SystemRequest::CreateMap => {
            let caller = state
                .threads
                .context(thread)
                .top_frame(&state.heap)
                .caller_map;
            let provider = state.threads.context(thread).current_map;
            let index = state
                .interfaces
                .mint(caller, provider, x1, x2)
                .unwrap_or_else(|_| {
                    blue_screen!("out of interfaces during CreateMap");
                });
            state.threads.context_mut(thread).regs[0] = index.register();
        }
        SystemRequest::NextDriver => {
            // Hands the driver table out one entry at a time, across
            // however many cores are initialising.
            static NEXT_DRIVER: AtomicUsize = AtomicUsize::new(0);
            let index = NEXT_DRIVER.fetch_add(1, Ordering::Relaxed);
            let context = state.threads.context_mut(thread);
            match init::driver_table().get(index) {
                Some(driver) => {
                    if driver.end != driver.start + ((driver.code_pages + driver.data_pages) << 12)
                    {
                        blue_screen!("driver table entry {index} is inconsistent");
                    }
                    context.regs[0] = driver.start;
                    context.regs[1] = driver.code_pages;
                    context.regs[2] = driver.data_pages;
                }
                None => context.regs[0] = 0,
            }
        }
        SystemRequest::ReadInterface => {
            let Some(index) = state.interfaces.lookup(x1) else {
                blue_screen!("ReadInterface of invalid index {x1:#x}");
            };
            let object = state.interfaces.get(index).object;
            state.threads.context_mut(thread).regs[0] = object;
        }
        SystemRequest::ReadHeap => {
            state.heap.read(x1, x2, x3 as *mut u8);
        }
        SystemRequest::WriteHeap => {
            state.heap.write(x1, x2, x3 as *const u8);
        }
        SystemRequest::AllocateHeap => {
            let offset = state.heap.allocate(x1);
            state.threads.context_mut(thread).regs[0] = offset.into();
        }
        SystemRequest::FreeHeap => {
            state.heap.free(x1, x2);
        }
        SystemRequest::ReleaseThread => {
            // The system driver retires the calling thread; its slot goes
            // to the core's recycling list.
            result.now = super::init::thread_exit(state, core, thread);
        }
        SystemRequest::GrowCallStacks => {
            // Each parked caller's inter-map call already stands
            // complete; a doubled frame store is all it waits for. It
            // resumes behind the system thread, mid-call, none the
            // wiser.
            while let Some(parked) = core.needs_stack {
                let mut head = core.needs_stack;
                state.threads.remove(&mut head, parked);
                core.needs_stack = head;
                thread::grow_call_stack(state, parked);
                state.threads.insert_after(parked, thread);
            }
        }
        SystemRequest::ThreadMakePartner => {
            let (Some(secure), Some(non_secure)) = (
                ThreadCode::from_raw(x1 as u32),
                ThreadCode::from_raw(x2 as u32),
            ) else {
                blue_screen!("make partner of the null thread");
            };
            if !state.threads.is_real_thread(x1) || !state.threads.is_real_thread(x2) {
                blue_screen!("make partner of invalid thread codes");
            }
            partner::make_partner(state, secure, non_secure, x3);
        }
        SystemRequest::CreateThread => {
            if x2 & 0xf != 0 {
                blue_screen!("new thread stack pointer {x2:#x} unaligned");
            }
            let new_thread = allocate_thread(state, core);
            state.threads.initialise_new_thread(new_thread);
            let caller_map = state
                .threads
                .context(thread)
                .top_frame(&state.heap)
                .caller_map;
            let new_context = state.threads.context_mut(new_thread);
            new_context.current_map = caller_map;
            new_context.pc = x1;
            new_context.sp = x2;
            new_context.spsr = 0;
            state.threads.context_mut(thread).regs[0] = new_thread.register();
            // Run the new thread until it blocks, then the caller resumes.
            result.now = new_thread;
            state
                .threads
                .insert_as_head(&mut core.runnable, list::RUNNABLE, new_thread);
        }
    }

    if result.now != thread {
        let now_map = state.threads.context(result.now).current_map;
        let then_map = state.threads.context(thread).current_map;
        if now_map != then_map {
            map::change_map(state, core, result.now, now_map);
        }
    }

    result
}

/// Recycles a finished thread if one is waiting, otherwise takes a fresh
/// slot from the arena.
fn allocate_thread(state: &mut KernelState, core: &mut Core) -> ThreadCode {
    if let Some(finished) = core.finished_threads {
        let mut head = core.finished_threads;
        state.threads.remove(&mut head, finished);
        core.finished_threads = head;
        return finished;
    }
    state.threads.allocate().unwrap_or_else(|| {
        blue_screen!("thread arena exhausted");
    })
}

#[cfg(test)]
mod tests {
    use super::super::{
        interface::SYSTEM_MAP,
        per_core::Core,
        svc::{handle_svc, Svc},
        thread::{list, ThreadCode},
        KernelState,
    };
    use super::SystemRequest;
    use crate::add_test;

    fn system_thread() -> (&'static mut KernelState, &'static mut Core, ThreadCode) {
        let (state, core) = crate::kernel::testing::fixture();
        core.loaded_map = SYSTEM_MAP;
        let thread = state.threads.allocate().unwrap();
        state.threads.initialise_new_thread(thread);
        state.threads.context_mut(thread).current_map = SYSTEM_MAP;
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, thread);
        (state, core, thread)
    }

    add_test!(create_thread_runs_the_child_first, {
        let (state, core, thread) = system_thread();
        let context = state.threads.context_mut(thread);
        context.regs[0] = SystemRequest::CreateThread as u64;
        context.regs[1] = 0x4000; // pc
        context.regs[2] = 0x8000; // sp

        let switch = handle_svc(state, core, thread, Svc::SystemRequest as u32);
        let child = ThreadCode::from_raw(state.threads.context(thread).regs[0] as u32).unwrap();
        assert_eq!(switch.now, child);
        assert_eq!(core.runnable, Some(child));
        let child_context = state.threads.context(child);
        assert_eq!(child_context.pc, 0x4000);
        assert_eq!(child_context.sp, 0x8000);
        assert_eq!(child_context.current_map, SYSTEM_MAP);
    });

    add_test!(interrupt_thread_parks_until_needed, {
        let (state, core, thread) = system_thread();
        let other = state.threads.allocate().unwrap();
        state.threads.initialise_new_thread(other);
        state.threads.context_mut(other).current_map = SYSTEM_MAP;
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, other);

        state.threads.context_mut(thread).regs[0] =
            SystemRequest::SetInterruptThread as u64;
        let switch = handle_svc(state, core, thread, Svc::SystemRequest as u32);
        assert_eq!(switch.now, other);
        assert_eq!(core.interrupt_thread, Some(thread));
        assert_ne!(state.threads.context(thread).spsr & 0x80, 0);
        // Off the runnable list, self-linked.
        assert_eq!(state.threads.context(thread).next, thread.raw());
    });
}
