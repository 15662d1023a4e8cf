//! The SVC shell: decodes syscall numbers, enforces the capability rules,
//! and drives the inter-map call stack.
//!
//! The numbers are ABI, shared with every driver binary; see the
//! userspace stubs, which place a capability index in x0 and issue
//! `svc 0xf009` to invoke it.
use super::{
    error::Fault,
    interface::{system_service, InterfaceIndex, PHYSICAL_ADDRESS_OF, SYSTEM_MAP},
    lock, map, partner,
    per_core::Core,
    scheduler, system,
    thread::{list, CallFrame, ThreadArena, ThreadCode, ThreadSwitch},
    KernelState,
};
use crate::{architecture::machine, blue_screen};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// The syscall numbers. Part of the ABI: the values appear in every
/// driver's SVC stubs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Svc {
    /// Clean and invalidate the data caches; used around DMA and guest
    /// hand-off.
    CacheMaintenance = 0x0000,
    /// `wait_until_woken` / `wake_thread`
    Gate = 0xf001,
    DuplicateToReturn = 0xf002,
    DuplicateToPass = 0xf003,
    InterfaceToReturn = 0xf004,
    InterfaceToPass = 0xf005,
    LockWait = 0xf006,
    LockRelease = 0xf007,
    Yield = 0xf008,
    Call = 0xf009,
    Return = 0xf00a,
    /// Like `Return`, but with the V flag set in the caller's PSTATE
    Exception = 0xf00b,
    SwitchToPartner = 0xf00c,
    GetPartnerRegister = 0xf00d,
    SetPartnerRegister = 0xf00e,
    ChangeVmSystemRegister = 0xf00f,
    /// Only usable by the system driver
    SystemRequest = 0xf010,
}

/// The V flag in a saved PSTATE: error returns travel through it.
pub const SPSR_V: u64 = 1 << 28;

/// Reports a fault to the calling thread: V set, code in x0.
pub fn fail(arena: &mut ThreadArena, thread: ThreadCode, fault: Fault) {
    let context = arena.context_mut(thread);
    context.spsr |= SPSR_V;
    context.regs[0] = fault.code();
}

/// Dispatches one SVC. Returns which thread should run next; the caller
/// loads that thread's map if it differs.
pub fn handle_svc(
    state: &mut KernelState,
    core: &mut Core,
    thread: ThreadCode,
    number: u32,
) -> ThreadSwitch {
    let result = ThreadSwitch::stay(thread);

    let Some(call) = Svc::from_u32(number) else {
        blue_screen!("unknown svc {number:#x}");
    };

    match call {
        Svc::CacheMaintenance => {
            machine::invalidate_all_caches();
            result
        }
        Svc::Gate => match scheduler::gate(&mut state.threads, core, thread) {
            Ok(switch) => switch,
            Err(fault) => {
                fail(&mut state.threads, thread, fault);
                result
            }
        },
        Svc::DuplicateToReturn => {
            derive(state, thread, |state, thread| {
                let source = checked_interface(state, thread, 0)?;
                let record = *state.interfaces.get(source);
                let caller = state
                    .threads
                    .context(thread)
                    .top_frame(&state.heap)
                    .caller_map;
                state
                    .interfaces
                    .mint(caller, record.provider, record.handler, record.object)
            });
            result
        }
        Svc::DuplicateToPass => {
            derive(state, thread, |state, thread| {
                let source = checked_interface(state, thread, 1)?;
                let target = checked_interface(state, thread, 0)?;
                let record = *state.interfaces.get(source);
                let target_provider = state.interfaces.get(target).provider;
                state.interfaces.mint(
                    target_provider,
                    record.provider,
                    record.handler,
                    record.object,
                )
            });
            result
        }
        Svc::InterfaceToReturn => {
            derive(state, thread, |state, thread| {
                let context = state.threads.context(thread);
                let caller = context.top_frame(&state.heap).caller_map;
                let provider = context.current_map;
                let (handler, object) = (context.regs[0], context.regs[1]);
                state.interfaces.mint(caller, provider, handler, object)
            });
            result
        }
        Svc::InterfaceToPass => {
            derive(state, thread, |state, thread| {
                let target = checked_interface(state, thread, 0)?;
                let context = state.threads.context(thread);
                let provider = context.current_map;
                let (handler, object) = (context.regs[1], context.regs[2]);
                let user = state.interfaces.get(target).provider;
                state.interfaces.mint(user, provider, handler, object)
            });
            result
        }
        Svc::LockWait => match checked_lock_address(&mut state.threads, thread) {
            Some(lock_address) => {
                lock::lock_wait(&mut state.threads, core, thread, lock_address)
            }
            None => result,
        },
        Svc::LockRelease => match checked_lock_address(&mut state.threads, thread) {
            Some(lock_address) => {
                match lock::lock_release(&mut state.threads, core, thread, lock_address) {
                    Ok(switch) => switch,
                    Err(fault) => {
                        fail(&mut state.threads, thread, fault);
                        result
                    }
                }
            }
            None => result,
        },
        Svc::Yield => scheduler::yield_thread(&mut state.threads, core, thread),
        Svc::Call => inter_map_call(state, core, thread),
        Svc::Return => inter_map_return(state, core, thread, false),
        Svc::Exception => inter_map_return(state, core, thread, true),
        Svc::SwitchToPartner => partner::switch_to_partner(&mut state.threads, core, thread),
        Svc::GetPartnerRegister => {
            let index = state.threads.context(thread).regs[0];
            let value = partner::get_partner_register(&mut state.threads, thread, index);
            state.threads.context_mut(thread).regs[0] = value;
            result
        }
        Svc::SetPartnerRegister => {
            let context = state.threads.context(thread);
            let (index, value) = (context.regs[0], context.regs[1]);
            partner::set_partner_register(&mut state.threads, thread, index, value);
            result
        }
        Svc::ChangeVmSystemRegister => {
            let context = state.threads.context(thread);
            let (index, value, write) = (context.regs[0], context.regs[1], context.regs[2] != 0);
            let previous =
                partner::change_vm_system_register(&mut state.threads, thread, index, value, write);
            state.threads.context_mut(thread).regs[0] = previous;
            result
        }
        Svc::SystemRequest => {
            if state.threads.context(thread).current_map != SYSTEM_MAP {
                blue_screen!("system request from map outside the system driver");
            }
            system::system_driver_request(state, core, thread)
        }
    }
}

/// Runs a capability-derivation body and reports its outcome in x0 or the
/// V flag.
fn derive(
    state: &mut KernelState,
    thread: ThreadCode,
    body: impl FnOnce(&mut KernelState, ThreadCode) -> Result<InterfaceIndex, Fault>,
) {
    match body(state, thread) {
        Ok(index) => state.threads.context_mut(thread).regs[0] = index.register(),
        Err(fault) => fail(&mut state.threads, thread, fault),
    }
}

/// Looks up the interface named in the given register, requiring the
/// caller's map to be its user.
fn checked_interface(
    state: &KernelState,
    thread: ThreadCode,
    register: usize,
) -> Result<InterfaceIndex, Fault> {
    let raw = state.threads.context(thread).regs[register];
    let Some(index) = state.interfaces.lookup(raw) else {
        blue_screen!("invalid interface index {raw:#x}");
    };
    if state.interfaces.get(index).user != state.threads.context(thread).current_map {
        return Err(Fault::PermissionDenied);
    }
    Ok(index)
}

/// Validates the lock-SVC register contract: x17 a user-writable address,
/// x18 the caller's own code.
fn checked_lock_address(arena: &mut ThreadArena, thread: ThreadCode) -> Option<*mut u64> {
    let context = arena.context(thread);
    let (lock_address, claimed) = (context.regs[17], context.regs[18]);
    if claimed != thread.register() {
        blue_screen!("thread code forged in x18");
    }
    if !machine::address_is_user_writable(lock_address) {
        fail(arena, thread, Fault::BadAddress);
        return None;
    }
    Some(lock_address as *mut u64)
}

/// `Call`: invokes the capability in x0 with arguments in x1..x3.
fn inter_map_call(state: &mut KernelState, core: &mut Core, thread: ThreadCode) -> ThreadSwitch {
    let mut result = ThreadSwitch::stay(thread);

    if state.threads.context(thread).regs[18] != thread.register() {
        blue_screen!("thread code forged in x18");
    }

    let raw = state.threads.context(thread).regs[0];
    let Some(index) = state.interfaces.lookup(raw) else {
        blue_screen!("call through invalid interface {raw:#x}");
    };
    let record = *state.interfaces.get(index);

    if record.provider == SYSTEM_MAP && record.handler == system_service::MAP {
        let method = state.threads.context(thread).regs[1];
        if method == PHYSICAL_ADDRESS_OF {
            // The one inlined method: translation needs EL1 context that
            // userspace lacks. Note: it faults for non-writable addresses.
            let va = state.threads.context(thread).regs[2];
            let pa = machine::user_physical_address(va).or_else(|| {
                let current = state.threads.context(thread).current_map;
                match map::find_and_map(state, core, current, va) {
                    map::DemandFault::Mapped => machine::user_physical_address(va),
                    map::DemandFault::NoBacking => None,
                }
            });
            let Some(pa) = pa else {
                blue_screen!("physical address of unmapped {va:#x}");
            };
            state.threads.context_mut(thread).regs[0] = pa;
            return result;
        }
    }

    if record.user != state.threads.context(thread).current_map {
        fail(&mut state.threads, thread, Fault::PermissionDenied);
        return result;
    }

    let context = state.threads.context_mut(thread);
    context.regs[0] = record.object;

    if context.call_stack_pointer == 0 {
        blue_screen!("inter-map call stack underflow");
    }
    context.call_stack_pointer -= 1;
    let frame_index = context.call_stack_pointer;
    let frame = CallFrame::new(context.sp, context.pc, context.current_map);
    let current = context.current_map;
    state
        .threads
        .context_mut(thread)
        .set_frame(&state.heap, frame_index, frame);

    if record.provider != current {
        map::change_map(state, core, thread, record.provider);
    }
    state.threads.context_mut(thread).pc = record.handler;

    if frame_index <= 1 {
        // One frame from the bottom. The call stands complete, but the
        // caller parks until the system driver grows its frame store;
        // it cannot observe the wait.
        let next = state.threads.context(thread).next;
        if next == thread.raw() {
            blue_screen!("call stack full with nothing else to run");
        }
        let Some(next) = ThreadCode::from_raw(next) else {
            blue_screen!("corrupt runnable list");
        };
        core.runnable = Some(next);
        state.threads.remove(&mut core.runnable, thread);
        let mut needs_stack = core.needs_stack;
        state
            .threads
            .insert_at_tail(&mut needs_stack, list::NEEDS_STACK, thread);
        core.needs_stack = needs_stack;
        result.now = next;
    }

    result
}

/// `Return` / `Exception`: pops the inter-map frame and restores the
/// caller's world, with the V flag reporting which path was taken.
fn inter_map_return(
    state: &mut KernelState,
    core: &mut Core,
    thread: ThreadCode,
    exceptional: bool,
) -> ThreadSwitch {
    let result = ThreadSwitch::stay(thread);

    let context = state.threads.context(thread);
    if context.call_stack_pointer >= context.call_stack_capacity {
        blue_screen!("inter-map return with no caller");
    }
    let frame = context.top_frame(&state.heap);
    let caller_map = frame.caller_map;
    let current = context.current_map;

    let context = state.threads.context_mut(thread);
    context.pc = frame.caller_return_address;
    context.sp = frame.caller_sp;
    context.call_stack_pointer += 1;
    if exceptional {
        context.spsr |= SPSR_V;
    } else {
        context.spsr &= !SPSR_V;
    }

    if current != caller_map {
        map::change_map(state, core, thread, caller_map);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::super::{
        interface::{Interface, SYSTEM_MAP},
        per_core::Core,
        system::SystemRequest,
        thread::{list, ThreadCode, CALL_STACK_DEPTH},
        KernelState,
    };
    use super::{handle_svc, Svc, SPSR_V};
    use crate::add_test;

    /// A state with two maps (3 and 4), a capability from 3 to 4, and one
    /// thread running in map 3.
    fn call_fixture() -> (&'static mut KernelState, &'static mut Core, ThreadCode, u32) {
        let (state, core) = crate::kernel::testing::fixture();
        state.interfaces.grow(16);
        let caller_map = state.interfaces.obtain().unwrap();
        let provider_map = state.interfaces.obtain().unwrap();
        *state.interfaces.get_mut(caller_map) = Interface {
            user: caller_map,
            provider: SYSTEM_MAP,
            handler: super::system_service::MAP,
            object: 0,
        };
        *state.interfaces.get_mut(provider_map) = Interface {
            user: provider_map,
            provider: SYSTEM_MAP,
            handler: super::system_service::MAP,
            object: 0,
        };
        let cap = state
            .interfaces
            .mint(caller_map, provider_map, 0x7000, 0xdead_beef)
            .unwrap();

        let thread = state.threads.allocate().unwrap();
        state.threads.initialise_new_thread(thread);
        state.threads.context_mut(thread).current_map = caller_map;
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, thread);
        core.loaded_map = caller_map;
        (state, core, thread, cap.raw())
    }

    add_test!(call_and_return_restore_the_caller_exactly, {
        let (state, core, thread, cap) = call_fixture();

        let context = state.threads.context_mut(thread);
        context.pc = 0x1000;
        context.sp = 0x9000;
        context.regs[0] = cap.into();
        context.regs[1] = 11;
        context.regs[2] = 22;
        context.regs[3] = 33;
        let depth_before = context.call_stack_pointer;

        let switch = handle_svc(state, core, thread, Svc::Call as u32);
        assert_eq!(switch.now, thread);

        let context = state.threads.context(thread);
        assert_eq!(context.pc, 0x7000);
        assert_eq!(context.regs[0], 0xdead_beef);
        assert_eq!((context.regs[1], context.regs[2], context.regs[3]), (11, 22, 33));
        assert_eq!(context.call_stack_pointer, depth_before - 1);

        // Return hands back a single word and restores sp, pc, map.
        let context = state.threads.context_mut(thread);
        context.regs[0] = 99;
        handle_svc(state, core, thread, Svc::Return as u32);
        let context = state.threads.context(thread);
        assert_eq!(context.pc, 0x1000);
        assert_eq!(context.sp, 0x9000);
        assert_eq!(context.regs[0], 99);
        assert_eq!(context.call_stack_pointer, depth_before);
        assert_eq!(context.spsr & SPSR_V, 0);
    });

    add_test!(calling_anothers_capability_is_denied, {
        let (state, core, thread, cap) = call_fixture();
        // Move the thread to a map that is not the capability's user.
        state.threads.context_mut(thread).current_map = SYSTEM_MAP;
        core.loaded_map = SYSTEM_MAP;
        state.threads.context_mut(thread).regs[0] = cap.into();

        handle_svc(state, core, thread, Svc::Call as u32);
        let context = state.threads.context(thread);
        assert_ne!(context.spsr & SPSR_V, 0);
    });

    add_test!(exception_return_sets_the_v_flag, {
        let (state, core, thread, cap) = call_fixture();
        state.threads.context_mut(thread).regs[0] = cap.into();
        handle_svc(state, core, thread, Svc::Call as u32);

        state.threads.context_mut(thread).regs[0] = 7;
        handle_svc(state, core, thread, Svc::Exception as u32);
        let context = state.threads.context(thread);
        assert_ne!(context.spsr & SPSR_V, 0);
        assert_eq!(context.regs[0], 7);
    });

    add_test!(derived_return_capability_names_the_caller, {
        let (state, core, thread, cap) = call_fixture();
        let caller_map = state.threads.context(thread).current_map;
        state.threads.context_mut(thread).regs[0] = cap.into();
        handle_svc(state, core, thread, Svc::Call as u32);

        // In the provider: mint a capability for the caller to use later.
        let context = state.threads.context_mut(thread);
        context.regs[0] = 0x5000; // Handler
        context.regs[1] = 42; // Object
        handle_svc(state, core, thread, Svc::InterfaceToReturn as u32);
        let minted = state.threads.context(thread).regs[0];
        let index = state.interfaces.lookup(minted).unwrap();
        let record = *state.interfaces.get(index);
        assert_eq!(record.user, caller_map);
        assert_eq!(record.handler, 0x5000);
        assert_eq!(record.object, 42);
    });

    add_test!(deep_call_chains_park_on_the_stack_list, {
        let (state, core, thread, cap) = call_fixture();
        // A second runnable thread to take over when the caller parks.
        let other = state.threads.allocate().unwrap();
        state.threads.initialise_new_thread(other);
        state.threads.context_mut(other).current_map =
            state.threads.context(thread).current_map;
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, other);

        // Burn frames until one from the bottom.
        let mut parked = None;
        for _ in 0..CALL_STACK_DEPTH {
            let context = state.threads.context_mut(thread);
            context.regs[0] = cap.into();
            // Make user checks pass from the provider map too.
            let current = context.current_map;
            let cap_index = state.interfaces.lookup(cap.into()).unwrap();
            state.interfaces.get_mut(cap_index).user = current;
            let switch = handle_svc(state, core, thread, Svc::Call as u32);
            if switch.now != thread {
                parked = Some(switch.now);
                break;
            }
        }
        assert_eq!(parked, Some(other));
        assert_eq!(core.needs_stack, Some(thread));
    });

    add_test!(parked_callers_resume_once_stacks_grow, {
        let (state, core, thread, cap) = call_fixture();
        // The heap backs the grown frame stores.
        #[repr(align(16))]
        struct Backing([u8; 1024]);
        static mut BACKING: Backing = Backing([0; 1024]);
        // SAFETY: The backing store belongs to this test alone
        unsafe {
            state.heap.init(core::ptr::addr_of_mut!(BACKING).cast(), 1024);
        }

        // The system thread that will answer the stack shortage.
        let system = state.threads.allocate().unwrap();
        state.threads.initialise_new_thread(system);
        state.threads.context_mut(system).current_map = SYSTEM_MAP;
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, system);

        let (outer_pc, outer_sp) = (0x1000, 0x9000);
        {
            let context = state.threads.context_mut(thread);
            context.pc = outer_pc;
            context.sp = outer_sp;
        }

        // Burn frames until the caller parks.
        let mut calls = 0;
        loop {
            let context = state.threads.context_mut(thread);
            context.regs[0] = cap.into();
            // Make user checks pass from the provider map too.
            let current = context.current_map;
            let cap_index = state.interfaces.lookup(cap.into()).unwrap();
            state.interfaces.get_mut(cap_index).user = current;
            calls += 1;
            let switch = handle_svc(state, core, thread, Svc::Call as u32);
            if switch.now != thread {
                break;
            }
        }
        assert_eq!(core.needs_stack, Some(thread));
        // The parked call itself stands complete: the thread will resume
        // at the handler, in the provider's map.
        assert_eq!(state.threads.context(thread).pc, 0x7000);

        // The system driver grows the parked stacks.
        state.threads.context_mut(system).regs[0] = SystemRequest::GrowCallStacks as u64;
        handle_svc(state, core, system, Svc::SystemRequest as u32);

        assert_eq!(core.needs_stack, None);
        // Back on the runnable list behind the system thread, with a
        // doubled, heap-backed frame store.
        assert_eq!(state.threads.context(system).next, thread.raw());
        let context = state.threads.context(thread);
        assert_eq!(context.list, list::RUNNABLE);
        assert_eq!(context.call_stack_capacity, 2 * CALL_STACK_DEPTH as u32);
        assert_ne!(context.heap_stack_lsr4, 0);

        // The resumed caller can go deeper without parking again...
        state.threads.context_mut(thread).regs[0] = cap.into();
        let switch = handle_svc(state, core, thread, Svc::Call as u32);
        assert_eq!(switch.now, thread);
        calls += 1;

        // ...and the whole chain unwinds to the outermost frame exactly.
        for _ in 0..calls {
            handle_svc(state, core, thread, Svc::Return as u32);
        }
        let context = state.threads.context(thread);
        assert_eq!(context.pc, outer_pc);
        assert_eq!(context.sp, outer_sp);
        assert_eq!(context.call_stack_pointer, context.call_stack_capacity - 1);
    });
}
