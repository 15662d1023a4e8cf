//! End-to-end traces through the kernel core: the gate, lock and
//! inter-map call machinery driven together, the way the drivers use
//! them.
#![feature(custom_test_frameworks)]
#![no_main]
#![no_std]
#![reexport_test_harness_main = "test_main"]
#![test_runner(isambard::test_runner)]

use isambard::{
    add_test,
    kernel::{
        interface::{system_service, Interface, SYSTEM_MAP},
        per_core::Core,
        svc::{handle_svc, Svc, SPSR_V},
        system::SystemRequest,
        thread::{list, ThreadCode, THREAD_WAITING},
        KernelState,
    },
};

#[no_mangle]
fn kernel_main() {
    test_main()
}

/// A fresh kernel with a system thread at the head of the runnable list.
///
/// Each expansion owns its statics: the state is far larger than the
/// stack the test runner borrows, and every test wants a clean boot.
macro_rules! booted_kernel {
    () => {{
        static mut STATE: KernelState = KernelState::new();
        static mut CORE: Core = Core::new();
        // SAFETY: Each expansion is reached by exactly one test, once
        let (state, core) = unsafe {
            (
                &mut *core::ptr::addr_of_mut!(STATE),
                &mut *core::ptr::addr_of_mut!(CORE),
            )
        };
        core.loaded_map = SYSTEM_MAP;
        state.interfaces.grow(32);
        let thread = state.threads.allocate().unwrap();
        state.threads.initialise_new_thread(thread);
        state.threads.context_mut(thread).current_map = SYSTEM_MAP;
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, thread);
        (state, core, thread)
    }};
}

/// Issues one SVC on behalf of `thread`.
fn svc(state: &mut KernelState, core: &mut Core, thread: ThreadCode, call: Svc) -> ThreadCode {
    handle_svc(state, core, thread, call as u32).now
}

add_test!(threads_created_by_the_system_driver_ping_pong_on_a_gate, {
    let (state, core, system) = booted_kernel!();

    // The system driver creates a worker.
    let context = state.threads.context_mut(system);
    context.regs[0] = SystemRequest::CreateThread as u64;
    context.regs[1] = 0x4000;
    context.regs[2] = 0x1_0000;
    let worker = svc(state, core, system, Svc::SystemRequest);
    assert_ne!(worker, system);

    // The worker waits on its gate; control falls back to the system
    // thread.
    let context = state.threads.context_mut(worker);
    context.regs[0] = 0;
    context.regs[1] = 0;
    let now = svc(state, core, worker, Svc::Gate);
    assert_eq!(now, system);
    assert_eq!(state.threads.context(worker).gate, THREAD_WAITING);

    // The system thread wakes it: both sides observe zero.
    state.threads.context_mut(system).regs[0] = worker.register();
    let now = svc(state, core, system, Svc::Gate);
    assert_eq!(now, system);
    assert_eq!(state.threads.context(worker).regs[0], 0);
    assert_eq!(state.threads.context(system).regs[0], 0);
    assert_eq!(state.threads.context(worker).gate, 0);
});

add_test!(capability_calls_reach_the_provider_and_return, {
    let (state, core, thread) = booted_kernel!();

    // A second map, provided by the system driver's dispatcher, and a
    // capability into it minted for the system map.
    let provider_map = state
        .interfaces
        .mint(SYSTEM_MAP, SYSTEM_MAP, system_service::MAP, 0)
        .unwrap();
    *state.interfaces.get_mut(provider_map) = Interface {
        user: provider_map,
        provider: SYSTEM_MAP,
        handler: system_service::MAP,
        object: 0,
    };
    let cap = state
        .interfaces
        .mint(SYSTEM_MAP, provider_map, 0x9000, 0xcafe)
        .unwrap();

    let context = state.threads.context_mut(thread);
    context.pc = 0x2000;
    context.sp = 0x3000;
    context.regs[0] = cap.register();
    context.regs[1] = 1;
    context.regs[2] = 2;
    context.regs[3] = 3;

    svc(state, core, thread, Svc::Call);
    let context = state.threads.context(thread);
    assert_eq!(context.pc, 0x9000);
    assert_eq!(context.current_map, provider_map);
    assert_eq!(context.regs[0], 0xcafe);
    assert_eq!((context.regs[1], context.regs[2], context.regs[3]), (1, 2, 3));

    state.threads.context_mut(thread).regs[0] = 0x77;
    svc(state, core, thread, Svc::Return);
    let context = state.threads.context(thread);
    assert_eq!(context.pc, 0x2000);
    assert_eq!(context.sp, 0x3000);
    assert_eq!(context.current_map, SYSTEM_MAP);
    assert_eq!(context.regs[0], 0x77);
    assert_eq!(context.spsr & SPSR_V, 0);
});

add_test!(yield_round_robins_three_threads, {
    let (state, core, first) = booted_kernel!();
    let mut threads = [first; 3];
    for slot in threads.iter_mut().skip(1) {
        let code = state.threads.allocate().unwrap();
        state.threads.initialise_new_thread(code);
        state.threads.context_mut(code).current_map = SYSTEM_MAP;
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, code);
        *slot = code;
    }

    let mut running = first;
    for expected in [threads[1], threads[2], threads[0], threads[1]] {
        running = svc(state, core, running, Svc::Yield);
        assert_eq!(running, expected);
        assert_eq!(core.runnable, Some(expected));
    }
});
