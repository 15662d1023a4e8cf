//! The per-core cooperative scheduler and the gate primitive.
//!
//! Each core keeps a circular runnable list whose head is the running
//! thread. Everything here runs with exceptions masked on the owning core;
//! threads never migrate, so no cross-core synchronisation is needed.
//!
//! A *gate* is a per-thread signed counter. `wait_until_woken` returns
//! * `> 0` if wakes were already pending (the drained count),
//! * `= 0` if the thread blocked and was then woken,
//! * `< 0` if the wait timed out.
//!
//! Blocked threads with a timeout sit in a delta-encoded queue: each
//! member's `regs[1]` holds the ticks to wait *after* its predecessor
//! expires. Queue membership borrows `regs[16]` (marker) and `regs[17]`
//! (next thread code); a thread that called `wait_until_woken` does not
//! expect those registers to be preserved.
use super::{
    error::Fault,
    interface::SYSTEM_MAP,
    per_core::Core,
    thread::{ThreadArena, ThreadCode, ThreadSwitch, THREAD_WAITING},
};
use crate::blue_screen;

/// The gate saturates here; anything beyond is certainly an error, or an
/// attack.
const GATE_SATURATION: i32 = 0x7fff_ffff;

/// Rotates the runnable list. Returns the switch; the calling thread's
/// `x0` reports whether any other thread was runnable.
pub fn yield_thread(arena: &mut ThreadArena, core: &mut Core, thread: ThreadCode) -> ThreadSwitch {
    let mut result = ThreadSwitch::stay(thread);
    let next = arena.context(thread).next;
    if next != thread.raw() {
        let Some(next) = ThreadCode::from_raw(next) else {
            blue_screen!("corrupt runnable list");
        };
        arena.context_mut(thread).regs[0] = 1;
        result.now = next;
        core.runnable = Some(next);
    } else {
        arena.context_mut(thread).regs[0] = 0;
    }
    result
}

/// The gate SVC: `x0 == 0` waits (with `x1` as a tick timeout, zero for
/// forever), `x0 != 0` wakes the named thread.
///
/// The interrupt thread's wait doubles as the timer tick.
pub fn gate(
    arena: &mut ThreadArena,
    core: &mut Core,
    thread: ThreadCode,
) -> Result<ThreadSwitch, Fault> {
    let request = arena.context(thread).regs[0];
    if request == 0 {
        Ok(wait_until_woken(arena, core, thread))
    } else {
        wake_thread(arena, core, thread, request).map(|()| ThreadSwitch::stay(thread))
    }
}

fn wait_until_woken(arena: &mut ThreadArena, core: &mut Core, thread: ThreadCode) -> ThreadSwitch {
    let mut result = ThreadSwitch::stay(thread);

    if core.interrupt_thread == Some(thread) {
        timer_tick(arena, core, thread);
        return result;
    }

    let gate = arena.context(thread).gate;
    if gate > 0 {
        let context = arena.context_mut(thread);
        context.regs[0] = gate as u64;
        context.gate = 0;
        return result;
    }

    // Block: rotate to the next runnable thread and leave the list.
    let next = arena.context(thread).next;
    if next == thread.raw() {
        blue_screen!("last runnable thread tried to wait");
    }
    let Some(next) = ThreadCode::from_raw(next) else {
        blue_screen!("corrupt runnable list");
    };
    result.now = next;
    core.runnable = Some(next);
    arena.remove(&mut core.runnable, thread);

    let timeout = arena.context(thread).regs[1];
    let context = arena.context_mut(thread);
    context.gate = THREAD_WAITING;
    context.regs[0] = 0; // The return value when finally woken

    if timeout > 0 {
        enqueue_timeout(arena, core, thread, timeout);
    } else {
        let context = arena.context_mut(thread);
        context.regs[16] = 0;
        context.regs[17] = 0;
    }

    result
}

/// Inserts into the delta queue, ordered by deadline.
fn enqueue_timeout(arena: &mut ThreadArena, core: &mut Core, thread: ThreadCode, ticks: u64) {
    let mut remaining = ticks;
    let mut previous: Option<ThreadCode> = None;
    let mut cursor = core.blocked_with_timeout;

    while let Some(current) = cursor {
        let delta = arena.context(current).regs[1];
        if remaining <= delta {
            break;
        }
        remaining -= delta;
        previous = Some(current);
        cursor = ThreadCode::from_raw(arena.context(current).regs[17] as u32);
    }

    let context = arena.context_mut(thread);
    context.regs[1] = remaining;
    context.regs[16] = 1; // In the timeout queue
    context.regs[17] = cursor.map_or(0, ThreadCode::register);

    match previous {
        None => core.blocked_with_timeout = Some(thread),
        Some(previous) => arena.context_mut(previous).regs[17] = thread.register(),
    }

    if let Some(follower) = cursor {
        // The follower waits that much less once this thread expires.
        arena.context_mut(follower).regs[1] -= remaining;
    }
}

/// Unlinks a woken thread from the delta queue, giving its remaining ticks
/// to the next waiter.
fn dequeue_timeout(arena: &mut ThreadArena, core: &mut Core, thread: ThreadCode) {
    let next = ThreadCode::from_raw(arena.context(thread).regs[17] as u32);
    let remaining = arena.context(thread).regs[1];

    let mut previous: Option<ThreadCode> = None;
    let mut cursor = core.blocked_with_timeout;
    while let Some(current) = cursor {
        if current == thread {
            break;
        }
        previous = Some(current);
        cursor = ThreadCode::from_raw(arena.context(current).regs[17] as u32);
    }
    if cursor.is_none() {
        blue_screen!("thread {} marked queued but not found", thread.raw());
    }

    match previous {
        None => core.blocked_with_timeout = next,
        Some(previous) => {
            arena.context_mut(previous).regs[17] = next.map_or(0, ThreadCode::register);
        }
    }
    if let Some(next) = next {
        arena.context_mut(next).regs[1] += remaining;
    }
    let context = arena.context_mut(thread);
    context.regs[16] = 0;
    context.regs[17] = 0;
}

/// One timer tick, delivered by the designated interrupt thread. The queue
/// head loses a tick; every thread whose delta reaches zero resumes with a
/// negative return value.
fn timer_tick(arena: &mut ThreadArena, core: &mut Core, interrupt_thread: ThreadCode) {
    if arena.context(interrupt_thread).current_map != SYSTEM_MAP {
        blue_screen!("interrupt thread outside the system map tried to tick");
    }

    let Some(head) = core.blocked_with_timeout else {
        return;
    };
    let delta = arena.context(head).regs[1];
    arena.context_mut(head).regs[1] = delta.wrapping_sub(1);
    if delta != 1 {
        return;
    }

    // Splice every zero-reaching thread back into the runnable list,
    // directly after the interrupt thread.
    let mut cursor = Some(head);
    while let Some(expired) = cursor {
        if arena.context(expired).regs[1] != 0 {
            break;
        }
        let next = ThreadCode::from_raw(arena.context(expired).regs[17] as u32);
        let context = arena.context_mut(expired);
        context.regs[0] = -1_i64 as u64; // Timed out
        context.gate = 0;
        context.regs[16] = 0;
        context.regs[17] = 0;
        arena.insert_after(expired, interrupt_thread);
        cursor = next;
    }
    core.blocked_with_timeout = cursor;
}

/// Wakes the thread named by `code`: releases it if it is waiting,
/// otherwise banks the wake in its gate (saturating).
fn wake_thread(
    arena: &mut ThreadArena,
    core: &mut Core,
    thread: ThreadCode,
    code: u64,
) -> Result<(), Fault> {
    if !arena.is_real_thread(code) {
        blue_screen!("wake of invalid thread code {code:#x}");
    }
    let Some(release) = ThreadCode::from_raw(code as u32) else {
        blue_screen!("wake of null thread");
    };

    if arena.context(release).gate == THREAD_WAITING {
        if arena.context(thread).current_map != arena.context(release).current_map {
            return Err(Fault::PermissionDenied);
        }
        arena.insert_after(release, thread);
        arena.context_mut(release).gate = 0;
        if arena.context(release).regs[16] != 0 {
            dequeue_timeout(arena, core, release);
        }
        arena.context_mut(thread).regs[0] = 0;
    } else {
        let previous = arena.context(release).gate;
        if previous < GATE_SATURATION {
            arena.context_mut(release).gate = previous + 1;
        }
        arena.context_mut(thread).regs[0] = previous as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{
        interface::SYSTEM_MAP,
        per_core::Core,
        thread::{list, ThreadArena, ThreadCode, THREAD_WAITING},
    };
    use super::{gate, yield_thread};
    use crate::add_test;

    /// A core with `count` runnable threads in the system map.
    fn scheduler_with(
        count: usize,
    ) -> (&'static mut ThreadArena, &'static mut Core, [ThreadCode; 4]) {
        let (state, core) = crate::kernel::testing::fixture();
        let arena = &mut state.threads;
        let mut codes = [ThreadCode::from_raw(1).unwrap(); 4];
        for slot in codes.iter_mut().take(count) {
            let code = arena.allocate().unwrap();
            arena.initialise_new_thread(code);
            arena.context_mut(code).current_map = SYSTEM_MAP;
            arena.insert_at_tail(&mut core.runnable, list::RUNNABLE, code);
            *slot = code;
        }
        (arena, core, codes)
    }

    add_test!(yield_rotates_the_runnable_list, {
        let (arena, core, [a, b, _, _]) = scheduler_with(2);
        let switch = yield_thread(arena, core, a);
        assert_eq!(switch.now, b);
        assert_eq!(core.runnable, Some(b));
        assert_eq!(arena.context(a).regs[0], 1);
    });

    add_test!(yield_alone_reports_no_switch, {
        let (arena, core, [a, _, _, _]) = scheduler_with(1);
        let switch = yield_thread(arena, core, a);
        assert_eq!(switch.now, a);
        assert_eq!(arena.context(a).regs[0], 0);
    });

    add_test!(gate_ping_pong, {
        let (arena, core, [a, b, _, _]) = scheduler_with(2);

        // A waits forever; the scheduler moves on to B.
        arena.context_mut(a).regs[0] = 0;
        arena.context_mut(a).regs[1] = 0;
        let switch = gate(arena, core, a).unwrap();
        assert_eq!(switch.now, b);
        assert_eq!(arena.context(a).gate, THREAD_WAITING);

        // B wakes A: A rejoins the list after B, both return zero.
        arena.context_mut(b).regs[0] = a.register();
        let switch = gate(arena, core, b).unwrap();
        assert_eq!(switch.now, b);
        assert_eq!(arena.context(a).gate, 0);
        assert_eq!(arena.context(a).regs[0], 0);
        assert_eq!(arena.context(b).regs[0], 0);
        assert_eq!(arena.context(b).next, a.raw());
    });

    add_test!(pending_wakes_drain_without_blocking, {
        let (arena, core, [a, b, _, _]) = scheduler_with(2);

        // Two wakes before A waits.
        for _ in 0..2 {
            arena.context_mut(b).regs[0] = a.register();
            gate(arena, core, b).unwrap();
        }
        assert_eq!(arena.context(a).gate, 2);
        assert_eq!(arena.context(b).regs[0], 1); // Previous gate value

        arena.context_mut(a).regs[0] = 0;
        let switch = gate(arena, core, a).unwrap();
        assert_eq!(switch.now, a); // Never blocked
        assert_eq!(arena.context(a).regs[0], 2);
        assert_eq!(arena.context(a).gate, 0);
    });

    add_test!(waking_across_maps_is_denied, {
        let (arena, core, [a, b, _, _]) = scheduler_with(2);
        arena.context_mut(a).regs[0] = 0;
        arena.context_mut(a).regs[1] = 0;
        gate(arena, core, a).unwrap();

        arena.context_mut(b).current_map = super::super::interface::MEMORY_ALLOCATOR_MAP;
        arena.context_mut(b).regs[0] = a.register();
        assert!(gate(arena, core, b).is_err());
    });

    add_test!(timeouts_expire_in_deadline_order, {
        let (arena, core, [a, b, c, interrupt]) = scheduler_with(4);
        core.interrupt_thread = Some(interrupt);

        // a waits 3 ticks, b waits 1, c waits 2: queue becomes b(1) c(1) a(1)
        for (thread, ticks) in [(a, 3), (b, 1), (c, 2)] {
            arena.context_mut(thread).regs[0] = 0;
            arena.context_mut(thread).regs[1] = ticks;
            gate(arena, core, thread).unwrap();
        }
        assert_eq!(core.blocked_with_timeout, Some(b));
        assert_eq!(arena.context(b).regs[1], 1);
        assert_eq!(arena.context(c).regs[1], 1);
        assert_eq!(arena.context(a).regs[1], 1);

        let tick = |arena: &mut ThreadArena, core: &mut Core| {
            arena.context_mut(interrupt).regs[0] = 0;
            gate(arena, core, interrupt).unwrap();
        };

        tick(arena, core);
        assert_eq!(arena.context(b).gate, 0);
        assert_eq!(arena.context(b).regs[0], -1_i64 as u64);
        assert_eq!(core.blocked_with_timeout, Some(c));

        tick(arena, core);
        assert_eq!(core.blocked_with_timeout, Some(a));
        tick(arena, core);
        assert_eq!(core.blocked_with_timeout, None);
        assert_eq!(arena.context(a).regs[0], -1_i64 as u64);
    });

    add_test!(the_gate_saturates, {
        let (arena, core, [a, b, _, _]) = scheduler_with(2);
        arena.context_mut(a).gate = 0x7fff_fffe;

        arena.context_mut(b).regs[0] = a.register();
        gate(arena, core, b).unwrap();
        assert_eq!(arena.context(a).gate, 0x7fff_ffff);

        // Further wakes are dropped at the cap.
        arena.context_mut(b).regs[0] = a.register();
        gate(arena, core, b).unwrap();
        assert_eq!(arena.context(a).gate, 0x7fff_ffff);
    });

    add_test!(waking_a_queued_thread_returns_its_ticks, {
        let (arena, core, [a, b, waker, _]) = scheduler_with(3);

        arena.context_mut(a).regs[0] = 0;
        arena.context_mut(a).regs[1] = 2;
        gate(arena, core, a).unwrap();
        arena.context_mut(b).regs[0] = 0;
        arena.context_mut(b).regs[1] = 5;
        gate(arena, core, b).unwrap();
        // Queue: a(2), b(3)
        assert_eq!(arena.context(b).regs[1], 3);

        arena.context_mut(waker).regs[0] = a.register();
        gate(arena, core, waker).unwrap();
        // B inherits A's remaining ticks and heads the queue.
        assert_eq!(core.blocked_with_timeout, Some(b));
        assert_eq!(arena.context(b).regs[1], 5);
        assert_eq!(arena.context(a).regs[16], 0);
        assert_eq!(arena.context(a).regs[0], 0);
    });
}
