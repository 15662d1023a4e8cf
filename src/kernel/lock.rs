//! The user/kernel cooperative lock.
//!
//! A lock is a 64-bit word in user memory: the low half holds the owning
//! thread code, the high half the head of the waiter list, zero means
//! unlocked. Userspace takes and releases an uncontended lock with a single
//! CAS; it enters the kernel only on contention (`Lock_Wait`, with the lock
//! address in x17 and its own code in x18) or when waiters exist on release
//! (`Lock_Release`).
//!
//! Waiters form a circular list through their scheduling links, with each
//! waiter's `regs[17]` still holding the lock address; the kernel treats a
//! mismatch there as a corrupted lock and gives up on the core.
//!
//! Sharing boundary: a lock word must not be shared across maps, nor
//! across cores. The kernel side relies on the exception mask for atomicity
//! against its own userspace and takes only the current core's state; there
//! is no cross-core arbitration here, by construction of the API.
use super::{
    error::Fault,
    per_core::Core,
    thread::{list, ThreadArena, ThreadCode, ThreadSwitch},
};
use crate::{
    architecture::{exclusive, machine},
    blue_screen,
};
use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;

/// The packed lock word.
#[bitfield(u64)]
pub struct LockWord {
    /// The owning thread, zero when unlocked
    #[bits(32)]
    pub owner: u32,
    /// Head of the waiter list, zero when uncontended
    #[bits(32)]
    pub waiters: u32,
}

// The word is shared with the userspace fast path; the layout is ABI.
const_assert_eq!(core::mem::size_of::<LockWord>(), 8);

/// `Lock_Wait`: the caller found the lock taken. Acquire it if it has been
/// released in the meantime, otherwise join the waiter list and run
/// someone else.
pub fn lock_wait(
    arena: &mut ThreadArena,
    core: &mut Core,
    thread: ThreadCode,
    lock: *mut u64,
) -> ThreadSwitch {
    let mut result = ThreadSwitch::stay(thread);
    let tid = thread.register();
    // Fake list head for the waiter list; its head is published in the
    // lock word's high half.
    let mut blocked: Option<ThreadCode> = None;

    loop {
        // SAFETY: The SVC shell verified the address is user-writable in
        // the calling map
        let value = LockWord::from(unsafe { exclusive::load_exclusive_doubleword(lock) });

        if u64::from(value) == 0 {
            // SAFETY: As above
            if !unsafe { exclusive::store_exclusive_doubleword(lock, tid) } {
                continue;
            }
            if result.now != thread {
                // We blocked ourselves on an earlier pass, but the owner
                // released the lock believing nobody was waiting. We now
                // own it: unblock.
                if blocked != Some(thread) {
                    blue_screen!("lock waiter list lost its head");
                }
                result.now = thread;
                arena.remove(&mut blocked, thread);
                arena.insert_as_head(&mut core.runnable, list::RUNNABLE, thread);
            }
            break;
        }

        if value.owner() as u64 == tid && value.waiters() == 0 {
            // Re-entry is illegal but tolerated.
            exclusive::clear_exclusive();
            break;
        }

        if result.now != thread {
            blue_screen!("lock wait blocked twice");
        }

        if !arena.is_real_thread(value.owner().into()) {
            blue_screen!("lock owner {:#x} is not a thread", value.owner());
        }
        if value.waiters() != 0 && !arena.is_real_thread(value.waiters().into()) {
            blue_screen!("lock waiter head {:#x} is not a thread", value.waiters());
        }

        let next = arena.context(thread).next;
        if next == thread.raw() {
            blue_screen!("last runnable thread blocked on a lock");
        }
        result.now = ThreadCode::from_raw(next).unwrap_or_else(|| {
            blue_screen!("corrupt runnable list");
        });
        core.runnable = Some(result.now);
        arena.remove(&mut core.runnable, thread);

        match ThreadCode::from_raw(value.waiters()) {
            None => {
                blocked = None;
                arena.insert_as_head(&mut blocked, list::LOCK_WAITERS, thread);
                let with_waiter = value.with_waiters(thread.raw());
                // SAFETY: As above
                if unsafe { exclusive::store_exclusive_doubleword(lock, with_waiter.into()) } {
                    break;
                }
                // The word changed under us; try again from the top. We
                // stay off the runnable list until the outcome is known.
            }
            Some(first) => {
                // An existing waiter list: the lock word does not change.
                exclusive::clear_exclusive();
                if arena.context(first).regs[17] != lock as u64 {
                    blue_screen!("waiter list threaded through a different lock");
                }
                blocked = Some(first);
                arena.insert_at_tail(&mut blocked, list::LOCK_WAITERS, thread);
                break;
            }
        }
    }

    machine::dsb_sy();
    result
}

/// `Lock_Release`: the caller holds the lock and waiters exist. Hand the
/// lock to the head waiter and let it run.
pub fn lock_release(
    arena: &mut ThreadArena,
    core: &mut Core,
    thread: ThreadCode,
    lock: *mut u64,
) -> Result<ThreadSwitch, Fault> {
    let mut result = ThreadSwitch::stay(thread);

    // Exceptions are masked and the lock is not shared across cores:
    // nothing can write the word while we work on it.
    // SAFETY: The SVC shell verified the address is user-writable
    let value = LockWord::from(unsafe { lock.read_volatile() });

    if value.owner() as u64 != thread.register() {
        // Includes releasing an unlocked lock.
        return Err(Fault::PermissionDenied);
    }

    let mut new_value = LockWord::new().with_owner(value.waiters());

    if let Some(first) = ThreadCode::from_raw(value.waiters()) {
        // An interrupt between userspace's ldxr and stxr can leave a
        // release with no waiters in here; the list walk below copes.
        if !arena.is_real_thread(value.waiters().into()) {
            blue_screen!("lock waiter head {:#x} is not a thread", value.waiters());
        }
        if arena.context(first).regs[17] != lock as u64 {
            blue_screen!("waiter list threaded through a different lock");
        }

        let second = arena.context(first).next;
        if second != first.raw() {
            let mut blocked = Some(first);
            arena.remove(&mut blocked, first);
            let Some(new_head) = blocked else {
                blue_screen!("waiter list lost its members");
            };
            new_value = new_value.with_waiters(new_head.raw());
        }

        // The newly unblocked thread gets a go
        result.now = first;
        arena.insert_as_head(&mut core.runnable, list::RUNNABLE, first);
    }

    // SAFETY: As above
    unsafe { lock.write_volatile(new_value.into()) };
    machine::dsb_sy();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::super::{
        interface::SYSTEM_MAP,
        per_core::Core,
        thread::{list, ThreadArena, ThreadCode},
    };
    use super::{lock_release, lock_wait, LockWord};
    use crate::add_test;

    fn scheduler_with(
        count: usize,
    ) -> (&'static mut ThreadArena, &'static mut Core, [ThreadCode; 5]) {
        let (state, core) = crate::kernel::testing::fixture();
        let arena = &mut state.threads;
        let mut codes = [ThreadCode::from_raw(1).unwrap(); 5];
        for slot in codes.iter_mut().take(count) {
            let code = arena.allocate().unwrap();
            arena.initialise_new_thread(code);
            arena.context_mut(code).current_map = SYSTEM_MAP;
            arena.insert_at_tail(&mut core.runnable, list::RUNNABLE, code);
            *slot = code;
        }
        (arena, core, codes)
    }

    /// Takes the lock the way the userspace fast path would.
    fn fast_acquire(lock: &mut u64, owner: ThreadCode) {
        assert_eq!(*lock, 0);
        *lock = owner.register();
    }

    add_test!(contended_lock_queues_waiters_in_order, {
        let (arena, core, [l, m, n, _, _]) = scheduler_with(3);
        let mut lock: u64 = 0;

        fast_acquire(&mut lock, l);

        // M contends: blocks, lock word gains a waiter head.
        arena.context_mut(m).regs[17] = core::ptr::addr_of_mut!(lock) as u64;
        core.runnable = Some(m);
        let switch = lock_wait(arena, core, m, &mut lock);
        assert_ne!(switch.now, m);
        let word = LockWord::from(lock);
        assert_eq!(word.owner(), l.raw());
        assert_eq!(word.waiters(), m.raw());

        // N contends: joins the tail, word unchanged.
        arena.context_mut(n).regs[17] = core::ptr::addr_of_mut!(lock) as u64;
        core.runnable = Some(n);
        let switch = lock_wait(arena, core, n, &mut lock);
        assert_ne!(switch.now, n);
        assert_eq!(LockWord::from(lock).waiters(), m.raw());
        assert_eq!(arena.context(m).next, n.raw());

        // L releases: M owns, N heads the waiter chain, M heads runnable.
        core.runnable = Some(l);
        let switch = lock_release(arena, core, l, &mut lock).unwrap();
        assert_eq!(switch.now, m);
        assert_eq!(core.runnable, Some(m));
        let word = LockWord::from(lock);
        assert_eq!(word.owner(), m.raw());
        assert_eq!(word.waiters(), n.raw());

        // M releases: N owns alone, word high half clears.
        let switch = lock_release(arena, core, m, &mut lock).unwrap();
        assert_eq!(switch.now, n);
        let word = LockWord::from(lock);
        assert_eq!(word.owner(), n.raw());
        assert_eq!(word.waiters(), 0);

        // N releases with nobody waiting: the word clears entirely.
        lock_release(arena, core, n, &mut lock).unwrap();
        assert_eq!(lock, 0);
    });

    add_test!(releasing_anothers_lock_is_denied, {
        let (arena, core, [l, m, _, _, _]) = scheduler_with(2);
        let mut lock: u64 = 0;
        fast_acquire(&mut lock, l);
        assert!(lock_release(arena, core, m, &mut lock).is_err());
        assert!(lock_release(arena, core, m, &mut 0u64).is_err());
    });

    add_test!(reentry_is_tolerated, {
        let (arena, core, [l, _, _, _, _]) = scheduler_with(1);
        let mut lock: u64 = 0;
        fast_acquire(&mut lock, l);
        let switch = lock_wait(arena, core, l, &mut lock);
        assert_eq!(switch.now, l);
        assert_eq!(LockWord::from(lock).owner(), l.raw());
    });

    add_test!(release_during_wait_hands_over_the_lock, {
        // The lock is released between userspace's failed CAS and the
        // kernel's ldxr: the waiter must acquire directly.
        let (arena, core, [l, m, _, _, _]) = scheduler_with(2);
        let mut lock: u64 = 0;
        let _ = l;
        arena.context_mut(m).regs[17] = core::ptr::addr_of_mut!(lock) as u64;
        core.runnable = Some(m);
        let switch = lock_wait(arena, core, m, &mut lock);
        assert_eq!(switch.now, m);
        assert_eq!(LockWord::from(lock).owner(), m.raw());
    });
}
