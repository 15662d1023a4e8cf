//! Partner threads: the secure side of each VCPU pair.
//!
//! A non-secure thread and its secure partner point at each other through
//! their `partner` fields and share a [`VmState`] block holding the system
//! registers that differ between the two worlds. The block sits
//! immediately after the non-secure thread's context in its arena slot,
//! where the EL3 trampoline finds it at a fixed offset.
//!
//! `switch_to_partner` only performs the bookkeeping half of a world
//! switch; the actual `SMC #0` is issued by the thread-entry assembly when
//! it notices the incoming thread belongs to the other security state.
use super::{
    per_core::Core,
    thread::{list, ThreadArena, ThreadCode, ThreadSwitch},
    KernelState,
};
use crate::{architecture::machine, blue_screen};
use static_assertions::const_assert_eq;

/// The system registers that differ between the secure and non-secure
/// execution of a VCPU pair.
///
/// Order is fixed: the EL3 trampoline stores and loads these in pairs with
/// `stp`/`ldp` at hard-coded offsets.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct VmState {
    pub mair_el1: u64,
    pub sctlr_el1: u64,

    pub tcr_el1: u64,
    /// Core-specific, in secure mode
    pub ttbr0_el1: u64,

    pub ttbr1_el1: u64,
    pub vbar_el1: u64,

    pub actlr_el1: u64,
    pub fpexc32_el2: u64,

    pub esr_el1: u64,
    pub far_el1: u64,

    pub vttbr_el2: u64,
    pub hcr_el2: u64,

    pub hstr_el2: u64,
    pub vmpidr_el2: u64,

    pub vpidr_el2: u64,
    pub vtcr_el2: u64,

    pub dacr32_el2: u64,
    pub contextidr_el1: u64,
}

/// Registers stored in a [`VmState`].
pub const VM_STATE_REGISTERS: usize = 18;

const_assert_eq!(
    core::mem::size_of::<VmState>(),
    VM_STATE_REGISTERS * core::mem::size_of::<u64>()
);

impl VmState {
    pub const EMPTY: Self = Self {
        mair_el1: 0,
        sctlr_el1: 0,
        tcr_el1: 0,
        ttbr0_el1: 0,
        ttbr1_el1: 0,
        vbar_el1: 0,
        actlr_el1: 0,
        fpexc32_el2: 0,
        esr_el1: 0,
        far_el1: 0,
        vttbr_el2: 0,
        hcr_el2: 0,
        hstr_el2: 0,
        vmpidr_el2: 0,
        vpidr_el2: 0,
        vtcr_el2: 0,
        dacr32_el2: 0,
        contextidr_el1: 0,
    };

    /// Reads a register by its index in the fixed layout.
    pub fn get(&self, index: u64) -> Option<u64> {
        let all: &[u64; VM_STATE_REGISTERS] =
            // SAFETY: `VmState` is exactly this array, by the assertion
            // above and repr(C)
            unsafe { &*(self as *const Self).cast() };
        all.get(usize::try_from(index).ok()?).copied()
    }

    /// Writes a register by its index in the fixed layout.
    pub fn set(&mut self, index: u64, value: u64) -> Option<()> {
        let all: &mut [u64; VM_STATE_REGISTERS] =
            // SAFETY: As for `get`
            unsafe { &mut *(self as *mut Self).cast() };
        *all.get_mut(usize::try_from(index).ok()?)? = value;
        Some(())
    }
}

/// Whether a saved PSTATE names an execution state the partner trampoline
/// re-enters through EL3: AArch32, or a lower 64-bit EL under EL2.
pub fn takes_vm_exit_path(spsr: u64) -> bool {
    spsr & 0x10 != 0 || spsr & 0x1e == 0x8
}

/// The value poisoning the outgoing message registers; the EL2 veneer
/// overwrites them with `{ELR, ESR, FAR, HPFAR}` on the next guest trap.
const POISON: u64 = 0x7777_7777_7777_7777;

/// The single-step bit in SPSR (PSTATE.SS).
const SPSR_SS: u64 = 1 << 21;

/// Hands the CPU to the calling thread's partner.
///
/// The pair swap places in the runnable list. When the partner re-enters
/// the guest world, its resume address is taken from the caller's `x1` and
/// single-step is set in its PSTATE, so the guest takes exactly one
/// architectural step before the next trap serialises it behind the
/// partner again.
pub fn switch_to_partner(
    arena: &mut ThreadArena,
    core: &mut Core,
    thread: ThreadCode,
) -> ThreadSwitch {
    let Some(partner) = arena.context(thread).partner else {
        blue_screen!("switch to partner without a partner");
    };
    if arena.context(thread).current_map != arena.context(partner).current_map {
        blue_screen!("partner threads in different maps");
    }

    // The partner takes the caller's place in the runnable list; the
    // caller parks, self-linked, until control comes back.
    let next = arena.context(thread).next;
    let prev = arena.context(thread).prev;
    if next == thread.raw() {
        let context = arena.context_mut(partner);
        context.next = partner.raw();
        context.prev = partner.raw();
    } else {
        let context = arena.context_mut(partner);
        context.next = next;
        context.prev = prev;
        let Some(next) = ThreadCode::from_raw(next) else {
            blue_screen!("corrupt runnable list");
        };
        let Some(prev) = ThreadCode::from_raw(prev) else {
            blue_screen!("corrupt runnable list");
        };
        arena.context_mut(next).prev = partner.raw();
        arena.context_mut(prev).next = partner.raw();
    }
    arena.context_mut(partner).list = list::RUNNABLE;
    let context = arena.context_mut(thread);
    context.next = thread.raw();
    context.prev = thread.raw();
    context.list = list::NONE;
    core.runnable = Some(partner);

    let spsr = arena.context(partner).spsr;
    if takes_vm_exit_path(spsr) {
        // Entering the guest: resume where the caller said, one step at a
        // time, and make room for the next exception report.
        let resume = arena.context(thread).regs[1];
        let partner_context = arena.context_mut(partner);
        partner_context.pc = resume;
        partner_context.spsr |= SPSR_SS;
        // SAFETY: The slot address is valid for the partner's lifetime
        unsafe {
            machine::clean_invalidate_line(&partner_context.pc);
        }

        let context = arena.context_mut(thread);
        context.regs[0] = POISON; // Will be pc
        context.regs[1] = POISON; // Will be syndrome
        context.regs[2] = POISON; // Will be fault address
        context.regs[3] = POISON; // Will be intermediate physical address
        // SAFETY: As above
        unsafe {
            machine::clean_invalidate_line(context.regs.as_ptr());
        }
    } else {
        // Returning to the secure side: EL2 has updated the report
        // registers behind the cache.
        let regs = arena.context(partner).regs.as_ptr();
        // SAFETY: As above
        unsafe {
            machine::invalidate_line(regs);
            machine::invalidate_line(regs.add(2));
        }
    }

    ThreadSwitch {
        now: partner,
        then: thread,
    }
}

fn stalled_partner(arena: &ThreadArena, thread: ThreadCode) -> ThreadCode {
    let Some(partner) = arena.context(thread).partner else {
        blue_screen!("partner register access without a partner");
    };
    if arena.context(thread).current_map != arena.context(partner).current_map {
        blue_screen!("partner threads in different maps");
    }
    if !takes_vm_exit_path(arena.context(partner).spsr) {
        // The non-secure side has no business in here.
        blue_screen!("partner register access from the wrong side");
    }
    partner
}

/// Reads one of the stalled non-secure thread's registers. Index 31 names
/// the banked stack pointer.
pub fn get_partner_register(arena: &mut ThreadArena, thread: ThreadCode, index: u64) -> u64 {
    if index > 31 {
        blue_screen!("partner register {index} out of range");
    }
    let partner = stalled_partner(arena, thread);
    let context = arena.context(partner);
    // SAFETY: The slot stays valid; the line may be stale after EL2 wrote
    // it with caches off
    unsafe {
        machine::invalidate_line(context.regs.as_ptr().add(index as usize & 31));
    }
    let context = arena.context(partner);
    if index == 31 {
        context.sp
    } else {
        context.regs[index as usize]
    }
}

/// Writes one of the stalled non-secure thread's registers.
pub fn set_partner_register(arena: &mut ThreadArena, thread: ThreadCode, index: u64, value: u64) {
    if index > 31 {
        blue_screen!("partner register {index} out of range");
    }
    let partner = stalled_partner(arena, thread);
    let context = arena.context_mut(partner);
    if index == 31 {
        context.sp = value;
    } else {
        context.regs[index as usize] = value;
    }
    // SAFETY: As for `get_partner_register`
    unsafe {
        machine::clean_invalidate_line(context.regs.as_ptr().add(index as usize & 31));
    }
}

/// Reads or writes one register of the pair's [`VmState`].
///
/// `write` selects the direction; reads return the current value, writes
/// return the previous one.
pub fn change_vm_system_register(
    arena: &mut ThreadArena,
    thread: ThreadCode,
    index: u64,
    value: u64,
    write: bool,
) -> u64 {
    let partner = stalled_partner(arena, thread);
    let vm = arena.vm_state_mut(partner);
    // The trampoline saves the block with its MMU off; pick its writes up
    // without losing any of ours
    clean_invalidate_vm_state(vm);
    let Some(previous) = vm.get(index) else {
        blue_screen!("vm system register {index} out of range");
    };
    if write {
        vm.set(index, value);
        clean_invalidate_vm_state(vm);
        machine::dsb_sy();
    }
    previous
}

/// The initial non-secure PSTATE: AArch32 Supervisor mode, asynchronous
/// exceptions masked until the guest unmasks them itself.
const GUEST_SPSR: u64 = 0x1d3;

/// HCR_EL2 for the ARM1176 guest these defaults were tuned against; the
/// supervising driver adjusts individual bits through
/// `change_vm_system_register`.
const GUEST_HCR: u64 = 0x1c_000f_ec3b;

/// HSTR_EL2: trap the whole CP15 space except the fault address
/// registers, which the guest hammers.
const GUEST_HSTR: u64 = 0xffff & !(1 << 6);

/// VTCR_EL2: a 1 GB intermediate physical space, one level-2 table,
/// write-back cacheable inner-shareable walks.
const GUEST_VTCR: u64 = 0x2_3522;

/// VPIDR_EL2: the same ARM1176 the CP15 emulation reports.
const GUEST_VPIDR: u64 = 0x410f_b767;

/// VMPIDR_EL2: uniprocessor.
const GUEST_VMPIDR: u64 = 0x8000_0f00;

/// Cross-links two threads as each other's partner, records the slot
/// addresses the EL2 veneer dereferences, and seeds the pair's vm_state
/// for the guest: stage-2 translation through `stage2_table`, the tuned
/// trap configuration, and an ARM1176 identity.
pub fn make_partner(
    state: &mut KernelState,
    secure: ThreadCode,
    non_secure: ThreadCode,
    stage2_table: u64,
) {
    if state.threads.context(secure).current_map != state.threads.context(non_secure).current_map {
        blue_screen!("partner threads must share a map");
    }
    let non_secure_slot = state.threads.slot_address(non_secure) as u64;
    let secure_slot = state.threads.slot_address(secure) as u64;

    let secure_context = state.threads.context_mut(secure);
    secure_context.partner = Some(non_secure);
    secure_context.partner_slot = non_secure_slot;

    let ns_context = state.threads.context_mut(non_secure);
    ns_context.partner = Some(secure);
    ns_context.partner_slot = secure_slot;
    if ns_context.spsr == 0 {
        ns_context.spsr = GUEST_SPSR;
    }

    let vm = state.threads.vm_state_mut(non_secure);
    *vm = VmState::EMPTY;
    vm.vttbr_el2 = (1 << 48) | stage2_table; // VMID 1
    vm.vtcr_el2 = GUEST_VTCR;
    vm.hcr_el2 = GUEST_HCR;
    vm.hstr_el2 = GUEST_HSTR;
    vm.vpidr_el2 = GUEST_VPIDR;
    vm.vmpidr_el2 = GUEST_VMPIDR;
    clean_invalidate_vm_state(vm);
    machine::dsb_sy();
}

/// Pushes the whole vm_state block out to the point of coherency: the
/// trampoline reads and writes it with the MMU off.
fn clean_invalidate_vm_state(vm: &VmState) {
    let base = (vm as *const VmState).cast::<u64>();
    // SAFETY: The block is live for the slot's lifetime
    unsafe {
        machine::clean_invalidate_line(base);
        machine::clean_invalidate_line(base.add(8));
        machine::clean_invalidate_line(base.add(16));
    }
}

#[cfg(test)]
mod tests {
    use super::super::{
        interface::SYSTEM_MAP,
        per_core::Core,
        thread::{list, ThreadCode},
        KernelState,
    };
    use super::{
        change_vm_system_register, get_partner_register, make_partner, set_partner_register,
        switch_to_partner,
    };
    use crate::add_test;

    /// A secure thread and its non-secure (AArch32) partner, runnable
    /// secure-side.
    fn paired_state() -> (&'static mut KernelState, &'static mut Core, ThreadCode, ThreadCode) {
        let (state, core) = crate::kernel::testing::fixture();
        let secure = state.threads.allocate().unwrap();
        let guest = state.threads.allocate().unwrap();
        for code in [secure, guest] {
            state.threads.initialise_new_thread(code);
            state.threads.context_mut(code).current_map = SYSTEM_MAP;
        }
        state.threads.context_mut(guest).spsr = 0x10; // AArch32
        state
            .threads
            .insert_at_tail(&mut core.runnable, list::RUNNABLE, secure);
        make_partner(state, secure, guest, 0x8_0000);
        (state, core, secure, guest)
    }

    add_test!(partner_links_are_symmetric, {
        let (state, _, secure, guest) = paired_state();
        assert_eq!(state.threads.context(secure).partner, Some(guest));
        assert_eq!(state.threads.context(guest).partner, Some(secure));
        assert_eq!(
            state.threads.context(secure).partner_slot,
            state.threads.slot_address(guest) as u64
        );
    });

    add_test!(switch_swaps_the_pair_and_single_steps_the_guest, {
        let (state, core, secure, guest) = paired_state();

        state.threads.context_mut(secure).regs[1] = 0x8000; // Guest resume pc
        let switch = switch_to_partner(&mut state.threads, core, secure);
        assert_eq!(switch.now, guest);
        assert_eq!(core.runnable, Some(guest));

        let guest_context = state.threads.context(guest);
        assert_eq!(guest_context.pc, 0x8000);
        assert_ne!(guest_context.spsr & (1 << 21), 0, "single-step must be set");

        // The caller's report registers are poisoned until EL2 fills them.
        let secure_context = state.threads.context(secure);
        assert_eq!(secure_context.regs[0], 0x7777_7777_7777_7777);
        assert_eq!(secure_context.next, secure.raw());
    });

    add_test!(partner_registers_are_reachable_while_stalled, {
        let (state, _, secure, guest) = paired_state();
        set_partner_register(&mut state.threads, secure, 5, 0x1234);
        assert_eq!(state.threads.context(guest).regs[5], 0x1234);
        assert_eq!(get_partner_register(&mut state.threads, secure, 5), 0x1234);

        set_partner_register(&mut state.threads, secure, 31, 0xf000);
        assert_eq!(state.threads.context(guest).sp, 0xf000);
    });

    add_test!(vm_system_registers_read_back, {
        let (state, _, secure, _) = paired_state();
        // Index 1 is SCTLR_EL1 in the fixed layout.
        change_vm_system_register(&mut state.threads, secure, 1, 0xc50838, true);
        assert_eq!(
            change_vm_system_register(&mut state.threads, secure, 1, 0, false),
            0xc50838
        );
    });
}
