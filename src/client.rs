//! The driver-side half of the kernel ABI.
//!
//! Everything in here runs at EL0, inside a driver's map. A driver holds
//! capabilities as opaque indices, invokes them through the `Call` SVC
//! with the method selector in x1, and gets results back in x0, the V
//! flag distinguishing an exceptional return. The kernel planted the
//! thread's own code in x18 at creation; the stubs here rely on it and
//! keep it intact.
use crate::architecture::exclusive;
use core::arch::asm;
use core::cell::UnsafeCell;

/// A capability index, as a driver holds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Capability(pub u64);

/// The calling thread's own code, from the platform register.
pub fn current_thread_code() -> u64 {
    let code: u64;
    // SAFETY: x18 is the platform register carrying the thread code
    unsafe {
        asm!("mov {c}, x18", c = out(reg) code, options(nomem, nostack, preserves_flags));
    }
    code
}

/// Invokes a capability: the provider runs its handler with our arguments
/// and eventually returns one word, or raises an exception carried back
/// in the V flag.
pub fn call(cap: Capability, method: u32, args: [u64; 3]) -> Result<u64, u64> {
    let result: u64;
    let failed: u64;
    // SAFETY: The call SVC preserves this thread's world apart from the
    // result register and flags
    unsafe {
        asm!(
            "svc 0xf009",
            "cset {failed}, vs",
            inout("x0") cap.0 => result,
            inout("x1") u64::from(method) => _,
            inout("x2") args[0] => _,
            inout("x3") args[1] => _,
            in("x4") args[2],
            failed = out(reg) failed,
        );
    }
    if failed == 0 {
        Ok(result)
    } else {
        Err(result)
    }
}

/// Returns one word to the inter-map caller.
pub fn inter_map_return(value: u64) -> ! {
    // SAFETY: Control leaves this map; nothing local survives
    unsafe {
        asm!("svc 0xf00a", in("x0") value, options(noreturn));
    }
}

/// Returns exceptionally to the inter-map caller: V set, one word.
pub fn inter_map_exception(value: u64) -> ! {
    // SAFETY: As for `inter_map_return`
    unsafe {
        asm!("svc 0xf00b", in("x0") value, options(noreturn));
    }
}

/// One derivation stub per SVC: the number lives in the instruction, so
/// each gets its own `svc`.
macro_rules! derivation {
    ($(#[$doc:meta])* $name:ident($($arg:ident),+) = $svc:literal) => {
        $(#[$doc])*
        pub fn $name($($arg: u64),+) -> Result<Capability, u64> {
            let result: u64;
            let failed: u64;
            let [x0, x1, x2] = pack([$($arg),+]);
            // SAFETY: Derivation SVCs touch only x0 and the flags
            unsafe {
                asm!(
                    concat!("svc ", $svc),
                    "cset {failed}, vs",
                    inout("x0") x0 => result,
                    inout("x1") x1 => _,
                    in("x2") x2,
                    failed = out(reg) failed,
                );
            }
            if failed == 0 {
                Ok(Capability(result))
            } else {
                Err(result)
            }
        }
    };
}

/// Pads an argument list out to the three derivation registers.
fn pack<const N: usize>(args: [u64; N]) -> [u64; 3] {
    let mut packed = [0; 3];
    packed[..N].copy_from_slice(&args);
    packed
}

derivation! {
    /// Re-mints the received capability for the map that called us.
    duplicate_to_return(cap) = "0xf002"
}

derivation! {
    /// Re-mints a received capability for `target`'s provider.
    duplicate_to_pass_to(target, cap) = "0xf003"
}

derivation! {
    /// Mints a capability over our own `handler`/`object` for the map
    /// that called us.
    interface_to_return(handler, object) = "0xf004"
}

derivation! {
    /// Mints a capability over our own `handler`/`object` for `target`'s
    /// provider.
    interface_to_pass_to(target, handler, object) = "0xf005"
}

/// Waits on the calling thread's gate. Returns the pending-wake count if
/// it never blocked, zero after a wake, negative after `timeout_ticks`
/// expired.
pub fn wait_until_woken(timeout_ticks: u64) -> i64 {
    let result: u64;
    // SAFETY: The gate SVC uses x0/x1 and borrows x16/x17 while blocked
    unsafe {
        asm!(
            "svc 0xf001",
            inout("x0") 0_u64 => result,
            inout("x1") timeout_ticks => _,
            out("x16") _,
            out("x17") _,
        );
    }
    result as i64
}

/// Wakes another thread of the same map; banks the wake if it is not
/// waiting yet.
pub fn wake_thread(code: u64) {
    // SAFETY: Plain syscall
    unsafe {
        asm!("svc 0xf001", inout("x0") code => _);
    }
}

/// Parks the calling thread for roughly `ticks` timer ticks.
pub fn sleep_ticks(ticks: u64) {
    let _ = wait_until_woken(ticks);
}

/// Cooperatively yields; true if another thread was runnable.
pub fn yield_now() -> bool {
    let other: u64;
    // SAFETY: Plain syscall
    unsafe {
        asm!("svc 0xf008", out("x0") other);
    }
    other != 0
}

/// The userspace half of a kernel-arbitrated lock.
///
/// The word must stay private to one map and one core; see the kernel's
/// lock documentation for why that boundary exists.
pub struct UserLock {
    word: UnsafeCell<u64>,
}

// SAFETY: The whole point: cross-thread arbitration via the kernel
unsafe impl Sync for UserLock {}

impl UserLock {
    pub const fn new() -> Self {
        Self {
            word: UnsafeCell::new(0),
        }
    }

    /// Takes the lock: one CAS when uncontended, `Lock_Wait` otherwise.
    pub fn claim(&self) {
        let tid = current_thread_code();
        let word = self.word.get();
        loop {
            // SAFETY: The word lives as long as the lock
            let value = unsafe { exclusive::load_exclusive_doubleword(word) };
            if value == 0 {
                // SAFETY: As above
                if unsafe { exclusive::store_exclusive_doubleword(word, tid) } {
                    return;
                }
                continue;
            }
            exclusive::clear_exclusive();
            // Contended: the kernel queues us and returns once we own it.
            // x17 and x18 are the lock ABI, not scratch.
            // SAFETY: Syscall with the documented register contract
            unsafe {
                asm!(
                    "mov x17, {word}",
                    "svc 0xf006",
                    word = in(reg) word,
                    out("x17") _,
                );
            }
            return;
        }
    }

    /// Releases the lock: one store when nobody waits, `Lock_Release`
    /// otherwise.
    pub fn release(&self) {
        let tid = current_thread_code();
        let word = self.word.get();
        loop {
            // SAFETY: The word lives as long as the lock
            let value = unsafe { exclusive::load_exclusive_doubleword(word) };
            if value == tid {
                // No waiters: drop it on the fast path
                // SAFETY: As above
                if unsafe { exclusive::store_exclusive_doubleword(word, 0) } {
                    return;
                }
                continue;
            }
            exclusive::clear_exclusive();
            // SAFETY: Syscall with the documented register contract
            unsafe {
                asm!(
                    "mov x17, {word}",
                    "svc 0xf007",
                    word = in(reg) word,
                    out("x17") _,
                );
            }
            return;
        }
    }

    /// Runs `work` with the lock held.
    pub fn with<R>(&self, work: impl FnOnce() -> R) -> R {
        self.claim();
        let result = work();
        self.release();
        result
    }
}

/// The system driver, as every driver sees it. Method selectors are CRCs
/// of the method names, fixed across all drivers.
#[derive(Clone, Copy)]
pub struct DriverSystem(pub Capability);

impl DriverSystem {
    /// A physical memory block over one device page.
    pub fn get_device_page(self, physical_address: u64) -> Result<Capability, u64> {
        call(self.0, 0x10e6_5c36, [physical_address, 0, 0]).map(Capability)
    }

    /// A physical memory block over an arbitrary range the system owns.
    pub fn get_physical_memory_block(self, start: u64, size: u64) -> Result<Capability, u64> {
        call(self.0, 0xb2e6_24ca, [start, size, 0]).map(Capability)
    }

    /// Maps a physical memory block into the calling map at `start`.
    pub fn map_at(self, block: Capability, start: u64) -> Result<(), u64> {
        call(self.0, 0xbaf1_9077, [block.0, start, 0]).map(|_| ())
    }

    /// A new thread of the calling map; returns its code.
    pub fn create_thread(self, code: u64, stack_top: u64) -> Result<u64, u64> {
        call(self.0, 0xbc17_ddc4, [code, stack_top, 0])
    }

    /// The physical address behind `va`; the one method answered by the
    /// kernel without a map switch.
    pub fn physical_address_of(self, va: u64) -> Result<u64, u64> {
        call(self.0, 0x4a27_4f85, [va, 0, 0])
    }

    pub fn register_service(self, name_crc: u64, provider: Capability) -> Result<(), u64> {
        call(self.0, 0x3f21_4cf5, [name_crc, provider.0, 0]).map(|_| ())
    }

    pub fn get_service(self, name_crc: u64) -> Result<Capability, u64> {
        call(self.0, 0xc8d4_a50f, [name_crc, u64::MAX, 0]).map(Capability)
    }

    pub fn get_ms_timer_ticks(self) -> Result<u64, u64> {
        call(self.0, 0x9ae1_23a7, [0, 0, 0])
    }

    pub fn register_interrupt_handler(
        self,
        handler: Capability,
        interrupt: u64,
    ) -> Result<(), u64> {
        call(self.0, 0x5a2d_ad5d, [handler.0, interrupt, 0]).map(|_| ())
    }

    /// Pairs the calling thread with a fresh non-secure VCPU whose
    /// intermediate physical space is described by `stage2_table`.
    pub fn make_partner_thread(self, stage2_table: Capability) -> Result<u64, u64> {
        call(self.0, 0x7d01_fa4e, [stage2_table.0, 0, 0])
    }
}
