//! Architecture-specific implementations: everything that touches AArch64
//! system registers, exception levels, translation descriptors or assembly
//! lives below here. The portable core in [`crate::kernel`] is kept free of
//! inline assembly.

mod boot;
pub mod el3;
pub mod exception;
pub mod exclusive;
pub mod machine;
mod shutdown;
mod spinlock;
pub mod vmsa;

pub use shutdown::shutdown;
pub use spinlock::Spinlock;

/// Initializes architecture-specific items for the whole machine
/// # Safety
/// Must only be called once, during kernel initialization
pub unsafe fn init() {
    crate::call_once!();
}

/// Readies this core's exception handling
/// # Safety
/// Must only be called once per core, at the appropriate time
pub unsafe fn per_core_init() {
    crate::call_once_per_core!();
    exception::per_core_init();
}
