/// Ensures that the given function is only called once
/// Panics if run more than once
#[macro_export]
macro_rules! call_once {
    () => {{
        use core::sync::atomic::{AtomicBool, Ordering};
        static IS_FIRST_INVOCATION: AtomicBool = AtomicBool::new(false);
        assert!(!IS_FIRST_INVOCATION.swap(true, Ordering::Relaxed))
    }};
}

/// Ensures that the given function is only called once per core
/// Panics if run more than once on any given core
#[macro_export]
macro_rules! call_once_per_core {
    () => {{
        use core::sync::atomic::{AtomicU8, Ordering};
        static CORES_INVOKED: AtomicU8 = AtomicU8::new(0);
        let bit: u8 = 1 << $crate::architecture::machine::core_number();
        assert_eq!(CORES_INVOKED.fetch_or(bit, Ordering::Relaxed) & bit, 0);
    }};
}
