//! The IsambardOS kernel library.
//!
//! A multi-core AArch64 microkernel whose defining feature is the
//! secure/non-secure partner-thread hypervisor: every non-secure virtual CPU
//! is paired one-to-one with a secure thread that emulates the peripherals
//! and privileged state the guest traps on.
#![no_main]
#![no_std]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(test_runner)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![allow(clippy::new_without_default)]
#![allow(clippy::module_name_repetitions)]

pub mod architecture;
pub mod board;
pub mod client;
pub mod hypervisor;
pub mod kernel;
pub mod macros;

/// The default runner for unit tests.
pub fn test_runner(tests: &[&TestCase]) -> ! {
    for test in tests {
        crate::println!("{}:", test.name);
        (test.test)();
        crate::println!(".... PASSED");
    }

    architecture::shutdown(0);
}

/// Registers a test to the given name
#[macro_export]
macro_rules! add_test {
    ($name: ident, $test: block) => {
        #[test_case]
        const $name: $crate::TestCase = $crate::TestCase {
            name: stringify!($name),
            test: || $test,
        };
    };
}

/// Represents a test to run
pub struct TestCase {
    /// Name of the test.
    pub name: &'static str,

    /// Function pointer to the test.
    pub test: fn(),
}

#[cfg(test)]
#[no_mangle]
fn kernel_main() {
    test_main();
}
