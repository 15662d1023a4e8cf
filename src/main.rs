//! The IsambardOS kernel binary.
#![no_main]
#![no_std]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(_test_runner)]
#![forbid(unsafe_op_in_unsafe_fn)]

/// Dummy function for rust-analyzer issues
fn _test_runner(_: &[&()]) {}

use isambard::log;

/// The default main sequence: the boot path has installed the driver maps
/// and their initial threads; nothing remains for the kernel itself to do
/// but report in.
#[no_mangle]
pub fn kernel_main() {
    log!("Kernel main running");
}
