//! The end of the line: invariant violations and panics land here.
//!
//! The register file of the interrupted thread and the active vm_state are
//! dumped over the debug serial line; the trivial-display driver, when
//! present, paints the same dump on screen until power-off.
use crate::{architecture, kernel, println};

/// Prints the saved register file of the thread the core was running.
fn dump_current_thread() {
    // SAFETY: The core is about to halt; racing a reader is harmless
    let state = unsafe { kernel::state() };
    // The dump must not fault, whatever state the scheduler is in.
    let Some(thread) = architecture::exception::current_thread(state) else {
        println!("no thread context");
        return;
    };
    let context = state.threads.context(thread);
    for (index, pair) in context.regs.chunks(2).enumerate() {
        match *pair {
            [a, b] => println!("x{:<2} {a:016x}  x{:<2} {b:016x}", index * 2, index * 2 + 1),
            [a] => println!("x{:<2} {a:016x}", index * 2),
            _ => (),
        }
    }
    println!("sp  {:016x}  pc  {:016x}", context.sp, context.pc);
    println!("psr {:016x}  map {}", context.spsr, context.current_map.raw());
    if let Some(partner) = context.partner {
        let vm = state.threads.vm_state(partner);
        println!("vm: sctlr {:08x} ttbr0 {:016x}", vm.sctlr_el1, vm.ttbr0_el1);
        println!("    hcr   {:016x} vttbr {:016x}", vm.hcr_el2, vm.vttbr_el2);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    let (file, line, column) = match info.location() {
        Some(loc) => (loc.file(), loc.line(), loc.column()),
        _ => ("Unknown file", 0, 0),
    };

    println!("PANIC at {}:{}:{}\n{}", file, line, column, info.message());
    dump_current_thread();

    // Shutdown badly
    architecture::shutdown(1);
}
