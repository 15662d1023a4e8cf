//! The kernel error taxonomy.
//!
//! Userspace errors return through the V flag in the saved PSTATE with a
//! single-word code in `x0`. Kernel invariant violations do not return: the
//! core is considered compromised and halts with a diagnostic dump.
use derive_more::Display;

/// An error surfaced to the calling thread.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Fault {
    /// The invoking thread's map does not match the capability's `user`,
    /// the wakee is in another map, or the caller does not own the lock.
    #[display(fmt = "permission denied")]
    PermissionDenied,
    /// A lock address is not user-writable in the current map.
    #[display(fmt = "bad address")]
    BadAddress,
    /// No free interface record is available.
    #[display(fmt = "resource exhausted")]
    ResourceExhausted,
    /// An unaligned handler pointer was passed into interface creation.
    #[display(fmt = "malformed request")]
    Malformed,
    /// A guest stage-2 access hit an IPA no emulated peripheral covers.
    #[display(fmt = "unhandled stage-2 fault")]
    StageFault,
}

impl Fault {
    /// The single-word code transmitted in `x0` alongside the V flag.
    pub fn code(self) -> u64 {
        match self {
            Self::PermissionDenied => 1,
            Self::BadAddress => 2,
            Self::ResourceExhausted => 3,
            Self::Malformed => 4,
            Self::StageFault => 5,
        }
    }
}

/// Halts the core after an unrecoverable invariant violation.
///
/// The register dump of the interrupted thread is printed by the panic
/// path; this reports the violation itself.
#[macro_export]
macro_rules! blue_screen {
    ($($arg:tt)*) => {{
        $crate::println!("BLUE SCREEN on core {}", $crate::architecture::machine::core_number());
        panic!($($arg)*);
    }};
}
