//! The interface table: the capability substrate.
//!
//! An interface record names who may invoke it (`user`), which map
//! implements it (`provider`), where the provider is entered (`handler`)
//! and an opaque word handed to the handler (`object`). Records are
//! referenced everywhere by 32-bit indices; index 0 is reserved, indices 1
//! and 2 are the two preinstalled maps.
use super::error::Fault;
use crate::{architecture::exclusive, blue_screen};

/// A 32-bit reference to an interface record. Doubles as the name of a map
/// (a map is an interface whose handler is the system-map dispatcher).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct InterfaceIndex(u32);

impl InterfaceIndex {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn register(self) -> u64 {
        self.0.into()
    }

    pub const fn is_illegal(self) -> bool {
        self.0 == 0
    }
}

/// Reserved, never valid.
pub const ILLEGAL_INTERFACE: InterfaceIndex = InterfaceIndex(0);
/// The system map: always resident, owns the driver table and all physical
/// memory blocks.
pub const SYSTEM_MAP: InterfaceIndex = InterfaceIndex(1);
/// The memory-allocator map: always resident, enterable only from the
/// system map.
pub const MEMORY_ALLOCATOR_MAP: InterfaceIndex = InterfaceIndex(2);
/// How many records are preinstalled at boot.
pub const NUMBER_OF_SPECIAL_INTERFACES: u32 = 2;

/// Entry points into the system driver, known only to the kernel and the
/// driver itself.
pub mod system_service {
    pub const ENTER_CORE0: u64 = 0;
    pub const THREAD_EXIT: u64 = 4;
    pub const MAP: u64 = 8;
    pub const PHYSICAL_MEMORY_BLOCK: u64 = 12;
}

/// The one method the kernel intercepts instead of switching maps: asking
/// the system driver for a physical address needs EL1 to be efficient.
pub const PHYSICAL_ADDRESS_OF: u64 = 0x4a27_4f85;

/// "FreeInt\0"; stamped into freed records to catch double frees.
const FREE_MARKER: u64 = 0x0074_6e49_6565_7246;

/// One capability record.
///
/// A free record reuses `object` as the next free index and carries
/// [`FREE_MARKER`] in `handler`.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Interface {
    /// The map permitted to invoke this record
    pub user: InterfaceIndex,
    /// The map that implements it
    pub provider: InterfaceIndex,
    /// Virtual address in the provider map entered on invocation
    pub handler: u64,
    /// Opaque value handed to the handler in x0
    pub object: u64,
}

impl Interface {
    const EMPTY: Self = Self {
        user: ILLEGAL_INTERFACE,
        provider: ILLEGAL_INTERFACE,
        handler: 0,
        object: 0,
    };
}

/// The capacity of the table.
pub const MAX_INTERFACES: u32 = 512;

/// The bounded pool of interface records.
pub struct InterfaceTable {
    records: [Interface; MAX_INTERFACES as usize],
    /// Head of the free list; zero when empty
    free_head: u32,
    /// One past the highest index ever threaded onto the free list
    last: u32,
}

impl InterfaceTable {
    pub const fn new() -> Self {
        Self {
            records: [Interface::EMPTY; MAX_INTERFACES as usize],
            free_head: 0,
            last: NUMBER_OF_SPECIAL_INTERFACES + 1,
        }
    }

    /// Forgets every record beyond the specials, in place.
    #[cfg(test)]
    pub fn reset(&mut self) {
        self.free_head = 0;
        self.last = NUMBER_OF_SPECIAL_INTERFACES + 1;
        for record in self.records.iter_mut() {
            *record = Interface::EMPTY;
        }
    }

    fn check(&self, index: InterfaceIndex) -> usize {
        if index.is_illegal() || index.raw() >= self.last {
            blue_screen!("interface index {} out of range", index.raw());
        }
        index.raw() as usize
    }

    pub fn get(&self, index: InterfaceIndex) -> &Interface {
        &self.records[self.check(index)]
    }

    pub fn get_mut(&mut self, index: InterfaceIndex) -> &mut Interface {
        let index = self.check(index);
        &mut self.records[index]
    }

    /// Looks an index up from a register value, without panicking: the
    /// value came from userspace.
    pub fn lookup(&self, raw: u64) -> Option<InterfaceIndex> {
        let raw = u32::try_from(raw).ok()?;
        (raw != 0 && raw < self.last).then_some(InterfaceIndex(raw))
    }

    /// Threads records `[first_new, new_last)` onto the free list.
    ///
    /// Performed at boot and, under resource pressure, by the system map.
    pub fn grow(&mut self, new_last: u32) {
        if new_last <= self.last || new_last > MAX_INTERFACES {
            blue_screen!("invalid interface table growth to {new_last}");
        }
        let first_new = self.last;
        for index in first_new..new_last {
            self.records[index as usize].handler = FREE_MARKER;
            self.records[index as usize].object = u64::from(index) + 1;
        }
        self.records[new_last as usize - 1].object = 0;
        self.last = new_last;
        self.free_head = first_new;
    }

    /// Pops a record off the free list.
    pub fn obtain(&mut self) -> Result<InterfaceIndex, Fault> {
        loop {
            let head_ptr: *mut u32 = &mut self.free_head;
            // SAFETY: `head_ptr` points into this table
            let head = unsafe { exclusive::load_exclusive_word(head_ptr) };
            if head == 0 {
                exclusive::clear_exclusive();
                return Err(Fault::ResourceExhausted);
            }
            let record = self.records[head as usize];
            if record.handler != FREE_MARKER {
                blue_screen!("interface {head} on free list without marker");
            }
            let next = record.object as u32;
            // SAFETY: `head_ptr` points into this table
            if unsafe { exclusive::store_exclusive_word(head_ptr, next) } {
                return Ok(InterfaceIndex(head));
            }
        }
    }

    /// Pushes a record back onto the free list, stamping the sentinel.
    pub fn free(&mut self, index: InterfaceIndex) {
        let slot = self.check(index);
        if self.records[slot].handler == FREE_MARKER {
            blue_screen!("interface {} freed twice", index.raw());
        }
        self.records[slot].handler = FREE_MARKER;
        self.records[slot].user = ILLEGAL_INTERFACE;
        self.records[slot].provider = ILLEGAL_INTERFACE;
        loop {
            let head_ptr: *mut u32 = &mut self.free_head;
            // SAFETY: `head_ptr` points into this table
            let head = unsafe { exclusive::load_exclusive_word(head_ptr) };
            self.records[slot].object = head.into();
            // SAFETY: `head_ptr` points into this table
            if unsafe { exclusive::store_exclusive_word(head_ptr, index.raw()) } {
                return;
            }
        }
    }

    /// Mints a new record. Handler pointers must be 4-byte aligned: they
    /// are entered as AArch64 code.
    pub fn mint(
        &mut self,
        user: InterfaceIndex,
        provider: InterfaceIndex,
        handler: u64,
        object: u64,
    ) -> Result<InterfaceIndex, Fault> {
        if handler & 0x3 != 0 {
            return Err(Fault::Malformed);
        }
        let index = self.obtain()?;
        *self.get_mut(index) = Interface {
            user,
            provider,
            handler,
            object,
        };
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::{Fault, NUMBER_OF_SPECIAL_INTERFACES, SYSTEM_MAP};
    use crate::add_test;

    add_test!(free_list_drains_in_order, {
        let (state, _) = crate::kernel::testing::fixture();
        let table = &mut state.interfaces;
        table.grow(NUMBER_OF_SPECIAL_INTERFACES + 4);
        let first = table.obtain().unwrap();
        let second = table.obtain().unwrap();
        let third = table.obtain().unwrap();
        assert_eq!(first.raw(), 3);
        assert_eq!(second.raw(), 4);
        assert_eq!(third.raw(), 5);
        assert_eq!(table.obtain().unwrap_err(), Fault::ResourceExhausted);

        table.free(second);
        assert_eq!(table.obtain().unwrap(), second);
    });

    add_test!(unaligned_handlers_are_rejected, {
        let (state, _) = crate::kernel::testing::fixture();
        let table = &mut state.interfaces;
        table.grow(NUMBER_OF_SPECIAL_INTERFACES + 2);
        assert_eq!(
            table.mint(SYSTEM_MAP, SYSTEM_MAP, 0x1002, 0).unwrap_err(),
            Fault::Malformed
        );
        let minted = table.mint(SYSTEM_MAP, SYSTEM_MAP, 0x1000, 77).unwrap();
        assert_eq!(table.get(minted).object, 77);
    });
}
