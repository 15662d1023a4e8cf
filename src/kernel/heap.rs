//! The kernel heap: a downward-growing arena on the kernel's working page.
//!
//! Heap cells are named by *offsets* measured down from the top of the
//! arena, so the same value works from any mapping of the kernel image;
//! `MapValue` words carry such offsets (shifted right four bits) across the
//! ABI. Everything is 16-byte aligned. Only the system driver reads and
//! writes heap cells directly, through the §system-request operations; the
//! kernel itself stores maps' VMB arrays here.
use crate::{architecture::exclusive, blue_screen};

/// Alignment of every heap cell, and granularity of offsets.
const ALIGNMENT: u64 = 16;

/// An offset from the top of the heap, 16-byte aligned.
pub type HeapOffset = u32;

/// The downward-growing arena.
///
/// `bottom` is the offset of the lowest allocated cell; allocation pushes
/// it further down. The exclusive-monitor loop keeps concurrent
/// allocations from different cores disjoint.
pub struct KernelHeap {
    base: *mut u8,
    top: u32,
    bottom: u32,
}

impl KernelHeap {
    /// A heap over no memory; every allocation fails until [`Self::init`].
    pub const fn empty() -> Self {
        Self {
            base: core::ptr::null_mut(),
            top: 0,
            bottom: 0,
        }
    }

    /// Places the heap over `region`.
    ///
    /// # Safety
    /// `region` must outlive the heap and not be used by anything else.
    pub unsafe fn init(&mut self, region: *mut u8, size: u32) {
        if size % ALIGNMENT as u32 != 0 {
            blue_screen!("heap region must be 16-byte aligned");
        }
        self.base = region;
        self.top = size;
        self.bottom = size;
    }

    /// Bytes not yet allocated.
    pub fn remaining(&self) -> u32 {
        self.bottom
    }

    /// Allocates `size` bytes (rounded up to cells) and returns the offset
    /// of the new cell.
    pub fn allocate(&mut self, size: u64) -> HeapOffset {
        let size = (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1);
        let bottom: *mut u32 = &mut self.bottom;
        loop {
            // SAFETY: `bottom` points into this heap
            let current = unsafe { exclusive::load_exclusive_word(bottom) };
            let Some(new_bottom) = (current as u64).checked_sub(size) else {
                exclusive::clear_exclusive();
                blue_screen!("kernel heap exhausted");
            };
            // SAFETY: `bottom` points into this heap
            if unsafe { exclusive::store_exclusive_word(bottom, new_bottom as u32) } {
                // A cell's offset is the distance of its start below the
                // top; the cell's `size` bytes run from there towards the
                // top.
                return self.top - new_bottom as u32;
            }
        }
    }

    /// Frees a cell. Deliberately unimplemented, as in every deployment so
    /// far: maps are long-lived and the heap is sized for them.
    pub fn free(&mut self, offset: u64, size: u64) {
        self.check_offset(offset);
        if size % ALIGNMENT != 0 {
            blue_screen!("heap free of unaligned size");
        }
        blue_screen!("heap free is not implemented");
    }

    fn check_offset(&self, offset: u64) {
        if offset > u64::from(self.top - self.bottom) {
            blue_screen!("heap offset {offset:#x} out of range");
        }
        if offset % ALIGNMENT != 0 {
            blue_screen!("heap offset {offset:#x} unaligned");
        }
    }

    /// The address of the cell at `offset`.
    pub fn pointer_from_offset(&self, offset: HeapOffset) -> *mut u8 {
        self.check_offset(offset.into());
        // SAFETY: `check_offset` bounds the result within the region
        unsafe { self.base.add((self.top - offset) as usize) }
    }

    /// The address of a cell whose offset arrived packed in a `MapValue`.
    pub fn pointer_from_offset_lsr4(&self, offset_lsr4: u32) -> *mut u8 {
        self.pointer_from_offset(offset_lsr4 << 4)
    }

    /// The packed form of a cell offset.
    pub fn offset_lsr4(&self, offset: HeapOffset) -> u32 {
        offset >> 4
    }

    /// Whether a packed offset lies within the allocated part of the heap.
    pub fn contains_lsr4(&self, offset_lsr4: u32) -> bool {
        u64::from(offset_lsr4) <= u64::from((self.top - self.bottom) >> 4)
    }

    /// Copies `length` bytes out of the heap at `offset`.
    pub fn read(&self, offset: u64, length: u64, destination: *mut u8) {
        self.check_transfer(offset, length);
        let source = self.pointer_from_offset(offset as u32);
        // SAFETY: `check_transfer` validated the heap side; the system
        // driver vouches for its own buffer
        unsafe {
            core::ptr::copy_nonoverlapping(source, destination, length as usize);
        }
    }

    /// Copies `length` bytes into the heap at `offset`.
    pub fn write(&mut self, offset: u64, length: u64, source: *const u8) {
        self.check_transfer(offset, length);
        let destination = self.pointer_from_offset(offset as u32);
        // SAFETY: As for `read`
        unsafe {
            core::ptr::copy_nonoverlapping(source, destination, length as usize);
        }
    }

    fn check_transfer(&self, offset: u64, length: u64) {
        self.check_offset(offset);
        if length % ALIGNMENT != 0 {
            blue_screen!("heap access of unaligned length");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KernelHeap;
    use crate::add_test;

    #[repr(align(16))]
    struct Backing([u8; 256]);

    add_test!(allocations_grow_downward, {
        static mut BACKING: Backing = Backing([0; 256]);
        let mut heap = KernelHeap::empty();
        // SAFETY: The backing store belongs to this test alone
        unsafe {
            heap.init(core::ptr::addr_of_mut!(BACKING).cast(), 256);
        }

        let first = heap.allocate(32);
        let second = heap.allocate(10); // Rounds to 16
        assert_eq!(first, 32);
        assert_eq!(second, 48);
        assert_eq!(heap.remaining(), 256 - 48);

        // Offsets address distinct cells below the top.
        let a = heap.pointer_from_offset(first) as usize;
        let b = heap.pointer_from_offset(second) as usize;
        assert_eq!(a - b, 16);

        // Round-trip through the packed MapValue form.
        assert_eq!(heap.pointer_from_offset_lsr4(heap.offset_lsr4(second)) as usize, b);
    });

    add_test!(heap_transfers_copy_whole_cells, {
        static mut BACKING: Backing = Backing([0; 256]);
        let mut heap = KernelHeap::empty();
        // SAFETY: The backing store belongs to this test alone
        unsafe {
            heap.init(core::ptr::addr_of_mut!(BACKING).cast(), 256);
        }
        let cell = heap.allocate(16);
        let data: [u8; 16] = [7; 16];
        let mut readback: [u8; 16] = [0; 16];
        heap.write(cell.into(), 16, data.as_ptr());
        heap.read(cell.into(), 16, readback.as_mut_ptr());
        assert_eq!(readback, data);
    });
}
