//! The map manager: loads per-core stage-1 tables for a map on demand, and
//! faults virtual memory blocks in from their backing physical blocks.
//!
//! A *map* is an address space, named by the interface index of its
//! system-map capability. The capability's object word is a [`MapValue`]
//! pointing at the map's array of [`VirtualMemoryBlock`]s on the kernel
//! heap; each VMB names the interface holding its backing
//! [`ContiguousMemoryBlock`]. None of that is pre-walked on map entry:
//! pages appear in the core's tables on first access.
use super::{
    init::DriverInfo,
    interface::{system_service, InterfaceIndex, MEMORY_ALLOCATOR_MAP, SYSTEM_MAP},
    per_core::{Core, L1_ENTRIES},
    thread::ThreadCode,
    KernelState,
};
use crate::{
    architecture::{
        machine,
        vmsa::{Descriptor, MemoryType},
    },
    blue_screen,
};
use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;

/// A physical-memory descriptor, packed into a capability object word.
#[bitfield(u64)]
pub struct ContiguousMemoryBlock {
    #[bits(24)]
    pub start_page: u32,
    #[bits(20)]
    pub page_count: u32,
    pub read_only: bool,
    #[bits(15)]
    _reserved: u16,
    /// Set when another CMB includes this one
    pub is_subpage: bool,
    #[bits(3)]
    pub memory_type: MemoryType,
}

/// One contiguous range of virtual pages within a map.
#[bitfield(u64)]
pub struct VirtualMemoryBlock {
    #[bits(24)]
    pub start_page: u32,
    #[bits(20)]
    pub page_count: u32,
    /// Combined with the physical permissions
    pub read_only: bool,
    pub executable: bool,
    /// Interface index of the backing memory block
    #[bits(18)]
    pub memory_block: u32,
}

/// The object word of a map capability.
#[bitfield(u64)]
pub struct MapValue {
    /// Heap offset of the VMB array, shifted right four bits
    #[bits(32)]
    pub heap_offset_lsr4: u32,
    /// The map's own interface index
    #[bits(20)]
    pub map_object: u32,
    /// Capacity of the VMB array
    #[bits(12)]
    pub number_of_vmbs: u32,
}

// These three words cross the ABI inside capability objects.
const_assert_eq!(core::mem::size_of::<ContiguousMemoryBlock>(), 8);
const_assert_eq!(core::mem::size_of::<VirtualMemoryBlock>(), 8);
const_assert_eq!(core::mem::size_of::<MapValue>(), 8);

const LEVEL1_LSB: u32 = 12 + 9 + 9;
const LEVEL2_LSB: u32 = 12 + 9;
const LEVEL3_LSB: u32 = 12;

/// Pages per 1 GB block.
const L1_PAGES: u32 = 1 << 18;
/// Pages per 2 MB block.
const L2_PAGES: u32 = 1 << 9;

/// The stage-1 view of the system driver, shared by all cores. Fixed at
/// initialisation apart from [`Self::add_device_page`].
pub struct SharedSystemMap {
    entries: [Descriptor; 32],
    /// The slot holding each core's private stack page
    core_page: u32,
    /// How many slots are populated
    mapped_pages: u32,
}

impl SharedSystemMap {
    pub const fn new() -> Self {
        Self {
            entries: [Descriptor::new(); 32],
            core_page: 0,
            mapped_pages: 0,
        }
    }

    /// Builds the shared part from the system driver's code and data
    /// pages.
    pub fn initialise(&mut self, system_driver: &DriverInfo) {
        let mut index = 0;
        for page in 0..system_driver.code_pages {
            self.entries[index] = Descriptor::page_at(system_driver.start + (page << 12))
                .el0_read_execute()
                .write_back_memory()
                .with_shareability(0) // Never changes, no need to share
                .with_not_global(true)
                .with_access_flag(true);
            index += 1;
        }
        for page in 0..system_driver.data_pages {
            self.entries[index] = Descriptor::page_at(system_driver.data_start() + (page << 12))
                .el0_read_write()
                .write_back_memory()
                .with_shareability(3) // Inner shareable
                .with_not_global(true)
                .with_access_flag(true);
            index += 1;
        }
        self.core_page = index as u32; // Fixed, from now on
        self.mapped_pages = index as u32 + 1;
    }

    /// Installs a device page at the system-map slot for `va`; permanent.
    /// Returns the virtual address actually mapped.
    pub fn add_device_page(&mut self, core: &mut Core, pa: u64, va: u64) -> u64 {
        let page = (va >> 12) as usize;
        if page >= self.entries.len() {
            blue_screen!("device page slot {page} beyond the system map");
        }
        let entry = Descriptor::page_at(pa)
            .device_memory()
            .el0_read_write()
            .with_shareability(3)
            .with_not_global(true)
            .with_access_flag(true);
        if self.entries[page].valid() {
            if u64::from(self.entries[page]) != u64::from(entry) {
                blue_screen!("device page slot {page} already mapped elsewhere");
            }
        } else {
            self.entries[page] = entry;
        }
        core.tt_l3[page] = entry;
        if page as u32 >= self.mapped_pages {
            self.mapped_pages = page as u32 + 1;
        }
        (page as u64) << 12
    }

    /// Propagates shared-map changes made on another core into this
    /// core's live level-3 table.
    pub fn refresh(&self, core: &mut Core) {
        for page in (self.core_page + 1) as usize..self.mapped_pages as usize {
            core.tt_l3[page] = self.entries[page];
        }
    }
}

/// Loads the system map: fully populated before entry, so there will never
/// be a fault while it is active. The core's own stack page appears after
/// the driver's data.
fn load_system_map(shared: &SharedSystemMap, core: &mut Core) {
    core.tt_l1[0] = Descriptor::subtable_at(core.tt_l2_physical());
    core.tt_l2[0] = Descriptor::subtable_at(core.tt_l3_physical());

    for page in 0..shared.mapped_pages as usize {
        core.tt_l3[page] = shared.entries[page];
    }

    core.tt_l3[shared.core_page as usize] = Descriptor::page_at(core.system_stack_physical())
        .el0_read_write()
        .write_back_memory()
        .with_shareability(0) // Core local
        .with_not_global(true)
        .with_access_flag(true);

    core.loaded_map = SYSTEM_MAP;
}

/// Loads the memory-allocator map: all of physical memory uncached at VA
/// zero, the driver's code above it. Fully populated; a fault while it is
/// active is fatal.
fn load_memory_allocator_map(core: &mut Core, allocator: &DriverInfo) {
    /// The map exposes this much physical address space to the allocator.
    const MAX_PHYSICAL_MEMORY_GB: usize = 8;

    for gb in 0..MAX_PHYSICAL_MEMORY_GB {
        // The driver never reads mapped memory, and the system code
        // flushes TLBs and caches before releasing pages to it.
        core.tt_l1[gb] = Descriptor::block_at((gb as u64) << 30)
            .el0_read_write()
            .uncached_memory()
            .with_shareability(0)
            .with_not_global(true)
            .with_access_flag(true);
    }

    core.tt_l1[MAX_PHYSICAL_MEMORY_GB] = Descriptor::subtable_at(core.tt_l2_physical());
    core.tt_l2[0] = Descriptor::subtable_at(core.tt_l3_physical());

    for page in 0..allocator.code_pages as usize {
        core.tt_l3[page] = Descriptor::page_at(allocator.start + ((page as u64) << 12))
            .el0_read_execute()
            .write_back_memory()
            .with_shareability(1)
            .with_not_global(true)
            .with_access_flag(true);
    }
    for page in 0..allocator.data_pages as usize {
        core.tt_l3[allocator.code_pages as usize + page] =
            Descriptor::page_at(allocator.data_start() + ((page as u64) << 12))
                .el0_read_write()
                .write_back_memory()
                .with_shareability(1)
                .with_not_global(true)
                .with_access_flag(true);
    }

    core.loaded_map = MEMORY_ALLOCATOR_MAP;
}

/// Makes `new_map`'s stage-1 tables live on this core.
pub fn load_this_map(state: &mut KernelState, core: &mut Core, new_map: InterfaceIndex) {
    if core.loaded_map == new_map {
        return;
    }

    core.clear_translation_tables();

    if new_map == MEMORY_ALLOCATOR_MAP {
        load_memory_allocator_map(core, &super::init::driver_table()[1]);
    } else if new_map == SYSTEM_MAP {
        load_system_map(&state.system_map, core);
    }
    // Any other map fills in through demand faults.

    core.loaded_map = new_map;
    machine::dsb_sy();
    // The ASID change retires cached walks for the previous map.
    // SAFETY: The level-1 table belongs to this core
    unsafe {
        machine::load_user_tables(core.tt_l1_physical(), new_map.raw() as u16);
    }
}

/// Switches `thread` into `new_map`, loading its tables if necessary.
pub fn change_map(
    state: &mut KernelState,
    core: &mut Core,
    thread: ThreadCode,
    new_map: InterfaceIndex,
) {
    if state.interfaces.lookup(new_map.register()).is_none() {
        blue_screen!("change to invalid map {}", new_map.raw());
    }

    // The memory-allocator map may only be entered from the system map.
    if new_map == MEMORY_ALLOCATOR_MAP && core.loaded_map != SYSTEM_MAP {
        blue_screen!("memory allocator map entered from map {}", core.loaded_map.raw());
    }

    load_this_map(state, core, new_map);

    if core.loaded_map != new_map {
        blue_screen!("map load failed");
    }

    state.threads.context_mut(thread).current_map = new_map;
}

/// Outcome of a demand fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemandFault {
    /// A descriptor is installed; retry the access.
    Mapped,
    /// No VMB covers the address: the thread takes an unnamed exception.
    NoBacking,
}

/// Reads the `index`th VMB of the map described by `value`.
fn read_vmb(state: &KernelState, value: MapValue, index: u32) -> VirtualMemoryBlock {
    let base = state.heap.pointer_from_offset_lsr4(value.heap_offset_lsr4());
    // SAFETY: The offset was range-checked by the caller and the array
    // bound comes from the map's own capacity word
    let raw = unsafe { base.cast::<u64>().add(index as usize).read() };
    VirtualMemoryBlock::from(raw)
}

/// Finds the VMB covering the faulting address, if any.
fn find_vmb(state: &KernelState, map: InterfaceIndex, fault_address: u64) -> Option<VirtualMemoryBlock> {
    let fault_page = fault_address >> LEVEL3_LSB;
    let value = MapValue::from(state.interfaces.get(map).object);

    if !state.heap.contains_lsr4(value.heap_offset_lsr4()) {
        blue_screen!("map {} has a VMB array outside the heap", map.raw());
    }

    for index in 0..value.number_of_vmbs() {
        let vmb = read_vmb(state, value, index);
        if vmb.page_count() == 0 {
            break;
        }
        let offset = fault_page.wrapping_sub(vmb.start_page() as u64);
        if offset < vmb.page_count() as u64 {
            return Some(vmb);
        }
    }

    None
}

fn is_level_aligned(start_page: u32, page_count: u32, level_pages: u32) -> bool {
    start_page & (level_pages - 1) == 0 && page_count >= level_pages
}

/// Intersects the VMB's permissions into a descriptor.
fn with_virtual_memory_attrs(entry: Descriptor, vmb: VirtualMemoryBlock) -> Descriptor {
    let entry = entry
        .with_shareability(3)
        .with_not_global(true)
        .with_access_flag(true);
    match (vmb.read_only(), vmb.executable()) {
        (true, true) => entry.el0_read_execute(),
        (true, false) => entry.el0_read_only(),
        (false, true) => entry.el0_read_write_execute(),
        (false, false) => entry.el0_read_write(),
    }
}

fn with_physical_memory_attrs(entry: Descriptor, cmb: ContiguousMemoryBlock) -> Descriptor {
    entry.with_memory_type(cmb.memory_type())
}

/// Handles an instruction or data abort from EL0: walks the current map's
/// VMBs and installs the largest descriptor both the VMB and its CMB are
/// aligned for.
pub fn find_and_map(
    state: &mut KernelState,
    core: &mut Core,
    map: InterfaceIndex,
    fault_address: u64,
) -> DemandFault {
    if map == SYSTEM_MAP {
        blue_screen!("fault in the system map at {fault_address:#x}");
    }
    if map == MEMORY_ALLOCATOR_MAP {
        blue_screen!("fault in the memory allocator map at {fault_address:#x}");
    }

    let Some(vmb) = find_vmb(state, map, fault_address) else {
        return DemandFault::NoBacking;
    };

    let Some(provider_index) = state.interfaces.lookup(vmb.memory_block().into()) else {
        blue_screen!("VMB backed by invalid interface {}", vmb.memory_block());
    };
    let provider = state.interfaces.get(provider_index);
    if provider.provider != SYSTEM_MAP || provider.handler != system_service::PHYSICAL_MEMORY_BLOCK
    {
        // No non-memory-manager memory areas supported yet.
        blue_screen!("VMB backed by a non-memory interface");
    }
    let cmb = ContiguousMemoryBlock::from(provider.object);

    let physical_start = (cmb.start_page() as u64) << 12;
    let virtual_start = (vmb.start_page() as u64) << 12;
    let fa = fault_address;

    let entry;
    let entry_location: &mut Descriptor;
    if is_level_aligned(vmb.start_page(), vmb.page_count(), L1_PAGES)
        && is_level_aligned(cmb.start_page(), cmb.page_count(), L1_PAGES)
    {
        entry = Descriptor::block_at(physical_start + ((fa - virtual_start) & !((1 << LEVEL1_LSB) - 1)));
        entry_location = &mut core.tt_l1[(fa >> LEVEL1_LSB) as usize & (L1_ENTRIES - 1)];
    } else {
        core.tt_l1[(fa >> LEVEL1_LSB) as usize & (L1_ENTRIES - 1)] =
            Descriptor::subtable_at(core.tt_l2_physical());
        if is_level_aligned(vmb.start_page(), vmb.page_count(), L2_PAGES)
            && is_level_aligned(cmb.start_page(), cmb.page_count(), L2_PAGES)
        {
            entry = Descriptor::block_at(
                physical_start + ((fa - virtual_start) & !((1 << LEVEL2_LSB) - 1)),
            );
            entry_location = &mut core.tt_l2[(fa >> LEVEL2_LSB) as usize & 511];
        } else {
            core.tt_l2[(fa >> LEVEL2_LSB) as usize & 511] =
                Descriptor::subtable_at(core.tt_l3_physical());
            entry = Descriptor::page_at(
                physical_start + ((fa - virtual_start) & !((1 << LEVEL3_LSB) - 1)),
            );
            entry_location = &mut core.tt_l3[(fa >> LEVEL3_LSB) as usize & 511];
        }
    }

    let entry = with_virtual_memory_attrs(with_physical_memory_attrs(entry, cmb), vmb);
    *entry_location = entry;
    machine::dsb_sy();

    DemandFault::Mapped
}

/// Builds the capability and VMB array for a fresh map over the given
/// driver image, returning the map's index.
pub fn create_driver_map(
    state: &mut KernelState,
    driver: &DriverInfo,
    initial_vmbs: u32,
) -> InterfaceIndex {
    let map_interface = state.interfaces.obtain().unwrap_or_else(|_| {
        blue_screen!("out of interfaces while creating driver maps");
    });
    let code_interface = state.interfaces.obtain().unwrap_or_else(|_| {
        blue_screen!("out of interfaces while creating driver maps");
    });
    let data_interface = state.interfaces.obtain().unwrap_or_else(|_| {
        blue_screen!("out of interfaces while creating driver maps");
    });

    if driver.start & 0xfff != 0 || driver.end & 0xfff != 0 {
        blue_screen!("driver image not page aligned");
    }

    let vmb_offset = state.heap.allocate(u64::from(initial_vmbs) * 8);
    let value = MapValue::new()
        .with_heap_offset_lsr4(state.heap.offset_lsr4(vmb_offset))
        .with_map_object(map_interface.raw())
        .with_number_of_vmbs(initial_vmbs);

    let vmbs: [u64; 3] = [
        VirtualMemoryBlock::new()
            .with_start_page(0)
            .with_page_count(driver.code_pages as u32)
            .with_read_only(true)
            .with_executable(true)
            .with_memory_block(code_interface.raw())
            .into(),
        VirtualMemoryBlock::new()
            .with_start_page(driver.code_pages as u32)
            .with_page_count(driver.data_pages as u32)
            .with_read_only(false)
            .with_executable(false)
            .with_memory_block(data_interface.raw())
            .into(),
        0, // Terminator
    ];
    state
        .heap
        .write(vmb_offset.into(), 48, vmbs.as_ptr().cast());

    *state.interfaces.get_mut(map_interface) = super::interface::Interface {
        user: map_interface,
        provider: SYSTEM_MAP,
        handler: system_service::MAP,
        object: value.into(),
    };

    *state.interfaces.get_mut(code_interface) = super::interface::Interface {
        user: map_interface,
        provider: SYSTEM_MAP,
        handler: system_service::PHYSICAL_MEMORY_BLOCK,
        object: ContiguousMemoryBlock::new()
            .with_start_page((driver.start >> 12) as u32)
            .with_page_count(driver.code_pages as u32)
            .with_memory_type(MemoryType::WriteBack)
            .into(),
    };

    *state.interfaces.get_mut(data_interface) = super::interface::Interface {
        user: map_interface,
        provider: SYSTEM_MAP,
        handler: system_service::PHYSICAL_MEMORY_BLOCK,
        object: ContiguousMemoryBlock::new()
            .with_start_page((driver.data_start() >> 12) as u32)
            .with_page_count(driver.data_pages as u32)
            .with_memory_type(MemoryType::WriteBack)
            .into(),
    };

    map_interface
}

#[cfg(test)]
mod tests {
    use super::super::{per_core::Core, KernelState};
    use super::{
        ContiguousMemoryBlock, DemandFault, MapValue, VirtualMemoryBlock, find_and_map,
    };
    use crate::architecture::vmsa::MemoryType;
    use crate::{add_test, kernel::interface::{system_service, Interface, InterfaceIndex, SYSTEM_MAP}};

    add_test!(packed_words_match_the_abi, {
        // VMB: start_page [23:0], page_count [43:24], read_only bit 44,
        // executable bit 45, memory_block [63:46].
        let vmb = VirtualMemoryBlock::new()
            .with_start_page(0x123)
            .with_page_count(0x45)
            .with_read_only(true)
            .with_memory_block(7);
        let raw: u64 = vmb.into();
        assert_eq!(raw & 0xff_ffff, 0x123);
        assert_eq!((raw >> 24) & 0xf_ffff, 0x45);
        assert_eq!((raw >> 44) & 1, 1);
        assert_eq!((raw >> 45) & 1, 0);
        assert_eq!(raw >> 46, 7);

        // CMB: memory_type lives in the top three bits.
        let cmb = ContiguousMemoryBlock::new()
            .with_start_page(1)
            .with_memory_type(MemoryType::WriteBack);
        let raw: u64 = cmb.into();
        assert_eq!(raw & 0xff_ffff, 1);
        assert_eq!(raw >> 61, 5);

        // MapValue: heap offset in the low word.
        let value = MapValue::new()
            .with_heap_offset_lsr4(0x40)
            .with_map_object(3)
            .with_number_of_vmbs(8);
        let raw: u64 = value.into();
        assert_eq!(raw & 0xffff_ffff, 0x40);
        assert_eq!((raw >> 32) & 0xf_ffff, 3);
        assert_eq!(raw >> 52, 8);
    });

    #[repr(align(16))]
    struct Backing([u8; 512]);

    /// A state with one driver map (index 3) whose single VMB covers
    /// `page_count` pages at `0x4000_0000`, backed by write-back memory at
    /// `0x8000_0000`.
    fn state_with_map(
        page_count: u32,
    ) -> (&'static mut KernelState, &'static mut Core, InterfaceIndex) {
        static mut BACKING: Backing = Backing([0; 512]);
        let (state, core) = crate::kernel::testing::fixture();
        core.loaded_map = SYSTEM_MAP;
        // SAFETY: The backing store belongs to this test alone
        unsafe {
            state
                .heap
                .init(core::ptr::addr_of_mut!(BACKING).cast(), 512);
        }
        state.interfaces.grow(16);
        let map = state.interfaces.obtain().unwrap();
        let block = state.interfaces.obtain().unwrap();

        let vmb_offset = state.heap.allocate(16);
        let vmbs: [u64; 2] = [
            VirtualMemoryBlock::new()
                .with_start_page(0x4000_0000 >> 12)
                .with_page_count(page_count)
                .with_memory_block(block.raw())
                .into(),
            0,
        ];
        state.heap.write(vmb_offset.into(), 16, vmbs.as_ptr().cast());

        *state.interfaces.get_mut(map) = Interface {
            user: map,
            provider: SYSTEM_MAP,
            handler: system_service::MAP,
            object: MapValue::new()
                .with_heap_offset_lsr4(state.heap.offset_lsr4(vmb_offset))
                .with_map_object(map.raw())
                .with_number_of_vmbs(2)
                .into(),
        };
        *state.interfaces.get_mut(block) = Interface {
            user: map,
            provider: SYSTEM_MAP,
            handler: system_service::PHYSICAL_MEMORY_BLOCK,
            object: ContiguousMemoryBlock::new()
                .with_start_page(0x8000_0000 >> 12)
                .with_page_count(page_count)
                .with_memory_type(MemoryType::WriteBack)
                .into(),
        };
        (state, core, map)
    }

    add_test!(mutually_aligned_2mb_blocks_fault_in_at_level_2, {
        let (state, core, map) = state_with_map(0x400);

        let outcome = find_and_map(state, core, map, 0x4000_1234);
        assert_eq!(outcome, DemandFault::Mapped);

        // One L2 block, physical 0x8000_0000, write-back, user-writable.
        let entry = core.tt_l2[(0x4000_1234_u64 >> 21) as usize & 511];
        assert!(entry.valid());
        assert!(!entry.table());
        assert_eq!(entry.page_number() << 12, 0x8000_0000);
        assert_eq!(entry.memory_type(), MemoryType::WriteBack);
        assert!(entry.el0_accessible());

        // An access 2 MB on faults separately and installs the next block.
        let outcome = find_and_map(state, core, map, 0x4020_0000);
        assert_eq!(outcome, DemandFault::Mapped);
        let entry = core.tt_l2[(0x4020_0000_u64 >> 21) as usize & 511];
        assert_eq!(entry.page_number() << 12, 0x8020_0000);
    });

    add_test!(mutually_aligned_1gb_blocks_fault_in_at_level_1, {
        // One gigabyte of pages on both sides, gigabyte-aligned starts.
        let (state, core, map) = state_with_map(0x4_0000);

        let outcome = find_and_map(state, core, map, 0x4000_1234);
        assert_eq!(outcome, DemandFault::Mapped);

        // One L1 block in the 16-entry table, physical 0x8000_0000.
        let entry = core.tt_l1[(0x4000_1234_u64 >> 30) as usize & 15];
        assert!(entry.valid());
        assert!(!entry.table());
        assert_eq!(entry.page_number() << 12, 0x8000_0000);
        assert_eq!(entry.memory_type(), MemoryType::WriteBack);
        assert!(entry.el0_accessible());

        // Nothing spilled into the lower-level tables.
        assert!(!core.tt_l2[(0x4000_1234_u64 >> 21) as usize & 511].valid());
    });

    add_test!(unaligned_lengths_fall_back_to_pages, {
        let (state, core, map) = state_with_map(3);

        let outcome = find_and_map(state, core, map, 0x4000_2010);
        assert_eq!(outcome, DemandFault::Mapped);
        let entry = core.tt_l3[(0x4000_2010_u64 >> 12) as usize & 511];
        assert!(entry.valid());
        assert!(entry.table());
        assert_eq!(entry.page_number() << 12, 0x8000_2000);
    });

    add_test!(uncovered_addresses_have_no_backing, {
        let (state, core, map) = state_with_map(1);
        let outcome = find_and_map(state, core, map, 0x7000_0000);
        assert_eq!(outcome, DemandFault::NoBacking);
    });
}
