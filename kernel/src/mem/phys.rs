/// Physical frame allocator, bitmap-backed.
///
/// Tracks one bit per 4 KiB frame over everything up to the highest
/// usable physical address. Built from the bootloader memory map before
/// any other allocator exists: the bitmap itself is placed in the first
/// usable region large enough to hold it, reached through the HHDM.
use core::fmt;

use spin::{Mutex, Once};

use super::bitmap::{words_for, BitState, Bitmap};

pub const PAGE_SIZE: usize = 4096;

/// The Higher-Half Direct Map: the window the bootloader sets up where
/// physical address P is mapped at virtual address P + offset. Boot code
/// builds one from the HHDM response and hands it to `init`, which only
/// needs it to reach the bitmap buffer; nothing else holds the offset.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(self) -> u64 {
        self.offset
    }

    /// Virtual pointer through the window for a physical address.
    pub fn ptr_to<T>(self, addr: PhysAddr) -> *mut T {
        (addr.as_u64() + self.offset) as *mut T
    }
}

/// A physical byte address, with the frame arithmetic the allocator
/// hands out and takes back.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// First byte of frame `frame`.
    pub const fn from_frame(frame: usize) -> Self {
        Self((frame * PAGE_SIZE) as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Index of the frame this address falls in.
    pub const fn frame(self) -> usize {
        self.0 as usize / PAGE_SIZE
    }

    pub const fn is_frame_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phys:{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

/// One bootloader memory-map entry, reduced to what frame accounting
/// needs.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: u64,
    pub length: u64,
    pub usable: bool,
}

/// Highest usable physical address, inclusive.
pub fn max_physical_address(regions: &[Region]) -> Option<u64> {
    regions
        .iter()
        .filter(|r| r.usable)
        .map(|r| r.base + r.length - 1)
        .max()
}

/// Physical base of the first usable region that can host a bitmap of
/// `bytes` bytes.
pub fn bitmap_placement(regions: &[Region], bytes: usize) -> Option<u64> {
    regions
        .iter()
        .find(|r| r.usable && r.length >= bytes as u64)
        .map(|r| r.base)
}

pub struct FrameAllocator<'a> {
    bitmap: Bitmap<&'a mut [u64]>,
    physical_usable_memory_start: u64,
    physical_memory_size: u64,
    virtual_kernel_space_start: u64,
    /// Frame index hint: always free while any frame is, `None` once the
    /// bitmap filled up.
    next_available_frame: Option<usize>,
}

impl<'a> FrameAllocator<'a> {
    /// Build the allocator over `buffer`, which holds the bitmap words
    /// and starts at physical address `bitmap_base` inside a usable
    /// region.
    ///
    /// Every tracked frame starts allocated; only whole frames inside
    /// usable regions are handed back. Frames overlapping non-usable
    /// entries, or sitting in gaps the map doesn't describe, stay
    /// allocated forever, as do the frames backing the bitmap itself.
    pub fn new(
        regions: &[Region],
        kernel_virtual_base: u64,
        buffer: &'a mut [u64],
        bitmap_base: u64,
    ) -> Result<Self, AllocError> {
        let max_addr = max_physical_address(regions).ok_or(AllocError::OutOfMemory)?;
        let total_frames = ((max_addr + 1) as usize).div_ceil(PAGE_SIZE);

        let mut bitmap =
            Bitmap::from_slice(buffer, total_frames).map_err(|_| AllocError::OutOfMemory)?;
        mark(&mut bitmap, 0, total_frames, BitState::Allocated);

        for region in regions.iter().filter(|r| r.usable) {
            let first = (region.base as usize).div_ceil(PAGE_SIZE);
            let last = (((region.base + region.length) as usize) / PAGE_SIZE).min(total_frames);
            if first < last {
                mark(&mut bitmap, first, last - first, BitState::Free);
            }
        }

        let bitmap_bytes = words_for(total_frames) * core::mem::size_of::<u64>();
        let first_bitmap_frame = bitmap_base as usize / PAGE_SIZE;
        let last_bitmap_frame = (bitmap_base as usize + bitmap_bytes).div_ceil(PAGE_SIZE);
        mark(
            &mut bitmap,
            first_bitmap_frame,
            last_bitmap_frame - first_bitmap_frame,
            BitState::Allocated,
        );

        let physical_usable_memory_start = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.base)
            .min()
            .unwrap_or(0);

        let next_available_frame = bitmap.find_first_free().ok();
        Ok(Self {
            bitmap,
            physical_usable_memory_start,
            physical_memory_size: max_addr + 1,
            virtual_kernel_space_start: kernel_virtual_base,
            next_available_frame,
        })
    }

    /// Hand out one free frame. The returned address is page-aligned and
    /// never reappears until a matching `free_page`.
    pub fn get_page(&mut self) -> Result<PhysAddr, AllocError> {
        let frame = self.next_available_frame.ok_or(AllocError::OutOfMemory)?;
        self.bitmap
            .set(frame, BitState::Allocated)
            .map_err(|_| AllocError::OutOfMemory)?;
        self.next_available_frame = self.bitmap.find_first_free().ok();
        Ok(PhysAddr::from_frame(frame))
    }

    /// Return a frame previously handed out by `get_page`. An unaligned,
    /// untracked or already-free address is a kernel bug.
    pub fn free_page(&mut self, addr: PhysAddr) {
        assert!(addr.is_frame_aligned(), "free_page: unaligned address {:?}", addr);
        let frame = addr.frame();
        assert!(
            matches!(self.bitmap.is_set(frame), Ok(true)),
            "free_page: {:?} was not allocated",
            addr
        );
        let _ = self.bitmap.set(frame, BitState::Free);
        if self.next_available_frame.is_none() {
            self.next_available_frame = Some(frame);
        }
    }

    pub fn free_count(&self) -> usize {
        self.bitmap.free_entries()
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.capacity()
    }

    /// Whether a tracked frame is allocated.
    pub fn is_allocated(&self, frame: usize) -> bool {
        matches!(self.bitmap.is_set(frame), Ok(true))
    }

    /// Byte address of the first usable frame.
    pub fn usable_memory_start(&self) -> u64 {
        self.physical_usable_memory_start
    }

    /// Exclusive upper bound on tracked physical addresses.
    pub fn memory_size(&self) -> u64 {
        self.physical_memory_size
    }

    /// Virtual base the kernel image is linked at.
    pub fn kernel_space_start(&self) -> u64 {
        self.virtual_kernel_space_start
    }
}

/// Contiguous mark during construction. Callers clamp ranges to the
/// tracked frame count, so the set cannot go out of bounds.
fn mark(bitmap: &mut Bitmap<&mut [u64]>, start: usize, count: usize, state: BitState) {
    let marked = bitmap.set_contiguous(start, count, state);
    debug_assert!(marked.is_ok(), "construction mark {}+{} out of range", start, count);
}

/// Global frame allocator, built once on the BSP. Cross-core callers
/// serialize on the mutex.
static FRAME_ALLOCATOR: Once<Mutex<FrameAllocator<'static>>> = Once::new();

/// Build the global allocator from the boot memory map. Runs once on the
/// BSP before anything calls `get_page`; a map without a usable region
/// big enough for the bitmap is fatal.
pub fn init(regions: &[Region], direct_map: DirectMap, kernel_virtual_base: u64) {
    let max_addr = max_physical_address(regions).expect("no usable memory regions");
    let total_frames = ((max_addr + 1) as usize).div_ceil(PAGE_SIZE);
    let words = words_for(total_frames);
    let bytes = words * core::mem::size_of::<u64>();
    let bitmap_base =
        bitmap_placement(regions, bytes).expect("no usable region fits the frame bitmap");

    // Safety: the placement walk picked a usable region at least `bytes`
    // long, the direct map covers all of physical memory, and nothing
    // else runs this early.
    let buffer = unsafe {
        core::slice::from_raw_parts_mut(
            direct_map.ptr_to::<u64>(PhysAddr::new(bitmap_base)),
            words,
        )
    };
    let allocator = FrameAllocator::new(regions, kernel_virtual_base, buffer, bitmap_base)
        .expect("frame allocator construction failed");
    FRAME_ALLOCATOR.call_once(|| Mutex::new(allocator));
}

fn allocator() -> &'static Mutex<FrameAllocator<'static>> {
    FRAME_ALLOCATOR.get().expect("frame allocator not initialized")
}

/// Allocate one 4 KiB frame.
pub fn get_page() -> Result<PhysAddr, AllocError> {
    allocator().lock().get_page()
}

/// Free a frame previously returned by `get_page`.
pub fn free_page(addr: PhysAddr) {
    allocator().lock().free_page(addr);
}

pub fn free_count() -> usize {
    allocator().lock().free_count()
}

pub fn total_frames() -> usize {
    allocator().lock().total_frames()
}
