/// Unit tests for the memory subsystem: bitmap primitive and frame
/// allocator construction logic.
///
/// These exercise pure in-memory logic without any hardware access.
/// Run with: cargo test --target x86_64-unknown-linux-gnu --lib
use super::bitmap::{words_for, BitState, Bitmap, BitmapError};
use super::phys::{
    bitmap_placement, max_physical_address, DirectMap, FrameAllocator, PhysAddr, Region, PAGE_SIZE,
};

// ---- Bitmap primitive ----

#[test]
fn accounting_tracks_every_transition() {
    let mut bm: Bitmap<[u64; 2]> = Bitmap::with_capacity(100);
    assert_eq!(bm.free_entries(), 100);

    bm.set(3, BitState::Allocated).unwrap();
    bm.set(64, BitState::Allocated).unwrap();
    assert_eq!(bm.free_entries(), 98);

    bm.set(3, BitState::Free).unwrap();
    assert_eq!(bm.free_entries(), 99);
}

#[test]
fn double_set_is_idempotent() {
    let mut bm: Bitmap<[u64; 1]> = Bitmap::with_capacity(16);

    bm.set(5, BitState::Allocated).unwrap();
    bm.set(5, BitState::Allocated).unwrap();
    assert_eq!(bm.free_entries(), 15);

    bm.set(5, BitState::Free).unwrap();
    bm.set(5, BitState::Free).unwrap();
    assert_eq!(bm.free_entries(), 16);
}

#[test]
fn find_then_set_round_trip() {
    let mut bm: Bitmap<[u64; 1]> = Bitmap::with_capacity(32);

    let first = bm.find_first_free().unwrap();
    bm.set(first, BitState::Allocated).unwrap();
    assert!(bm.is_set(first).unwrap());

    let second = bm.find_first_free().unwrap();
    assert_ne!(first, second);

    bm.set(first, BitState::Free).unwrap();
    bm.set(second, BitState::Allocated).unwrap();
    assert_eq!(bm.find_first_free().unwrap(), first);
}

#[test]
fn out_of_bounds_indices_are_rejected() {
    let mut bm: Bitmap<[u64; 2]> = Bitmap::with_capacity(100);

    assert_eq!(bm.set(100, BitState::Allocated), Err(BitmapError::OutOfBounds));
    assert_eq!(bm.is_set(100), Err(BitmapError::OutOfBounds));
    assert!(bm.set(99, BitState::Allocated).is_ok());
}

#[test]
fn full_bitmap_fails_until_a_bit_frees() {
    let mut bm: Bitmap<[u64; 1]> = Bitmap::with_capacity(20);
    bm.set_contiguous(0, 20, BitState::Allocated).unwrap();

    assert!(bm.is_full());
    assert_eq!(bm.find_first_free(), Err(BitmapError::Full));

    bm.set(13, BitState::Free).unwrap();
    assert_eq!(bm.find_first_free(), Ok(13));
}

#[test]
fn rotation_prefers_last_hint() {
    let mut bm: Bitmap<[u64; 2]> = Bitmap::with_capacity(128);
    bm.set_contiguous(0, 64, BitState::Allocated).unwrap();

    assert_eq!(bm.find_first_free(), Ok(64));

    bm.set(10, BitState::Free).unwrap();
    // Hint still free: the search keeps returning it.
    assert_eq!(bm.find_first_free(), Ok(64));

    bm.set(64, BitState::Allocated).unwrap();
    assert_eq!(bm.find_first_free(), Ok(10));
}

#[test]
fn from_slice_checks_buffer_size() {
    let mut small = [0u64; 1];
    assert!(matches!(
        Bitmap::from_slice(&mut small, 100),
        Err(BitmapError::OutOfMemory)
    ));

    let mut dirty = [u64::MAX; 2];
    let bm = Bitmap::from_slice(&mut dirty, 100).unwrap();
    assert_eq!(bm.free_entries(), 100);
    assert!(!bm.is_set(7).unwrap());
}

#[test]
fn set_contiguous_stops_at_first_failure() {
    let mut bm: Bitmap<[u64; 1]> = Bitmap::with_capacity(10);

    let partial = bm.set_contiguous(8, 4, BitState::Allocated);
    assert_eq!(partial, Err(BitmapError::OutOfBounds));
    // Entries before the failing index keep the new state.
    assert!(bm.is_set(8).unwrap());
    assert!(bm.is_set(9).unwrap());
    assert_eq!(bm.free_entries(), 8);
}

// ---- Frame allocator ----

/// Memory map with two usable regions around a reserved hole:
/// frames 1..9 usable, frame 0xA reserved, frames 0xB..0x10B usable.
const TWO_REGION_MAP: [Region; 3] = [
    Region { base: 0x1000, length: 0x9000, usable: true },
    Region { base: 0xA000, length: 0x1000, usable: false },
    Region { base: 0xB000, length: 0x100000, usable: true },
];

const KERNEL_VIRT_BASE: u64 = 0xFFFF_FFFF_8000_0000;

fn two_region_allocator(buf: &mut [u64; 5]) -> FrameAllocator<'_> {
    FrameAllocator::new(&TWO_REGION_MAP, KERNEL_VIRT_BASE, buf, 0x1000).unwrap()
}

#[test]
fn construction_places_and_marks() {
    assert_eq!(max_physical_address(&TWO_REGION_MAP), Some(0x10AFFF));

    let frames = 0x10B;
    let bytes = words_for(frames) * 8;
    assert_eq!(bitmap_placement(&TWO_REGION_MAP, bytes), Some(0x1000));

    let mut buf = [0u64; 5];
    let alloc = two_region_allocator(&mut buf);
    assert_eq!(alloc.total_frames(), frames);
    assert_eq!(alloc.usable_memory_start(), 0x1000);
    assert_eq!(alloc.memory_size(), 0x10B000);
    assert_eq!(alloc.kernel_space_start(), KERNEL_VIRT_BASE);

    // Not described by any map entry.
    assert!(alloc.is_allocated(0));
    // Reserved entry.
    assert!(alloc.is_allocated(0xA));
    // The bitmap's own backing frame.
    assert!(alloc.is_allocated(1));
    // Plain usable frames.
    assert!(!alloc.is_allocated(2));
    assert!(!alloc.is_allocated(0xB));
}

#[test]
fn reserved_entries_are_fully_covered() {
    let mut buf = [0u64; 5];
    let alloc = two_region_allocator(&mut buf);

    for region in TWO_REGION_MAP.iter().filter(|r| !r.usable) {
        let first = region.base as usize / PAGE_SIZE;
        let last = ((region.base + region.length) as usize).div_ceil(PAGE_SIZE);
        for frame in first..last {
            assert!(alloc.is_allocated(frame), "frame {:#x} should be reserved", frame);
        }
    }
}

#[test]
fn first_page_after_boot() {
    let mut buf = [0u64; 5];
    let mut alloc = two_region_allocator(&mut buf);

    // Frame 0 is unmapped, frame 1 backs the bitmap; frame 2 is the first
    // frame the allocator may hand out.
    let page = alloc.get_page().unwrap();
    assert_eq!(page, PhysAddr::from_frame(2));
    assert_eq!(page.as_u64(), 0x2000);
    assert!(alloc.is_allocated(page.frame()));
}

#[test]
fn direct_map_window_arithmetic() {
    let map = DirectMap::new(0xFFFF_8000_0000_0000);
    assert_eq!(map.offset(), 0xFFFF_8000_0000_0000);
    let ptr = map.ptr_to::<u8>(PhysAddr::new(0x2000));
    assert_eq!(ptr as u64, 0xFFFF_8000_0000_2000);
}

#[test]
fn pages_are_distinct_and_aligned() {
    let mut buf = [0u64; 5];
    let mut alloc = two_region_allocator(&mut buf);

    let mut seen = [0u64; 32];
    for slot in 0..seen.len() {
        let page = alloc.get_page().unwrap().as_u64();
        assert_eq!(page as usize % PAGE_SIZE, 0);
        assert!(!seen[..slot].contains(&page));
        seen[slot] = page;
    }
}

#[test]
fn exhaustion_and_reuse() {
    // Four frames total; the bitmap sits in frame 0, leaving 1..4 usable.
    let map = [Region { base: 0, length: 0x4000, usable: true }];
    let mut buf = [0u64; 1];
    let mut alloc = FrameAllocator::new(&map, KERNEL_VIRT_BASE, &mut buf, 0).unwrap();

    assert_eq!(alloc.free_count(), 3);
    let a = alloc.get_page().unwrap();
    let b = alloc.get_page().unwrap();
    let c = alloc.get_page().unwrap();
    assert!(alloc.get_page().is_err());

    alloc.free_page(b);
    assert_eq!(alloc.get_page().unwrap(), b);
    assert!(alloc.get_page().is_err());

    alloc.free_page(a);
    alloc.free_page(c);
    assert_eq!(alloc.free_count(), 2);
}

#[test]
#[should_panic]
fn freeing_a_free_frame_is_a_bug() {
    let map = [Region { base: 0, length: 0x4000, usable: true }];
    let mut buf = [0u64; 1];
    let mut alloc = FrameAllocator::new(&map, KERNEL_VIRT_BASE, &mut buf, 0).unwrap();

    let page = alloc.get_page().unwrap();
    alloc.free_page(page);
    alloc.free_page(page);
}

#[test]
#[should_panic]
fn freeing_an_unaligned_address_is_a_bug() {
    let map = [Region { base: 0, length: 0x4000, usable: true }];
    let mut buf = [0u64; 1];
    let mut alloc = FrameAllocator::new(&map, KERNEL_VIRT_BASE, &mut buf, 0).unwrap();

    let page = alloc.get_page().unwrap();
    alloc.free_page(PhysAddr::new(page.as_u64() + 0x10));
}
