//! Pyrite kernel entry point.
//!
//! Booted by the Limine bootloader. Limine sets up long mode, page tables
//! (kernel in the upper 2 GiB + HHDM for all physical memory), and a
//! stack, then jumps to kmain on the BSP. The BSP builds the frame
//! allocator and its descriptor tables, enables interrupts, and releases
//! the APs through the MP response.
#![no_std]
#![no_main]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};

use limine::memory_map::EntryType;
use limine::mp::Cpu;
use limine::request::{
    ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest, MpRequest,
    RequestsEndMarker, RequestsStartMarker,
};
use limine::BaseRevision;

use pyrite_kernel::arch::x86_64::{self, cpu, gdt, idt, pic, serial};
use pyrite_kernel::mem::{self, phys};
use pyrite_kernel::serial_println;

// ---- Limine requests ----
// Must be #[used] and in the .requests section for Limine to discover them.

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[link_section = ".requests"]
static MP_REQUEST: MpRequest = MpRequest::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

extern "C" {
    /// Kernel image bounds from the linker script.
    static _kernel_start: u8;
    static _kernel_end: u8;
}

/// Cores that finished bring-up (GDT + IDT loaded). The BSP counts
/// itself; each AP claims its CPU index from this counter.
static BOOTED_CPUS: AtomicU64 = AtomicU64::new(0);

const MAX_REGIONS: usize = 128;

/// Kernel entry point, reached from Limine on the bootstrap processor.
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    serial::SERIAL.lock().init();
    serial_println!("Pyrite v0.1.0 booting...");

    assert!(BASE_REVISION.is_supported(), "Limine base revision not supported");
    serial_println!("[boot] Limine protocol OK");

    let hhdm = HHDM_REQUEST
        .get_response()
        .expect("Limine HHDM response missing");
    let direct_map = mem::DirectMap::new(hhdm.offset());
    serial_println!("[boot] HHDM offset: {:#x}", direct_map.offset());

    let kernel_address = EXECUTABLE_ADDRESS_REQUEST
        .get_response()
        .expect("Limine executable address response missing");
    serial_println!(
        "[boot] kernel phys {:#x} virt {:#x}, image {:#x}..{:#x}",
        kernel_address.physical_base(),
        kernel_address.virtual_base(),
        unsafe { &_kernel_start as *const u8 as u64 },
        unsafe { &_kernel_end as *const u8 as u64 },
    );

    if let Some(fb_response) = FRAMEBUFFER_REQUEST.get_response() {
        if let Some(fb) = fb_response.framebuffers().next() {
            serial_println!("[boot] framebuffer {}x{}, {} bpp", fb.width(), fb.height(), fb.bpp());
        }
    }

    // The allocator must exist before anything asks for a page.
    let memmap = MEMMAP_REQUEST
        .get_response()
        .expect("Limine memory map response missing");

    let mut regions = [phys::Region { base: 0, length: 0, usable: false }; MAX_REGIONS];
    let mut region_count = 0usize;
    let mut total_usable: u64 = 0;

    for entry in memmap.entries() {
        if region_count == MAX_REGIONS {
            serial_println!("[mem] memory map truncated to {} entries", MAX_REGIONS);
            break;
        }
        let usable = entry.entry_type == EntryType::USABLE;
        regions[region_count] = phys::Region {
            base: entry.base,
            length: entry.length,
            usable,
        };
        region_count += 1;
        if usable {
            total_usable += entry.length;
        }
    }
    serial_println!(
        "[mem] {} map entries, {} MiB usable",
        region_count,
        total_usable / (1024 * 1024)
    );

    phys::init(&regions[..region_count], direct_map, kernel_address.virtual_base());
    serial_println!(
        "[mem] frame allocator: {} of {} frames free",
        phys::free_count(),
        phys::total_frames()
    );

    // Descriptor tables before sti, on this core and every AP.
    unsafe { gdt::init(0) };
    serial_println!("[cpu] GDT+TSS loaded (BSP)");
    unsafe { pic::init() };
    serial_println!("[cpu] PIC remapped, IRQs masked");
    unsafe { idt::init() };
    serial_println!("[cpu] IDT loaded, dispatcher live");

    BOOTED_CPUS.store(1, Ordering::Relaxed);
    x86_64::sti();

    let vendor = cpu::vendor();
    serial_println!(
        "[cpu] vendor: {}",
        core::str::from_utf8(&vendor).unwrap_or("unknown")
    );

    // Breakpoint round trip: the handler logs and returns here.
    unsafe { core::arch::asm!("int3") };
    serial_println!("[int] breakpoint smoke test passed");

    start_aps();

    serial_println!("Pyrite boot complete.");
    loop {
        x86_64::hlt();
    }
}

/// Release every AP into `ap_entry`, bounded by the descriptor-table
/// capacity, then wait until all started cores report in.
fn start_aps() {
    let mp = MP_REQUEST.get_response().expect("Limine MP response missing");
    serial_println!(
        "[smp] {} cpus, BSP lapic id {}",
        mp.cpus().len(),
        mp.bsp_lapic_id()
    );

    let mut started: u64 = 1; // the BSP
    for cpu in mp.cpus() {
        if cpu.lapic_id == mp.bsp_lapic_id() {
            continue;
        }
        if started as usize == gdt::MAX_NUM_CORES {
            serial_println!("[smp] ignoring cpus beyond {}", gdt::MAX_NUM_CORES);
            break;
        }
        cpu.goto_address.write(ap_entry);
        started += 1;
    }

    while BOOTED_CPUS.load(Ordering::Relaxed) < started {
        core::hint::spin_loop();
    }
    serial_println!("[smp] {} cores online", started);
}

/// Per-AP entry, reached through the Limine MP trampoline. Mirrors the
/// BSP sequence: descriptor tables first, then interrupts.
unsafe extern "C" fn ap_entry(cpu: &Cpu) -> ! {
    let index = BOOTED_CPUS.fetch_add(1, Ordering::Relaxed) as usize;
    gdt::init(index);
    idt::load();
    x86_64::sti();
    serial_println!("[smp] cpu {} online (lapic id {})", index, cpu.lapic_id);
    loop {
        x86_64::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("!!! KERNEL PANIC !!!");
    serial_println!("{}", info);
    x86_64::halt_loop();
}
