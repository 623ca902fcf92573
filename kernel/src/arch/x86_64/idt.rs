/// Interrupt Descriptor Table and the common dispatch fabric.
///
/// Every vector enters through its assembly stub (stubs.rs), which
/// normalizes the stack into an `InterruptFrame` and calls
/// `common_interrupt_handler`. A 256-slot handler table routes each
/// vector; anything unrouted is fatal. Only the breakpoint handler
/// returns, resuming the interrupted code via iretq.
use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::gdt;
use super::stubs::interrupt_stubs;
use crate::serial_println;

/// Register frame as laid out by the stubs, low to high address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub interrupt_number: u64,
    /// CPU-pushed error code, or the stub's zero placeholder.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

static_assertions::const_assert_eq!(size_of::<InterruptFrame>(), 176);

/// IDT gate (16 bytes on x86_64).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0, // NOT present
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }

    /// Present interrupt gate, DPL=0, IST disabled. IF is cleared on
    /// entry, so the dispatcher never re-enters itself on one core.
    pub fn interrupt_gate(handler: u64) -> Self {
        Self {
            offset_low: handler as u16,
            selector: gdt::KERNEL_CS,
            ist: 0,
            type_attr: 0x8E, // present | interrupt gate | DPL=0
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            _reserved: 0,
        }
    }

    /// Reassembled handler address.
    pub fn offset(&self) -> u64 {
        self.offset_low as u64 | ((self.offset_mid as u64) << 16) | ((self.offset_high as u64) << 32)
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn type_attr(&self) -> u8 {
        self.type_attr
    }

    pub fn ist_index(&self) -> u8 {
        self.ist
    }
}

static_assertions::const_assert_eq!(size_of::<IdtEntry>(), 16);

/// The IDT: 256 gates.
#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    /// One gate per vector, each pointing at that vector's stub.
    fn build() -> Self {
        let mut idt = Idt {
            entries: [IdtEntry::missing(); 256],
        };
        // Safety: the stub table is link-time constant.
        let stubs = unsafe { &interrupt_stubs };
        for (vector, entry) in idt.entries.iter_mut().enumerate() {
            *entry = IdtEntry::interrupt_gate(stubs[vector]);
        }
        idt
    }

    /// Load this IDT into the CPU via LIDT.
    fn load(&'static self) {
        let ptr = IdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };

        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &ptr, options(readonly, nostack));
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

/// Global IDT instance, built once on the BSP and shared by every core.
static IDT: spin::Once<Idt> = spin::Once::new();

/// A registered vector handler. Breakpoint-style handlers return and the
/// interrupted code resumes; fatal ones never do.
pub type InterruptHandler = fn(&mut InterruptFrame);

const NO_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Per-vector handler slots: fn-pointer addresses, 0 = unrouted. Read
/// from interrupt context, written by `register_handler`.
static HANDLERS: [AtomicUsize; 256] = [NO_HANDLER; 256];

/// Install `handler` for `vector`, replacing any prior handler. Callers
/// registering after interrupts are live accept the window in which the
/// old slot may still be read.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    HANDLERS[vector as usize].store(handler as usize, Ordering::Relaxed);
}

fn handler_for(vector: usize) -> Option<InterruptHandler> {
    let raw = HANDLERS[vector].load(Ordering::Relaxed);
    if raw == 0 {
        None
    } else {
        // Safety: slots only ever hold addresses of `InterruptHandler` fns.
        Some(unsafe { core::mem::transmute::<usize, InterruptHandler>(raw) })
    }
}

/// Build the IDT, register the default exception handlers, and load it.
///
/// # Safety
/// BSP only, once, after `gdt::init` and before interrupts are enabled.
pub unsafe fn init() {
    register_handler(0, divide_error_handler);
    register_handler(1, debug_handler);
    register_handler(2, nmi_handler);
    register_handler(3, breakpoint_handler);
    register_handler(14, page_fault_handler);

    IDT.call_once(Idt::build).load();
}

/// Load the already-built IDT on this core (AP path).
pub fn load() {
    IDT.get().expect("IDT not built before AP load").load();
}

/// Common entry from the assembly stubs; `frame` is the normalized
/// register frame the epilogue pushed.
#[no_mangle]
pub extern "C" fn common_interrupt_handler(frame: &mut InterruptFrame) {
    let vector = (frame.interrupt_number & 0xFF) as usize;
    match handler_for(vector) {
        Some(handler) => handler(frame),
        None => {
            serial_println!("!!! UNHANDLED INTERRUPT {} !!!", vector);
            serial_println!("  Error code: {:#x}", frame.error_code);
            report_frame(frame);
            super::halt_loop();
        }
    }
}

fn report_frame(frame: &InterruptFrame) {
    serial_println!("  RIP:     {:#x}", frame.rip);
    serial_println!("  CS:      {:#x}", frame.cs);
    serial_println!("  RFLAGS:  {:#x}", frame.rflags);
    serial_println!("  RSP:     {:#x}", frame.rsp);
}

fn fatal_exception(name: &str, frame: &InterruptFrame) -> ! {
    serial_println!("!!! CPU EXCEPTION: {} !!!", name);
    serial_println!("  Error code: {:#x}", frame.error_code);
    report_frame(frame);
    super::halt_loop()
}

fn divide_error_handler(frame: &mut InterruptFrame) {
    fatal_exception("Division by zero (#DE)", frame);
}

fn debug_handler(frame: &mut InterruptFrame) {
    fatal_exception("Debug (#DB)", frame);
}

fn nmi_handler(frame: &mut InterruptFrame) {
    fatal_exception("Non-maskable interrupt (#NMI)", frame);
}

/// Breakpoints resume: log and return through iretq.
fn breakpoint_handler(frame: &mut InterruptFrame) {
    serial_println!("[int] breakpoint at {:#x}", frame.rip);
}

bitflags::bitflags! {
    /// Page-fault error code bits as pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u64 {
        /// Set: protection violation. Clear: non-present page.
        const PROTECTION = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The fault came from CPL=3.
        const USER = 1 << 2;
        /// A reserved bit was set in a paging structure.
        const RESERVED = 1 << 3;
        /// The fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

fn page_fault_handler(frame: &mut InterruptFrame) {
    // CR2 holds the faulting address.
    let cr2: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nostack, nomem));
    }
    let code = PageFaultCode::from_bits_truncate(frame.error_code);

    serial_println!("!!! PAGE FAULT !!!");
    serial_println!("  Address: {:#x}", cr2);
    serial_println!("  Error:   {:#x} ({:?})", frame.error_code, code);
    report_frame(frame);
    super::halt_loop();
}
