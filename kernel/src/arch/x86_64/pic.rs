/// 8259 PIC (Programmable Interrupt Controller) remap and mask.
///
/// The legacy PIC maps IRQ 0-7 to interrupts 8-15, which collides with
/// CPU exceptions. We remap IRQs to 32-47 and then mask all of them: no
/// hardware IRQ handlers exist yet, and a spurious line that fires anyway
/// lands in the stub table and reaches the dispatcher with its true
/// vector number.

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x11; // initialization + ICW4 needed
const ICW4_8086: u8 = 0x01; // 8086 mode

/// Remap the PIC clear of the CPU exception range, then mask all IRQs.
///
/// # Safety
/// Must be called during early boot, before interrupts are enabled.
pub unsafe fn init() {
    use super::outb;

    // ICW1: start initialization sequence
    outb(PIC1_CMD, ICW1_INIT);
    io_wait();
    outb(PIC2_CMD, ICW1_INIT);
    io_wait();

    // ICW2: vector offsets
    outb(PIC1_DATA, 32); // IRQ 0-7  -> INT 32-39
    io_wait();
    outb(PIC2_DATA, 40); // IRQ 8-15 -> INT 40-47
    io_wait();

    // ICW3: tell PICs about each other
    outb(PIC1_DATA, 4); // slave on IRQ2
    io_wait();
    outb(PIC2_DATA, 2); // cascade identity
    io_wait();

    // ICW4: 8086 mode
    outb(PIC1_DATA, ICW4_8086);
    io_wait();
    outb(PIC2_DATA, ICW4_8086);
    io_wait();

    // Mask ALL IRQs
    outb(PIC1_DATA, 0xFF);
    outb(PIC2_DATA, 0xFF);
}

/// Small I/O delay for PIC initialization.
fn io_wait() {
    // Writing to port 0x80 is a common way to add a small delay
    super::outb(0x80, 0);
}
