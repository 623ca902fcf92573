/// Assembly vector trampolines.
///
/// Every vector 0-255 gets its own stub: push a zero placeholder when the
/// CPU supplies no error code, push the vector number, and fall into a
/// shared epilogue that saves the GPRs in the `InterruptFrame` order,
/// hands the frame pointer to `common_interrupt_handler`, restores the
/// GPRs, drops vector + error code, and returns with `iretq`. The stub
/// entry addresses are exported as the `interrupt_stubs` table; the frame
/// layout is the only contract between this file and the dispatcher.
use core::arch::global_asm;

global_asm!(
    r#"
.section .text

.altmacro

// Vectors 8, 10-14, 17, 21, 29 and 30 arrive with a CPU-pushed error
// code; every other stub pushes a zero so the frame shape is identical.
.macro vector_stub vec
vector_stub_\vec:
    .if (\vec == 8) || (\vec == 10) || (\vec == 11) || (\vec == 12) || (\vec == 13) || (\vec == 14) || (\vec == 17) || (\vec == 21) || (\vec == 29) || (\vec == 30)
    .else
    push 0
    .endif
    push \vec
    jmp vector_common
.endm

.set vector, 0
.rept 256
    vector_stub %vector
    .set vector, vector + 1
.endr

// Saved GPRs + vector + error code + CPU frame must match the
// InterruptFrame layout exactly: rax at the lowest address.
vector_common:
    push r15
    push r14
    push r13
    push r12
    push r11
    push r10
    push r9
    push r8
    push rbp
    push rdi
    push rsi
    push rdx
    push rcx
    push rbx
    push rax
    cld
    mov rdi, rsp
    call {dispatch}
    pop rax
    pop rbx
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    pop rbp
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    add rsp, 16
    iretq

.section .data
.global interrupt_stubs
.p2align 3
interrupt_stubs:
.macro stub_entry vec
    .quad vector_stub_\vec
.endm
.set vector, 0
.rept 256
    stub_entry %vector
    .set vector, vector + 1
.endr

.section .text
"#,
    dispatch = sym super::idt::common_interrupt_handler,
);

extern "C" {
    /// Entry-point address of each vector's stub, filled in above.
    pub static interrupt_stubs: [u64; 256];
}
