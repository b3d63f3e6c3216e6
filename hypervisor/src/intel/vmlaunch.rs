//! The VM-entry/exit trampoline. `launch_vm` transitions the CPU into the
//! guest with VMLAUNCH or VMRESUME and lands back here on every VM exit with
//! the full guest GPR and XMM state written to the context frame. Frame
//! offsets are the `GuestRegisters` layout pinned by the const assertions
//! next to the struct.

use {crate::intel::capture::GuestRegisters, core::arch::global_asm};

extern "efiapi" {
    /// Launches or resumes the guest with the given register frame.
    ///
    /// On the first call (`launched == 0`) the current RSP and the VM-exit
    /// landing label are written to VMCS_HOST_RSP/VMCS_HOST_RIP, so whatever
    /// stack this runs on is the VMM stack for every later exit.
    ///
    /// Returns RFLAGS as sampled right after VMLAUNCH/VMRESUME failed, or
    /// after a VM exit brought execution back to the host; a successful
    /// exit reads back with ZF and CF clear. The sample is taken before the
    /// host frame is unwound, so the failure verdict survives the stack
    /// arithmetic.
    pub fn launch_vm(registers: &mut GuestRegisters, launched: u64) -> u64;
}

global_asm!(
    r#"
// extern "efiapi" fn launch_vm(registers: &mut GuestRegisters, launched: u64) -> u64
.global launch_vm
launch_vm:
    // Host context: only what the Microsoft x64 ABI makes us preserve.
    // Volatile registers are the caller's problem.
    push    rbx
    push    rbp
    push    rsi
    push    rdi
    push    r12
    push    r13
    push    r14
    push    r15
    sub     rsp, 0xA8
    movaps  [rsp + 0x00], xmm6
    movaps  [rsp + 0x10], xmm7
    movaps  [rsp + 0x20], xmm8
    movaps  [rsp + 0x30], xmm9
    movaps  [rsp + 0x40], xmm10
    movaps  [rsp + 0x50], xmm11
    movaps  [rsp + 0x60], xmm12
    movaps  [rsp + 0x70], xmm13
    movaps  [rsp + 0x80], xmm14
    movaps  [rsp + 0x90], xmm15

    // Park the launched flag and the frame pointer where the exit path and
    // the launch/resume decision can reach them without a register.
    push    rdx
    push    rcx

    test    rdx, rdx
    jne     1f

    // First entry only: aim every future VM exit at this stack, with both
    // slots above still in place, and at the landing pad below.
    mov     rax, 0x6C14         // VMCS_HOST_RSP
    vmwrite rax, rsp
    mov     rax, 0x6C16         // VMCS_HOST_RIP
    lea     rdx, [rip + .Lvmexit]
    vmwrite rax, rdx
1:
    // Guest state, straight from the frame. RCX is the base on this side
    // too, so it loads last; the parked flag picks launch or resume.
    mov     rax, [rcx + 0x00]
    mov     rbx, [rcx + 0x08]
    mov     rdx, [rcx + 0x18]
    mov     rdi, [rcx + 0x20]
    mov     rsi, [rcx + 0x28]
    mov     rbp, [rcx + 0x30]
    mov     r8,  [rcx + 0x38]
    mov     r9,  [rcx + 0x40]
    mov     r10, [rcx + 0x48]
    mov     r11, [rcx + 0x50]
    mov     r12, [rcx + 0x58]
    mov     r13, [rcx + 0x60]
    mov     r14, [rcx + 0x68]
    mov     r15, [rcx + 0x70]
    movaps  xmm0,  [rcx + 0x90]
    movaps  xmm1,  [rcx + 0xA0]
    movaps  xmm2,  [rcx + 0xB0]
    movaps  xmm3,  [rcx + 0xC0]
    movaps  xmm4,  [rcx + 0xD0]
    movaps  xmm5,  [rcx + 0xE0]
    movaps  xmm6,  [rcx + 0xF0]
    movaps  xmm7,  [rcx + 0x100]
    movaps  xmm8,  [rcx + 0x110]
    movaps  xmm9,  [rcx + 0x120]
    movaps  xmm10, [rcx + 0x130]
    movaps  xmm11, [rcx + 0x140]
    movaps  xmm12, [rcx + 0x150]
    movaps  xmm13, [rcx + 0x160]
    movaps  xmm14, [rcx + 0x170]
    movaps  xmm15, [rcx + 0x180]

    cmp     qword ptr [rsp + 8], 0
    mov     rcx, [rcx + 0x10]
    jne     .Lresume_entry
    vmlaunch
    jmp     .Lepilogue          // VMLAUNCH refused; RFLAGS says why

.Lresume_entry:
    vmresume
    jmp     .Lepilogue          // VMRESUME refused

.Lvmexit:
    // Every register holds guest state. Park guest RCX to free the frame
    // base, then spill the rest through it.
    push    rcx
    mov     rcx, [rsp + 8]
    mov     [rcx + 0x00], rax
    mov     [rcx + 0x08], rbx
    mov     [rcx + 0x18], rdx
    mov     [rcx + 0x20], rdi
    mov     [rcx + 0x28], rsi
    mov     [rcx + 0x30], rbp
    mov     [rcx + 0x38], r8
    mov     [rcx + 0x40], r9
    mov     [rcx + 0x48], r10
    mov     [rcx + 0x50], r11
    mov     [rcx + 0x58], r12
    mov     [rcx + 0x60], r13
    mov     [rcx + 0x68], r14
    mov     [rcx + 0x70], r15
    movaps  [rcx + 0x90],  xmm0
    movaps  [rcx + 0xA0],  xmm1
    movaps  [rcx + 0xB0],  xmm2
    movaps  [rcx + 0xC0],  xmm3
    movaps  [rcx + 0xD0],  xmm4
    movaps  [rcx + 0xE0],  xmm5
    movaps  [rcx + 0xF0],  xmm6
    movaps  [rcx + 0x100], xmm7
    movaps  [rcx + 0x110], xmm8
    movaps  [rcx + 0x120], xmm9
    movaps  [rcx + 0x130], xmm10
    movaps  [rcx + 0x140], xmm11
    movaps  [rcx + 0x150], xmm12
    movaps  [rcx + 0x160], xmm13
    movaps  [rcx + 0x170], xmm14
    movaps  [rcx + 0x180], xmm15
    pop     rax                 // the parked guest RCX
    mov     [rcx + 0x10], rax

.Lepilogue:
    // Sample the verdict before any stack arithmetic clobbers it. A VM
    // exit loads clean host RFLAGS, so this reads as success there.
    pushfq
    pop     rax

    add     rsp, 0x10           // frame pointer + launched flag
    movaps  xmm6,  [rsp + 0x00]
    movaps  xmm7,  [rsp + 0x10]
    movaps  xmm8,  [rsp + 0x20]
    movaps  xmm9,  [rsp + 0x30]
    movaps  xmm10, [rsp + 0x40]
    movaps  xmm11, [rsp + 0x50]
    movaps  xmm12, [rsp + 0x60]
    movaps  xmm13, [rsp + 0x70]
    movaps  xmm14, [rsp + 0x80]
    movaps  xmm15, [rsp + 0x90]
    add     rsp, 0xA8
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rdi
    pop     rsi
    pop     rbp
    pop     rbx
    ret
"#
);

extern "efiapi" {
    /// Leaves the hypervisor for good: reloads every general-purpose
    /// register, RFLAGS, RSP and RIP from `registers` and continues there.
    /// Used after VMXOFF to hand the CPU back to the devirtualized system.
    pub fn restore_guest_context(registers: &GuestRegisters) -> !;
}

global_asm!(
    r#"
// extern "efiapi" fn restore_guest_context(registers: &GuestRegisters) -> !
.global restore_guest_context
restore_guest_context:
    // Switch to the guest stack and stage RIP and RFLAGS on it.
    mov     rsp, [rcx + 0x80]   // registers_rsp
    mov     rax, [rcx + 0x78]   // registers_rip
    push    rax
    mov     rax, [rcx + 0x88]   // registers_rflags
    push    rax
    popfq

    movaps  xmm0, [rcx + 0x90]
    movaps  xmm1, [rcx + 0xA0]
    movaps  xmm2, [rcx + 0xB0]
    movaps  xmm3, [rcx + 0xC0]
    movaps  xmm4, [rcx + 0xD0]
    movaps  xmm5, [rcx + 0xE0]
    movaps  xmm6, [rcx + 0xF0]
    movaps  xmm7, [rcx + 0x100]
    movaps  xmm8, [rcx + 0x110]
    movaps  xmm9, [rcx + 0x120]
    movaps  xmm10, [rcx + 0x130]
    movaps  xmm11, [rcx + 0x140]
    movaps  xmm12, [rcx + 0x150]
    movaps  xmm13, [rcx + 0x160]
    movaps  xmm14, [rcx + 0x170]
    movaps  xmm15, [rcx + 0x180]

    mov     rax, [rcx + 0x0]
    mov     rbx, [rcx + 0x8]
    mov     rdx, [rcx + 0x18]
    mov     rdi, [rcx + 0x20]
    mov     rsi, [rcx + 0x28]
    mov     rbp, [rcx + 0x30]
    mov     r8,  [rcx + 0x38]
    mov     r9,  [rcx + 0x40]
    mov     r10, [rcx + 0x48]
    mov     r11, [rcx + 0x50]
    mov     r12, [rcx + 0x58]
    mov     r13, [rcx + 0x60]
    mov     r14, [rcx + 0x68]
    mov     r15, [rcx + 0x70]
    mov     rcx, [rcx + 0x10]

    // The staged RIP is all that is left on the guest stack.
    ret
"#
);
