//! The guest register context frame and the routine that captures the live
//! CPU state. The captured state is what the interrupted system resumes from
//! once VMLAUNCH places it in VMX non-root.

use core::{arch::global_asm, fmt};

extern "efiapi" {
    /// Captures the current general-purpose registers, RFLAGS, RSP, RIP and
    /// XMM registers into `registers`.
    ///
    /// Returns `false` at the capture site. After virtualization the guest
    /// resumes at the captured RIP with RAX forced to a non-zero value, so a
    /// `true` return means "already running as the guest".
    pub fn capture_registers(registers: &mut GuestRegisters) -> bool;
}

/// Guest general-purpose register state plus RIP, RSP, RFLAGS and the XMM
/// registers. The VMCS does not track these; the VM-entry/exit assembly
/// saves and restores them against this frame.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub xmm0: M128A,
    pub xmm1: M128A,
    pub xmm2: M128A,
    pub xmm3: M128A,
    pub xmm4: M128A,
    pub xmm5: M128A,
    pub xmm6: M128A,
    pub xmm7: M128A,
    pub xmm8: M128A,
    pub xmm9: M128A,
    pub xmm10: M128A,
    pub xmm11: M128A,
    pub xmm12: M128A,
    pub xmm13: M128A,
    pub xmm14: M128A,
    pub xmm15: M128A,
}

// The assembly below hardcodes these offsets.
static_assertions::const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x190);
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, rip), 0x78);
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, xmm0), 0x90);

#[repr(C)]
#[repr(align(16))]
#[derive(Clone, Copy, Default)]
pub struct M128A {
    pub low: u64,
    pub high: i64,
}

impl GuestRegisters {
    /// Reads the general-purpose register selected by a VMX exit
    /// qualification GPR index (RSP reads come from the VMCS, not here).
    pub fn gpr(&self, index: u64) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes the general-purpose register selected by a VMX exit
    /// qualification GPR index.
    pub fn set_gpr(&mut self, index: u64, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => self.rsp = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

impl fmt::Debug for GuestRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuestRegisters {\n")?;
        writeln!(
            f,
            "  rax: {:#018x}, rbx: {:#018x}, rcx: {:#018x}, rdx: {:#018x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            f,
            "  rsi: {:#018x}, rdi: {:#018x}, rbp: {:#018x}, r8:  {:#018x}",
            self.rsi, self.rdi, self.rbp, self.r8
        )?;
        writeln!(
            f,
            "  r9:  {:#018x}, r10: {:#018x}, r11: {:#018x}, r12: {:#018x}",
            self.r9, self.r10, self.r11, self.r12
        )?;
        writeln!(
            f,
            "  r13: {:#018x}, r14: {:#018x}, r15: {:#018x}, rip: {:#018x}",
            self.r13, self.r14, self.r15, self.rip
        )?;
        writeln!(f, "  rsp: {:#018x}, rflags: {:#018x}", self.rsp, self.rflags)?;
        f.write_str("}")
    }
}

impl fmt::Debug for M128A {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#018x}, {:#018x})", self.low, self.high)
    }
}

global_asm!(
    r#"
// Offsets into the GuestRegisters frame, kept in lockstep with the struct
// layout (checked by const assertions on the Rust side).
.set registers_rax, 0x0
.set registers_rbx, 0x8
.set registers_rcx, 0x10
.set registers_rdx, 0x18
.set registers_rdi, 0x20
.set registers_rsi, 0x28
.set registers_rbp, 0x30
.set registers_r8,  0x38
.set registers_r9,  0x40
.set registers_r10, 0x48
.set registers_r11, 0x50
.set registers_r12, 0x58
.set registers_r13, 0x60
.set registers_r14, 0x68
.set registers_r15, 0x70
.set registers_rip, 0x78
.set registers_rsp, 0x80
.set registers_rflags, 0x88
.set registers_xmm0, 0x90
.set registers_xmm1, 0xA0
.set registers_xmm2, 0xB0
.set registers_xmm3, 0xC0
.set registers_xmm4, 0xD0
.set registers_xmm5, 0xE0
.set registers_xmm6, 0xF0
.set registers_xmm7, 0x100
.set registers_xmm8, 0x110
.set registers_xmm9, 0x120
.set registers_xmm10, 0x130
.set registers_xmm11, 0x140
.set registers_xmm12, 0x150
.set registers_xmm13, 0x160
.set registers_xmm14, 0x170
.set registers_xmm15, 0x180

// extern "efiapi" fn capture_registers(registers: &mut GuestRegisters) -> bool
.global capture_registers
capture_registers:
    mov     [rcx + registers_rax], rax
    mov     [rcx + registers_rbx], rbx
    mov     [rcx + registers_rcx], rcx
    mov     [rcx + registers_rdx], rdx
    mov     [rcx + registers_rsi], rsi
    mov     [rcx + registers_rdi], rdi
    mov     [rcx + registers_rbp], rbp
    mov     [rcx + registers_r8],  r8
    mov     [rcx + registers_r9],  r9
    mov     [rcx + registers_r10], r10
    mov     [rcx + registers_r11], r11
    mov     [rcx + registers_r12], r12
    mov     [rcx + registers_r13], r13
    mov     [rcx + registers_r14], r14
    mov     [rcx + registers_r15], r15

    pushfq
    pop     rax
    mov     [rcx + registers_rflags], rax

    // RSP as it will be after this call returns.
    mov     rax, rsp
    add     rax, 8
    mov     [rcx + registers_rsp], rax

    // The return address doubles as the guest resume RIP.
    mov     rax, [rsp]
    mov     [rcx + registers_rip], rax

    movaps  [rcx + registers_xmm0], xmm0
    movaps  [rcx + registers_xmm1], xmm1
    movaps  [rcx + registers_xmm2], xmm2
    movaps  [rcx + registers_xmm3], xmm3
    movaps  [rcx + registers_xmm4], xmm4
    movaps  [rcx + registers_xmm5], xmm5
    movaps  [rcx + registers_xmm6], xmm6
    movaps  [rcx + registers_xmm7], xmm7
    movaps  [rcx + registers_xmm8], xmm8
    movaps  [rcx + registers_xmm9], xmm9
    movaps  [rcx + registers_xmm10], xmm10
    movaps  [rcx + registers_xmm11], xmm11
    movaps  [rcx + registers_xmm12], xmm12
    movaps  [rcx + registers_xmm13], xmm13
    movaps  [rcx + registers_xmm14], xmm14
    movaps  [rcx + registers_xmm15], xmm15

    // Not virtualized yet.
    xor     rax, rax
    ret
"#
);
