//! Detour trampolines for hidden hooks: the absolute jump planted in a
//! shadow page, the per-hook thunk that identifies the hook, the shared
//! register-saving dispatch stub, and the relocated copy of the displaced
//! instructions that completes the round trip back into the original code
//! stream.

use {
    crate::error::HypervisorError,
    alloc::{boxed::Box, vec::Vec},
    core::arch::global_asm,
    iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, InstructionBlock},
    log::trace,
};

/// Length of the absolute `jmp [rip+0]` shellcode.
pub const JMP_SHELLCODE_LEN: usize = 14;

/// Length of the `mov r10, imm64` thunk prefix.
const THUNK_MOV_LEN: usize = 10;

/// Length of the whole per-hook thunk (mov + absolute jmp).
pub const THUNK_LEN: usize = THUNK_MOV_LEN + JMP_SHELLCODE_LEN;

/// Ceiling for the relocated displaced instructions plus the jump back.
pub const MAX_TRAMPOLINE_SIZE: usize = 100;

/// One pooled executable buffer: thunk followed by the trampoline.
pub const TRAMPOLINE_BUFFER_SIZE: usize = THUNK_LEN + MAX_TRAMPOLINE_SIZE;

/// The hidden breakpoint byte for breakpoint-style hooks.
pub const BREAKPOINT_OPCODE: u8 = 0xCC;

/// Builds the 14-byte absolute jump:
///
/// ```text
/// jmp qword ptr [rip+0]
/// dq  target
/// ```
///
/// No register is clobbered, which matters because this lands at the first
/// byte of an arbitrary function.
pub fn jmp_shellcode(target_address: u64) -> [u8; JMP_SHELLCODE_LEN] {
    let mut shellcode = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
    shellcode[6..].copy_from_slice(&target_address.to_le_bytes());
    shellcode
}

/// Builds the per-hook thunk: `mov r10, record` then an absolute jump into
/// the shared dispatch stub. R10 is caller-saved and dead at a function
/// entry point.
pub fn thunk_shellcode(record_address: u64, stub_address: u64) -> [u8; THUNK_LEN] {
    let mut shellcode = [0u8; THUNK_LEN];
    shellcode[0] = 0x49;
    shellcode[1] = 0xBA;
    shellcode[2..10].copy_from_slice(&record_address.to_le_bytes());
    shellcode[10..].copy_from_slice(&jmp_shellcode(stub_address));
    shellcode
}

/// Relocates at least `min_len` bytes of instructions from
/// `original_va`/`code` to run at `trampoline_va`, appending an absolute
/// jump back to `original_va + displaced_len`. RIP-relative operands are
/// re-encoded against the new location.
///
/// Returns the trampoline bytes and the number of original bytes displaced.
pub fn build_trampoline(
    original_va: u64,
    code: &[u8],
    trampoline_va: u64,
    min_len: usize,
) -> Result<(Vec<u8>, usize), HypervisorError> {
    let mut decoder = Decoder::with_ip(64, code, original_va, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut displaced_len = 0usize;

    while displaced_len < min_len {
        if !decoder.can_decode() {
            return Err(HypervisorError::EncodingFailed);
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(HypervisorError::EncodingFailed);
        }
        displaced_len += instruction.len();
        instructions.push(instruction);
    }

    let block = InstructionBlock::new(&instructions, trampoline_va);
    let mut encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map_err(|_| HypervisorError::EncodingFailed)?
        .code_buffer;

    encoded.extend_from_slice(&jmp_shellcode(original_va + displaced_len as u64));

    if encoded.len() > MAX_TRAMPOLINE_SIZE {
        return Err(HypervisorError::TrampolineTooLarge);
    }

    Ok((encoded, displaced_len))
}

/// The register snapshot handed to detour handlers. Field order matches the
/// push sequence in `detour_dispatch_stub`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DetourRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<DetourRegisters>(), 15 * 8);

/// The upper-layer callback invoked before the original instructions retire.
pub type DetourHandler = extern "win64" fn(regs: *mut DetourRegisters, original_va: u64);

/// Per-hook identity consumed by the dispatch stub via R10.
#[repr(C)]
pub struct DetourRecord {
    /// The hooked virtual address (what the handler receives).
    pub hooked_va: u64,
    /// Where execution continues after the handler: the relocated displaced
    /// instructions.
    pub trampoline_va: u64,
    /// `hooked_va + displaced_len`, where the trampoline jumps back to.
    pub return_va: u64,
    /// The registered handler.
    pub handler: DetourHandler,
}

/// A fully assembled detour: the record, the executable buffer holding the
/// thunk and trampoline, and the displaced byte count.
pub struct DetourHook {
    record: Box<DetourRecord>,
    code: Box<[u8; TRAMPOLINE_BUFFER_SIZE]>,
    displaced_len: usize,
}

impl core::fmt::Debug for DetourHook {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DetourHook")
            .field("hooked_va", &self.record.hooked_va)
            .field("trampoline_va", &self.record.trampoline_va)
            .field("return_va", &self.record.return_va)
            .field("displaced_len", &self.displaced_len)
            .finish()
    }
}

impl DetourHook {
    /// Assembles the detour for `original_va`, reading the instruction bytes
    /// to displace from `code_bytes` (the unmodified image of the function
    /// start).
    pub fn new(
        original_va: u64,
        code_bytes: &[u8],
        handler: DetourHandler,
    ) -> Result<Self, HypervisorError> {
        let mut code = Box::new([0u8; TRAMPOLINE_BUFFER_SIZE]);
        let trampoline_va = code.as_ptr() as u64 + THUNK_LEN as u64;

        let (trampoline, displaced_len) =
            build_trampoline(original_va, code_bytes, trampoline_va, JMP_SHELLCODE_LEN)?;

        let record = Box::new(DetourRecord {
            hooked_va: original_va,
            trampoline_va,
            return_va: original_va + displaced_len as u64,
            handler,
        });

        let thunk = thunk_shellcode(
            record.as_ref() as *const _ as u64,
            detour_dispatch_stub as usize as u64,
        );
        code[..THUNK_LEN].copy_from_slice(&thunk);
        code[THUNK_LEN..THUNK_LEN + trampoline.len()].copy_from_slice(&trampoline);

        trace!(
            "Detour for {:#x}: thunk at {:#x}, {} bytes displaced",
            original_va,
            code.as_ptr() as u64,
            displaced_len
        );

        Ok(Self {
            record,
            code,
            displaced_len,
        })
    }

    /// The address the shadow-page jump must target.
    pub fn thunk_va(&self) -> u64 {
        self.code.as_ptr() as u64
    }

    /// The relocated original-prologue copy; calling it runs the unhooked
    /// function.
    pub fn trampoline_va(&self) -> u64 {
        self.record.trampoline_va
    }

    pub fn return_va(&self) -> u64 {
        self.record.return_va
    }

    pub fn hooked_va(&self) -> u64 {
        self.record.hooked_va
    }

    /// Number of original bytes the shadow-page jump overwrites.
    pub fn displaced_len(&self) -> usize {
        self.displaced_len
    }
}

extern "C" {
    /// The shared dispatch stub: saves the guest-visible GPRs, calls
    /// `detour_dispatch` with the frame and the record from R10, restores
    /// the GPRs and continues at the returned trampoline address.
    pub fn detour_dispatch_stub();
}

/// Called by the stub. Runs the registered handler, then reports where
/// execution continues.
#[no_mangle]
extern "win64" fn detour_dispatch(regs: *mut DetourRegisters, record: *const DetourRecord) -> u64 {
    let record = unsafe { &*record };
    (record.handler)(regs, record.hooked_va);
    record.trampoline_va
}

global_asm!(
    r#"
// Entered from a per-hook thunk with the DetourRecord address in r10.
// A placeholder slot is pushed first so the continuation address can be
// returned to without clobbering any register.
.global detour_dispatch_stub
detour_dispatch_stub:
    push    rax                 // continuation slot
    push    rax
    push    rcx
    push    rdx
    push    rbx
    push    rbp
    push    rsi
    push    rdi
    push    r8
    push    r9
    push    r10
    push    r11
    push    r12
    push    r13
    push    r14
    push    r15

    mov     rcx, rsp            // &DetourRegisters
    mov     rdx, r10            // &DetourRecord
    sub     rsp, 0x28           // shadow space, keeps 16-byte alignment
    call    detour_dispatch
    add     rsp, 0x28
    mov     [rsp + 0x78], rax   // fill the continuation slot

    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     r11
    pop     r10
    pop     r9
    pop     r8
    pop     rdi
    pop     rsi
    pop     rbp
    pop     rbx
    pop     rdx
    pop     rcx
    pop     rax

    ret                         // pops the slot -> trampoline
"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jmp_shellcode_layout() {
        let shellcode = jmp_shellcode(0xFFFF_8000_1234_5678);
        assert_eq!(&shellcode[..6], &[0xff, 0x25, 0, 0, 0, 0]);
        assert_eq!(
            u64::from_le_bytes(shellcode[6..].try_into().unwrap()),
            0xFFFF_8000_1234_5678
        );
    }

    #[test]
    fn thunk_loads_record_then_jumps() {
        let thunk = thunk_shellcode(0x1111_2222_3333_4444, 0x5555_6666_7777_8888);
        assert_eq!(&thunk[..2], &[0x49, 0xBA]);
        assert_eq!(
            u64::from_le_bytes(thunk[2..10].try_into().unwrap()),
            0x1111_2222_3333_4444
        );
        assert_eq!(&thunk[10..12], &[0xff, 0x25]);
        assert_eq!(
            u64::from_le_bytes(thunk[16..].try_into().unwrap()),
            0x5555_6666_7777_8888
        );
    }

    #[test]
    fn trampoline_displaces_whole_instructions() {
        // push rbp; mov rbp, rsp; sub rsp, 0x40; xor eax, eax; inc eax;
        // nop...: 14 bytes land mid-instruction, so 15 get displaced.
        let code = [
            0x55, // push rbp (1)
            0x48, 0x89, 0xE5, // mov rbp, rsp (3)
            0x48, 0x81, 0xEC, 0x40, 0x00, 0x00, 0x00, // sub rsp, 0x40 (7)
            0x31, 0xC0, // xor eax, eax (2)
            0xFF, 0xC0, // inc eax (2)
            0x90, 0x90, 0x90,
        ];

        let (trampoline, displaced) =
            build_trampoline(0x1000, &code, 0x9000, JMP_SHELLCODE_LEN).unwrap();

        assert_eq!(displaced, 15);
        // Position-independent instructions re-encode verbatim, followed by
        // the jump back to original + displaced.
        assert_eq!(&trampoline[..15], &code[..15]);
        let jmp = &trampoline[15..];
        assert_eq!(&jmp[..2], &[0xff, 0x25]);
        assert_eq!(
            u64::from_le_bytes(jmp[6..14].try_into().unwrap()),
            0x1000 + 15
        );
    }

    #[test]
    fn trampoline_rewrites_rip_relative_displacement() {
        // lea rax, [rip + 0x100] at VA 0x1000 targets 0x1107; nops pad out
        // the displaced window.
        let mut code = [0x90u8; 20];
        code[..7].copy_from_slice(&[0x48, 0x8D, 0x05, 0x00, 0x01, 0x00, 0x00]);

        let (trampoline, displaced) =
            build_trampoline(0x1000, &code, 0x2000, JMP_SHELLCODE_LEN).unwrap();
        assert_eq!(displaced, 14);

        // Decode the relocated lea and confirm it still resolves 0x1107.
        let mut decoder = Decoder::with_ip(64, &trampoline, 0x2000, DecoderOptions::NONE);
        let lea = decoder.decode();
        assert_eq!(lea.memory_displacement64(), 0x1107);
    }

    #[test]
    fn trampoline_rejects_truncated_code() {
        let code = [0x55u8, 0x48]; // runs out mid-stream
        assert!(build_trampoline(0x1000, &code, 0x2000, JMP_SHELLCODE_LEN).is_err());
    }

    #[test]
    fn detour_hook_wires_thunk_record_and_return() {
        extern "win64" fn handler(_regs: *mut DetourRegisters, _va: u64) {}

        let code = [
            0x48, 0x89, 0x5C, 0x24, 0x08, // mov [rsp+8], rbx (5)
            0x48, 0x89, 0x6C, 0x24, 0x10, // mov [rsp+16], rbp (5)
            0x57, // push rdi (1)
            0x48, 0x83, 0xEC, 0x20, // sub rsp, 0x20 (4)
            0x90, 0x90, 0x90, 0x90,
        ];

        let hook = DetourHook::new(0xFFFF_F780_0000_1000, &code, handler).unwrap();

        assert_eq!(hook.displaced_len(), 15);
        assert_eq!(hook.return_va(), 0xFFFF_F780_0000_1000 + 15);
        assert_eq!(hook.trampoline_va(), hook.thunk_va() + THUNK_LEN as u64);

        // The thunk must reference the live record and the dispatch stub.
        let thunk = unsafe { core::slice::from_raw_parts(hook.thunk_va() as *const u8, THUNK_LEN) };
        assert_eq!(
            u64::from_le_bytes(thunk[2..10].try_into().unwrap()),
            hook.record.as_ref() as *const _ as u64
        );
        assert_eq!(
            u64::from_le_bytes(thunk[16..].try_into().unwrap()),
            detour_dispatch_stub as usize as u64
        );
    }
}
