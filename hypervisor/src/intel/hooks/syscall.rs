//! Syscall interception by EFER: clearing EFER.SCE makes every SYSCALL and
//! SYSRET raise #UD, which the exception handler forwards here for software
//! emulation of the architectural transfer. The guest-visible EFER value is
//! shadowed through the MSR bitmap so the trick stays invisible.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! SYSCALL/SYSRET instruction operation

use {
    crate::intel::{
        bitmap::{InterceptOperation, MsrAccessType, MsrBitmap},
        events::ExceptionVector,
        support::{rdmsr, vmwrite, wrmsr},
    },
    x86::{msr, vmx::vmcs},
};

/// How intercepted #UDs are treated while the hook is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallHookType {
    /// Emulate any #UD whose bytes decode as SYSCALL/SYSRET, reflect the
    /// rest into the guest.
    HandleAllUd,

    /// Only emulate when the faulting RIP is safely readable under the
    /// active CR3; anything else is reflected.
    SafeAccessMemory,
}

const EFER_SCE: u64 = 1 << 0;
const RFLAGS_RF: u64 = 1 << 16;
const RFLAGS_VM: u64 = 1 << 17;
const RFLAGS_RESERVED1: u64 = 1 << 1;

/// `0F 05`
pub fn is_syscall_instruction(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x0F && bytes[1] == 0x05
}

/// `48 0F 07`
pub fn is_sysret_instruction(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == 0x48 && bytes[1] == 0x0F && bytes[2] == 0x07
}

/// A segment load the emulation applies to the VMCS guest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLoad {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

/// The register/segment effect of one emulated SYSCALL or SYSRET.
#[derive(Debug, Clone, Copy)]
pub struct TransferEffect {
    pub rip: u64,
    pub rcx: Option<u64>,
    pub r11: Option<u64>,
    pub rflags: u64,
    pub cs: SegmentLoad,
    pub ss: SegmentLoad,
}

/// Computes the SYSCALL transfer for an instruction at `rip`:
/// RCX receives the return RIP, R11 the flags, RIP moves to IA32_LSTAR,
/// RFLAGS is masked by IA32_FMASK, and CS/SS load from IA32_STAR[47:32].
pub fn syscall_effect(rip: u64, rflags: u64, lstar: u64, star: u64, fmask: u64) -> TransferEffect {
    let kernel_base = ((star >> 32) & 0xFFFF) as u16 & !0b11;

    TransferEffect {
        rip: lstar,
        rcx: Some(rip + 2),
        r11: Some(rflags),
        rflags: (rflags & !(fmask | RFLAGS_RF)) | RFLAGS_RESERVED1,
        cs: SegmentLoad {
            selector: kernel_base,
            base: 0,
            limit: u32::MAX,
            // Present 64-bit ring-0 code, accessed.
            access_rights: 0xA09B,
        },
        ss: SegmentLoad {
            selector: kernel_base + 8,
            base: 0,
            limit: u32::MAX,
            // Present ring-0 data, accessed.
            access_rights: 0xC093,
        },
    }
}

/// Computes the 64-bit SYSRET transfer: RIP from RCX, RFLAGS from R11, and
/// CS/SS load from IA32_STAR[63:48] with RPL 3.
pub fn sysret_effect(rcx: u64, r11: u64, star: u64) -> TransferEffect {
    let user_base = ((star >> 48) & 0xFFFF) as u16;

    TransferEffect {
        rip: rcx,
        rcx: None,
        r11: None,
        rflags: (r11 & !(RFLAGS_RF | RFLAGS_VM)) | RFLAGS_RESERVED1,
        cs: SegmentLoad {
            selector: (user_base + 16) | 3,
            base: 0,
            limit: u32::MAX,
            // Present 64-bit ring-3 code, accessed.
            access_rights: 0xA0FB,
        },
        ss: SegmentLoad {
            selector: (user_base + 8) | 3,
            base: 0,
            limit: u32::MAX,
            // Present ring-3 data, accessed.
            access_rights: 0xC0F3,
        },
    }
}

/// Computes the SYSCALL effect from the live MSRs.
pub fn emulate_syscall(rip: u64, rflags: u64) -> TransferEffect {
    syscall_effect(
        rip,
        rflags,
        rdmsr(msr::IA32_LSTAR),
        rdmsr(msr::IA32_STAR),
        rdmsr(msr::IA32_FMASK),
    )
}

/// Computes the SYSRET effect from the live MSRs.
pub fn emulate_sysret(rcx: u64, r11: u64) -> TransferEffect {
    sysret_effect(rcx, r11, rdmsr(msr::IA32_STAR))
}

impl TransferEffect {
    /// Applies the segment and RIP/RFLAGS portion to the current VMCS. The
    /// caller moves the GPR portion into its register frame.
    #[rustfmt::skip]
    pub fn apply_to_vmcs(&self) {
        vmwrite(vmcs::guest::RIP, self.rip);
        vmwrite(vmcs::guest::RFLAGS, self.rflags);

        vmwrite(vmcs::guest::CS_SELECTOR, self.cs.selector);
        vmwrite(vmcs::guest::CS_BASE, self.cs.base);
        vmwrite(vmcs::guest::CS_LIMIT, self.cs.limit);
        vmwrite(vmcs::guest::CS_ACCESS_RIGHTS, self.cs.access_rights);

        vmwrite(vmcs::guest::SS_SELECTOR, self.ss.selector);
        vmwrite(vmcs::guest::SS_BASE, self.ss.base);
        vmwrite(vmcs::guest::SS_LIMIT, self.ss.limit);
        vmwrite(vmcs::guest::SS_ACCESS_RIGHTS, self.ss.access_rights);
    }
}

/// Turns the EFER trick on for this core: clear EFER.SCE so SYSCALL #UDs,
/// intercept #UD, and shadow EFER reads so the guest keeps seeing SCE set.
pub fn enable_efer_hook(msr_bitmap: &mut MsrBitmap) {
    wrmsr(msr::IA32_EFER, rdmsr(msr::IA32_EFER) & !EFER_SCE);

    msr_bitmap.modify_msr_interception(
        msr::IA32_EFER,
        MsrAccessType::Read,
        InterceptOperation::Hook,
    );
    msr_bitmap.modify_msr_interception(
        msr::IA32_EFER,
        MsrAccessType::Write,
        InterceptOperation::Hook,
    );

    set_exception_bitmap_ud(true);
}

/// Restores genuine SYSCALL dispatch on this core.
pub fn disable_efer_hook(msr_bitmap: &mut MsrBitmap) {
    wrmsr(msr::IA32_EFER, rdmsr(msr::IA32_EFER) | EFER_SCE);

    msr_bitmap.modify_msr_interception(
        msr::IA32_EFER,
        MsrAccessType::Read,
        InterceptOperation::Unhook,
    );
    msr_bitmap.modify_msr_interception(
        msr::IA32_EFER,
        MsrAccessType::Write,
        InterceptOperation::Unhook,
    );

    set_exception_bitmap_ud(false);
}

/// The EFER value the guest is shown while the hook is active.
pub fn shadowed_guest_efer() -> u64 {
    rdmsr(msr::IA32_EFER) | EFER_SCE
}

fn set_exception_bitmap_ud(intercept: bool) {
    let mut bitmap = crate::intel::support::vmread(vmcs::control::EXCEPTION_BITMAP) as u32;
    if intercept {
        bitmap |= 1 << ExceptionVector::InvalidOpcode as u32;
    } else {
        bitmap &= !(1 << ExceptionVector::InvalidOpcode as u32);
    }
    vmwrite(vmcs::control::EXCEPTION_BITMAP, bitmap);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Windows-like layout: kernel CS 0x10/SS 0x18, user32 CS 0x23 ->
    // user64 CS 0x33, user SS 0x2B.
    const STAR: u64 = (0x0023u64 << 48) | (0x0010u64 << 32);
    const LSTAR: u64 = 0xFFFF_F780_0000_0340;
    const FMASK: u64 = 0x4700; // TF | IF | DF | NT

    #[test]
    fn recognizes_syscall_and_sysret_patterns() {
        assert!(is_syscall_instruction(&[0x0F, 0x05]));
        assert!(is_syscall_instruction(&[0x0F, 0x05, 0xC3]));
        assert!(!is_syscall_instruction(&[0x0F, 0x07]));
        assert!(!is_syscall_instruction(&[0x0F]));

        assert!(is_sysret_instruction(&[0x48, 0x0F, 0x07]));
        assert!(!is_sysret_instruction(&[0x0F, 0x07, 0x90]));
        assert!(!is_sysret_instruction(&[0x48, 0x0F]));
    }

    #[test]
    fn syscall_transfer_semantics() {
        let rip = 0x7FFE_0000_1234u64;
        let rflags = 0x246u64; // IF | ZF | PF | reserved

        let effect = syscall_effect(rip, rflags, LSTAR, STAR, FMASK);

        assert_eq!(effect.rip, LSTAR);
        assert_eq!(effect.rcx, Some(rip + 2));
        assert_eq!(effect.r11, Some(rflags));
        // IF is in FMASK and must be cleared; ZF/PF survive.
        assert_eq!(effect.rflags & (1 << 9), 0);
        assert_ne!(effect.rflags & (1 << 6), 0);
        assert_ne!(effect.rflags & RFLAGS_RESERVED1, 0);

        assert_eq!(effect.cs.selector, 0x10);
        assert_eq!(effect.ss.selector, 0x18);
        // Ring 0 in the loaded access rights.
        assert_eq!(effect.cs.access_rights & 0x60, 0);
    }

    #[test]
    fn sysret_transfer_semantics() {
        let return_rip = 0x7FFE_0000_5678u64;
        let saved_flags = 0x1_0346u64; // RF set in the saved copy

        let effect = sysret_effect(return_rip, saved_flags, STAR);

        assert_eq!(effect.rip, return_rip);
        assert_eq!(effect.rcx, None);
        // RF never survives a SYSRET; reserved bit 1 always reads set.
        assert_eq!(effect.rflags & RFLAGS_RF, 0);
        assert_ne!(effect.rflags & RFLAGS_RESERVED1, 0);

        assert_eq!(effect.cs.selector, 0x33);
        assert_eq!(effect.ss.selector, 0x2B);
        // RPL 3 and DPL 3.
        assert_eq!(effect.cs.selector & 3, 3);
        assert_eq!(effect.cs.access_rights & 0x60, 0x60);
    }

    #[test]
    fn syscall_selector_masks_rpl_bits() {
        // STAR with stray RPL bits in the kernel selector.
        let star = (0x0023u64 << 48) | (0x0013u64 << 32);
        let effect = syscall_effect(0, 0x202, LSTAR, star, FMASK);
        assert_eq!(effect.cs.selector & 0b11, 0);
        assert_eq!(effect.cs.selector, 0x10);
    }
}
