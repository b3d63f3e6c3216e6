//! The INVEPT instruction: invalidates TLB entries and paging-structure
//! caches derived from EPT, keyed on an EPTP.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 29.4.3.1 Operations that Invalidate Cached Mappings

/// INVEPT types.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InveptType {
    /// Invalidate mappings associated with a single EPTP.
    SingleContext = 1,

    /// Invalidate mappings associated with all EPTPs.
    AllContexts = 2,
}

fn invept(invept_type: InveptType, eptp: u64) {
    // 128-bit descriptor: the EPTP in the low quadword (ignored for
    // all-contexts), zero in the high quadword.
    let descriptor: [u64; 2] = [eptp, 0];

    unsafe {
        core::arch::asm!(
            "invept {0}, [{1}]",
            in(reg) invept_type as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    };
}

/// Invalidates guest-physical and combined mappings for one EPTP. Required
/// on the mutating core after every EPT entry change, before VMRESUME.
pub fn invept_single_context(eptp: u64) {
    invept(InveptType::SingleContext, eptp);
}

/// Invalidates guest-physical and combined mappings for every EPTP.
pub fn invept_all_contexts() {
    invept(InveptType::AllContexts, 0);
}
