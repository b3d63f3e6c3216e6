//! The INVVPID instruction: invalidates TLB entries and paging-structure
//! caches keyed on a virtual-processor identifier.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 4.10.4 Invalidation of TLBs and Paging-Structure Caches

/// All virtualized processors share one VPID; every EPT mutation is paired
/// with an INVEPT, so per-core tags buy nothing here.
pub const VPID_TAG: u16 = 0x1;

/// INVVPID types.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InvvpidType {
    /// Invalidate mappings for one linear address under one VPID.
    IndividualAddress = 0,

    /// Invalidate all non-global mappings for one VPID.
    SingleContext = 1,

    /// Invalidate all mappings including globals, all VPIDs.
    AllContextsIncludingGlobals = 2,

    /// Invalidate all non-global mappings, all VPIDs.
    AllContexts = 3,
}

/// The INVVPID descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InvvpidDescriptor {
    pub vpid: u16,
    pub reserved: [u16; 3],
    pub linear_address: u64,
}

fn invvpid(invvpid_type: InvvpidType, descriptor: &InvvpidDescriptor) {
    let descriptor_ptr = descriptor as *const _ as u64;
    unsafe {
        core::arch::asm!(
            "invvpid {0}, [{1}]",
            in(reg) invvpid_type as u64,
            in(reg) descriptor_ptr,
            options(nostack),
        );
    }
}

/// Invalidates mappings for a single linear address under `vpid`.
pub fn invvpid_individual_address(vpid: u16, linear_address: u64) {
    let descriptor = InvvpidDescriptor {
        vpid,
        reserved: [0; 3],
        linear_address,
    };
    invvpid(InvvpidType::IndividualAddress, &descriptor);
}

/// Invalidates all non-global mappings tagged with `vpid`.
pub fn invvpid_single_context(vpid: u16) {
    let descriptor = InvvpidDescriptor {
        vpid,
        reserved: [0; 3],
        linear_address: 0,
    };
    invvpid(InvvpidType::SingleContext, &descriptor);
}

/// Invalidates all non-global mappings for every VPID.
pub fn invvpid_all_contexts() {
    let descriptor = InvvpidDescriptor {
        vpid: 0,
        reserved: [0; 3],
        linear_address: 0,
    };
    invvpid(InvvpidType::AllContexts, &descriptor);
}
