//! CPUID interception: upper layers get first refusal on every leaf; what
//! they do not consume is executed natively in VMX root and reflected, with
//! the hypervisor identity leaves filled in.

use {
    crate::{
        error::HypervisorError,
        intel::{vcpu::Vcpu, vmexit::ExitType},
        vmm::{CPUID_VENDOR_AND_MAX_FUNCTIONS, VENDOR_NAME},
    },
    bit_field::BitField,
    core::ops::RangeInclusive,
    log::*,
    x86::cpuid::cpuid,
};

/// CPUID leaves with special handling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuidLeaf {
    /// Feature information, including the hypervisor-present bit.
    FeatureInformation = 0x1,

    /// Hypervisor vendor identification leaf.
    HypervisorVendor = 0x4000_0000,
}

/// Bit 31 of ECX for CPUID.1: a hypervisor is present.
const HYPERVISOR_PRESENT_BIT: usize = 31;

const HYPERV_CPUID_LEAF_RANGE: RangeInclusive<u32> = 0x4000_0000..=0x4FFF_FFFF;

pub fn handle_cpuid(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let leaf = vcpu.guest_registers.rax as u32;
    let sub_leaf = vcpu.guest_registers.rcx as u32;

    // Execute natively first so a callback can start from real values.
    let mut result = cpuid!(leaf, sub_leaf);

    let consumed = crate::interface::callbacks()
        .cpuid
        .map(|callback| callback(leaf, sub_leaf, &mut result))
        .unwrap_or(false);

    if !consumed {
        match leaf {
            leaf if leaf == CpuidLeaf::FeatureInformation as u32 => {
                // Advertise ourselves per convention; the debugger may
                // override this through the callback for transparency.
                result.ecx.set_bit(HYPERVISOR_PRESENT_BIT, true);
            }
            leaf if leaf == CpuidLeaf::HypervisorVendor as u32 => {
                result.eax = CPUID_VENDOR_AND_MAX_FUNCTIONS;
                result.ebx = VENDOR_NAME;
                result.ecx = VENDOR_NAME;
                result.edx = VENDOR_NAME;
            }
            leaf if HYPERV_CPUID_LEAF_RANGE.contains(&leaf) => {
                trace!("Unimplemented hypervisor leaf {leaf:#x}");
                result.eax = 0;
                result.ebx = 0;
                result.ecx = 0;
                result.edx = 0;
            }
            _ => {}
        }
    }

    vcpu.guest_registers.rax = result.eax as u64;
    vcpu.guest_registers.rbx = result.ebx as u64;
    vcpu.guest_registers.rcx = result.ecx as u64;
    vcpu.guest_registers.rdx = result.edx as u64;

    Ok(ExitType::IncrementRip)
}
