//! The VMXON region and the CPU conditioning required before VMXON: the
//! VMX-enable bit in CR4, the IA32_FEATURE_CONTROL lock and the CR0/CR4
//! fixed bits.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 25.11.5 VMXON Region

use {
    crate::{error::HypervisorError, intel::support::rdmsr},
    bit_field::BitField,
    x86::{controlregs, current::paging::BASE_PAGE_SIZE, msr},
    x86_64::registers::control::Cr4,
};

/// A representation of the VMXON region in memory.
#[repr(C, align(4096))]
pub struct Vmxon {
    /// Revision ID pulled from IA32_VMX_BASIC, bit 31 cleared.
    pub revision_id: u32,

    /// Data array constituting the rest of the VMXON region.
    pub data: [u8; BASE_PAGE_SIZE - 4],
}

impl Vmxon {
    /// Stamps the VMXON region with the VMCS revision identifier.
    pub fn init(&mut self) {
        self.revision_id = rdmsr(msr::IA32_VMX_BASIC) as u32;
        self.revision_id.set_bit(31, false);
    }

    /// Sets CR4.VMXE, preparing the processor to enter VMX operation.
    pub fn enable_vmx_operation() {
        const CR4_VMX_ENABLE_BIT: usize = 13;
        let mut cr4 = Cr4::read_raw();
        cr4.set_bit(CR4_VMX_ENABLE_BIT, true);
        unsafe { Cr4::write_raw(cr4) };
    }

    /// Clears CR4.VMXE after VMXOFF.
    pub fn disable_vmx_operation() {
        const CR4_VMX_ENABLE_BIT: usize = 13;
        let mut cr4 = Cr4::read_raw();
        cr4.set_bit(CR4_VMX_ENABLE_BIT, false);
        unsafe { Cr4::write_raw(cr4) };
    }

    /// Verifies (and if unlocked, sets) the IA32_FEATURE_CONTROL bits that
    /// permit VMXON outside SMX. A locked MSR without that permission means
    /// VT-x is disabled in firmware and init must abort.
    pub fn adjust_feature_control_msr() -> Result<(), HypervisorError> {
        const VMX_LOCK_BIT: u64 = 1 << 0;
        const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

        let ia32_feature_control = rdmsr(msr::IA32_FEATURE_CONTROL);

        if (ia32_feature_control & VMX_LOCK_BIT) == 0 {
            unsafe {
                msr::wrmsr(
                    msr::IA32_FEATURE_CONTROL,
                    VMXON_OUTSIDE_SMX | VMX_LOCK_BIT | ia32_feature_control,
                )
            };
        } else if (ia32_feature_control & VMXON_OUTSIDE_SMX) == 0 {
            return Err(HypervisorError::VmxBiosLock);
        }

        Ok(())
    }

    /// Conditions CR0 to the intersection of IA32_VMX_CR0_FIXED0/FIXED1.
    pub fn set_cr0_bits() {
        let ia32_vmx_cr0_fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
        let ia32_vmx_cr0_fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);

        let mut cr0 = unsafe { controlregs::cr0() };

        cr0 |= controlregs::Cr0::from_bits_truncate(ia32_vmx_cr0_fixed0 as usize);
        cr0 &= controlregs::Cr0::from_bits_truncate(ia32_vmx_cr0_fixed1 as usize);

        unsafe { controlregs::cr0_write(cr0) };
    }

    /// Conditions CR4 to the intersection of IA32_VMX_CR4_FIXED0/FIXED1.
    pub fn set_cr4_bits() {
        let ia32_vmx_cr4_fixed0 = rdmsr(msr::IA32_VMX_CR4_FIXED0);
        let ia32_vmx_cr4_fixed1 = rdmsr(msr::IA32_VMX_CR4_FIXED1);

        let mut cr4 = Cr4::read_raw();

        cr4 |= ia32_vmx_cr4_fixed0;
        cr4 &= ia32_vmx_cr4_fixed1;

        unsafe { Cr4::write_raw(cr4) };
    }
}
