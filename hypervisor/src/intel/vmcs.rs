//! Programming of the VMCS: guest state mirroring the interrupted context,
//! host state anchored in the SYSTEM address space, and the execution
//! controls (adjusted against their TRUE_* capability MSRs) that select
//! which guest events reach the dispatcher.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 25.4 GUEST-STATE AREA, 25.5 HOST-STATE AREA, 25.6 VM-EXECUTION CONTROL
//! FIELDS

use {
    crate::intel::{
        capture::GuestRegisters,
        invvpid::VPID_TAG,
        segmentation::{access_rights_from_native, lar, lsl, segment_base},
        support::{rdmsr, sgdt, sidt, vmwrite},
    },
    bit_field::BitField,
    x86::{
        bits64::paging::BASE_PAGE_SIZE,
        controlregs, dtables, msr,
        segmentation::{cs, ds, es, fs, gs, ss},
        task,
        vmx::vmcs,
    },
    x86_64::registers::control::Cr4,
};

/// The VMCS region.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; BASE_PAGE_SIZE - 8],
}

impl Vmcs {
    /// Stamps the region with the revision identifier from IA32_VMX_BASIC.
    pub fn init(&mut self) {
        self.revision_id = rdmsr(msr::IA32_VMX_BASIC) as u32;
        self.revision_id.set_bit(31, false);
    }

    /// Writes the guest-state area from the live CPU context so VM entry
    /// resumes exactly where `capture_registers` sampled the system.
    #[rustfmt::skip]
    pub fn setup_guest_registers_state(guest_registers: &GuestRegisters) {
        let gdtr = sgdt();
        let idtr = sidt();
        let ldtr = unsafe { dtables::ldtr() };
        let tr = unsafe { task::tr() };

        unsafe { vmwrite(vmcs::guest::CR0, controlregs::cr0().bits() as u64) };
        unsafe { vmwrite(vmcs::guest::CR3, controlregs::cr3()) };
        vmwrite(vmcs::guest::CR4, Cr4::read_raw());

        // Architectural reset value; live debug state is not carried into
        // the guest.
        vmwrite(vmcs::guest::DR7, 0x400u64);

        vmwrite(vmcs::guest::RSP, guest_registers.rsp);
        vmwrite(vmcs::guest::RIP, guest_registers.rip);
        vmwrite(vmcs::guest::RFLAGS, guest_registers.rflags);

        vmwrite(vmcs::guest::CS_SELECTOR, cs().bits());
        vmwrite(vmcs::guest::SS_SELECTOR, ss().bits());
        vmwrite(vmcs::guest::DS_SELECTOR, ds().bits());
        vmwrite(vmcs::guest::ES_SELECTOR, es().bits());
        vmwrite(vmcs::guest::FS_SELECTOR, fs().bits());
        vmwrite(vmcs::guest::GS_SELECTOR, gs().bits());
        vmwrite(vmcs::guest::LDTR_SELECTOR, ldtr.bits());
        vmwrite(vmcs::guest::TR_SELECTOR, tr.bits());

        vmwrite(vmcs::guest::CS_BASE, segment_base(&gdtr, cs()));
        vmwrite(vmcs::guest::SS_BASE, segment_base(&gdtr, ss()));
        vmwrite(vmcs::guest::DS_BASE, segment_base(&gdtr, ds()));
        vmwrite(vmcs::guest::ES_BASE, segment_base(&gdtr, es()));
        vmwrite(vmcs::guest::FS_BASE, rdmsr(msr::IA32_FS_BASE));
        vmwrite(vmcs::guest::GS_BASE, rdmsr(msr::IA32_GS_BASE));
        vmwrite(vmcs::guest::LDTR_BASE, segment_base(&gdtr, ldtr));
        vmwrite(vmcs::guest::TR_BASE, segment_base(&gdtr, tr));

        vmwrite(vmcs::guest::CS_LIMIT, lsl(cs()));
        vmwrite(vmcs::guest::SS_LIMIT, lsl(ss()));
        vmwrite(vmcs::guest::DS_LIMIT, lsl(ds()));
        vmwrite(vmcs::guest::ES_LIMIT, lsl(es()));
        vmwrite(vmcs::guest::FS_LIMIT, lsl(fs()));
        vmwrite(vmcs::guest::GS_LIMIT, lsl(gs()));
        vmwrite(vmcs::guest::LDTR_LIMIT, lsl(ldtr));
        vmwrite(vmcs::guest::TR_LIMIT, lsl(tr));

        vmwrite(vmcs::guest::CS_ACCESS_RIGHTS, access_rights_from_native(lar(cs())));
        vmwrite(vmcs::guest::SS_ACCESS_RIGHTS, access_rights_from_native(lar(ss())));
        vmwrite(vmcs::guest::DS_ACCESS_RIGHTS, access_rights_from_native(lar(ds())));
        vmwrite(vmcs::guest::ES_ACCESS_RIGHTS, access_rights_from_native(lar(es())));
        vmwrite(vmcs::guest::FS_ACCESS_RIGHTS, access_rights_from_native(lar(fs())));
        vmwrite(vmcs::guest::GS_ACCESS_RIGHTS, access_rights_from_native(lar(gs())));
        vmwrite(vmcs::guest::LDTR_ACCESS_RIGHTS, access_rights_from_native(lar(ldtr)));
        vmwrite(vmcs::guest::TR_ACCESS_RIGHTS, access_rights_from_native(lar(tr)));

        vmwrite(vmcs::guest::GDTR_BASE, gdtr.base as u64);
        vmwrite(vmcs::guest::IDTR_BASE, idtr.base as u64);
        vmwrite(vmcs::guest::GDTR_LIMIT, gdtr.limit as u64);
        vmwrite(vmcs::guest::IDTR_LIMIT, idtr.limit as u64);

        vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, rdmsr(msr::IA32_DEBUGCTL));
        vmwrite(vmcs::guest::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS));
        vmwrite(vmcs::guest::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP));
        vmwrite(vmcs::guest::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP));
        vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);
    }

    /// Writes the host-state area. Host CR3 is the SYSTEM address space
    /// captured at init; the DPC may have interrupted an arbitrary process
    /// whose CR3 must not become the exit-time address space. Host RSP/RIP
    /// are installed by the launch assembly on the first entry.
    #[rustfmt::skip]
    pub fn setup_host_registers_state(system_cr3: u64) {
        let gdtr = sgdt();
        let idtr = sidt();
        let tr = unsafe { task::tr() };

        unsafe { vmwrite(vmcs::host::CR0, controlregs::cr0().bits() as u64) };
        vmwrite(vmcs::host::CR3, system_cr3);
        vmwrite(vmcs::host::CR4, Cr4::read_raw());

        const SELECTOR_MASK: u16 = 0xF8;
        vmwrite(vmcs::host::CS_SELECTOR, cs().bits() & SELECTOR_MASK);
        vmwrite(vmcs::host::SS_SELECTOR, ss().bits() & SELECTOR_MASK);
        vmwrite(vmcs::host::DS_SELECTOR, ds().bits() & SELECTOR_MASK);
        vmwrite(vmcs::host::ES_SELECTOR, es().bits() & SELECTOR_MASK);
        vmwrite(vmcs::host::FS_SELECTOR, fs().bits() & SELECTOR_MASK);
        vmwrite(vmcs::host::GS_SELECTOR, gs().bits() & SELECTOR_MASK);
        vmwrite(vmcs::host::TR_SELECTOR, tr.bits() & SELECTOR_MASK);

        vmwrite(vmcs::host::FS_BASE, rdmsr(msr::IA32_FS_BASE));
        vmwrite(vmcs::host::GS_BASE, rdmsr(msr::IA32_GS_BASE));
        vmwrite(vmcs::host::TR_BASE, segment_base(&gdtr, tr));

        vmwrite(vmcs::host::GDTR_BASE, gdtr.base as u64);
        vmwrite(vmcs::host::IDTR_BASE, idtr.base as u64);

        vmwrite(vmcs::host::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS));
        vmwrite(vmcs::host::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP));
        vmwrite(vmcs::host::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP));
    }

    /// Writes the control fields: bitmap-gated MSR and I/O interception,
    /// EPT and VPID on, 64-bit host and IA-32e guest. CR masks start at 0
    /// and are raised per-core when an intercept is requested.
    #[rustfmt::skip]
    pub fn setup_vmcs_control_fields(
        primary_eptp: u64,
        msr_bitmap_pa: u64,
        io_bitmap_a_pa: u64,
        io_bitmap_b_pa: u64,
    ) {
        const PRIMARY_CTL: u64 = (vmcs::control::PrimaryControls::SECONDARY_CONTROLS.bits()
            | vmcs::control::PrimaryControls::USE_MSR_BITMAPS.bits()
            | vmcs::control::PrimaryControls::USE_IO_BITMAPS.bits()) as u64;
        const SECONDARY_CTL: u64 = (vmcs::control::SecondaryControls::ENABLE_EPT.bits()
            | vmcs::control::SecondaryControls::ENABLE_VPID.bits()
            | vmcs::control::SecondaryControls::ENABLE_RDTSCP.bits()
            | vmcs::control::SecondaryControls::ENABLE_INVPCID.bits()
            | vmcs::control::SecondaryControls::ENABLE_XSAVES_XRSTORS.bits()) as u64;
        const ENTRY_CTL: u64 = vmcs::control::EntryControls::IA32E_MODE_GUEST.bits() as u64;
        const EXIT_CTL: u64 = vmcs::control::ExitControls::HOST_ADDRESS_SPACE_SIZE.bits() as u64;
        const PINBASED_CTL: u64 = 0;

        vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::PinBased, PINBASED_CTL));
        vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::ProcessorBased, PRIMARY_CTL));
        vmwrite(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::ProcessorBased2, SECONDARY_CTL));
        vmwrite(vmcs::control::VMENTRY_CONTROLS, adjust_vmx_controls(VmxControl::VmEntry, ENTRY_CTL));
        vmwrite(vmcs::control::VMEXIT_CONTROLS, adjust_vmx_controls(VmxControl::VmExit, EXIT_CTL));

        vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, 0u64);
        vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, 0u64);
        unsafe {
            vmwrite(vmcs::control::CR0_READ_SHADOW, controlregs::cr0().bits() as u64);
            vmwrite(vmcs::control::CR4_READ_SHADOW, Cr4::read_raw());
        }
        vmwrite(vmcs::control::CR3_TARGET_COUNT, 0u64);

        vmwrite(vmcs::control::TSC_OFFSET_FULL, 0u64);
        vmwrite(vmcs::control::PAGE_FAULT_ERR_CODE_MASK, 0u64);
        vmwrite(vmcs::control::PAGE_FAULT_ERR_CODE_MATCH, 0u64);
        vmwrite(vmcs::control::EXCEPTION_BITMAP, 0u64);

        vmwrite(vmcs::control::VMEXIT_MSR_STORE_COUNT, 0u64);
        vmwrite(vmcs::control::VMEXIT_MSR_LOAD_COUNT, 0u64);
        vmwrite(vmcs::control::VMENTRY_MSR_LOAD_COUNT, 0u64);
        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, 0u64);

        vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, msr_bitmap_pa);
        vmwrite(vmcs::control::IO_BITMAP_A_ADDR_FULL, io_bitmap_a_pa);
        vmwrite(vmcs::control::IO_BITMAP_B_ADDR_FULL, io_bitmap_b_pa);

        vmwrite(vmcs::control::EPTP_FULL, primary_eptp);
        vmwrite(vmcs::control::VPID, VPID_TAG);
    }
}

/// The five adjustable VMX control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Conditions a requested control value against its capability MSR: bits the
/// hardware demands are set, bits it forbids are cleared. When IA32_VMX_BASIC
/// bit 55 reports TRUE controls, the TRUE variant governs the four legacy
/// fields.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// A.3 VM-EXECUTION CONTROLS
pub fn adjust_vmx_controls(control: VmxControl, requested: u64) -> u64 {
    const IA32_VMX_BASIC_VMX_CONTROLS_FLAG: u64 = 1 << 55;

    let has_true_controls = rdmsr(msr::IA32_VMX_BASIC) & IA32_VMX_BASIC_VMX_CONTROLS_FLAG != 0;

    let cap_msr = match (control, has_true_controls) {
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        // There is no TRUE variant for the secondary controls.
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    };

    apply_allowed_bits(requested, rdmsr(cap_msr))
}

/// The pure core of `adjust_vmx_controls`: allowed-0 settings occupy the low
/// dword (must-be-one), allowed-1 settings the high dword (may-be-one).
pub fn apply_allowed_bits(requested: u64, capability: u64) -> u64 {
    let allowed0 = capability & 0xFFFF_FFFF;
    let allowed1 = capability >> 32;
    (requested | allowed0) & allowed1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_bits_force_and_mask() {
        // Bits 0/1 must be one, bits 0..16 may be one.
        let capability = 0x0000_FFFF_0000_0003u64;

        // A request outside the allowed-1 window is stripped; the fixed
        // bits appear even when not requested.
        assert_eq!(apply_allowed_bits(0, capability), 0x3);
        assert_eq!(apply_allowed_bits(1 << 20, capability), 0x3);
        assert_eq!(apply_allowed_bits(1 << 4, capability), 0x13);
    }

    #[test]
    fn allowed_bits_keep_supported_requests() {
        // Everything settable, nothing forced.
        let capability = 0xFFFF_FFFF_0000_0000u64;
        assert_eq!(apply_allowed_bits(0xABCD, capability), 0xABCD);
    }
}
