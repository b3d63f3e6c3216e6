//! EPT misconfiguration means a paging-structure entry violates the format
//! rules; the mapping for that address is gone and nothing can be resumed
//! safely. The offending core devirtualizes itself.

use {
    crate::{
        error::HypervisorError,
        intel::{support::vmread, vcpu::Vcpu, vmexit::ExitType},
    },
    log::*,
    x86::vmx::vmcs,
};

pub fn handle_ept_misconfiguration(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let guest_pa = vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);

    error!(
        "EPT misconfiguration at GPA {:#x} on core {}; abandoning virtualization of this core",
        guest_pa, vcpu.index
    );

    vcpu.devirtualize()?;
    vcpu.guest_registers.rip = vcpu.vmxoff_state.guest_rip;
    vcpu.guest_registers.rsp = vcpu.vmxoff_state.guest_rsp;

    Ok(ExitType::ExitHypervisor)
}
