//! EPT violations: the heartbeat of the hidden-hook engine. A violation on
//! a hooked page flips the leaf between the data and exec configurations;
//! anything else is a programming bug reflected into the guest.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::inject_general_protection,
            hooks::hook_manager::{MtfRearm, SHARED_HOOK_MANAGER},
            support::vmread,
            vcpu::Vcpu,
            vmerror::EptViolationQualification,
            vmexit::{
                mtf::{set_monitor_trap_flag, update_guest_interrupt_flag},
                ExitType,
            },
        },
        vmm,
    },
    log::*,
    x86::vmx::vmcs,
};

pub fn handle_ept_violation(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let guest_pa = vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);
    let qualification = EptViolationQualification(vmread(vmcs::ro::EXIT_QUALIFICATION));

    trace!(
        "EPT violation at GPA {:#x} ({:?}), guest RIP {:#x}",
        guest_pa,
        qualification,
        vcpu.guest_registers.rip
    );

    // Lock order everywhere: hook manager before the EPT state.
    let mut hook_manager = SHARED_HOOK_MANAGER.lock();
    let mut shared = vmm::shared_data().lock();
    let shared = shared.as_mut().ok_or(HypervisorError::VmxNotInitialized)?;

    match hook_manager.handle_hooked_page(
        &mut shared.primary_ept,
        guest_pa,
        qualification.caused_by_fetch(),
    ) {
        Ok(Some(rearm)) => {
            if let MtfRearm::WatchConfiguration { .. } = rearm {
                if let Some(callback) = crate::interface::callbacks().memory_access {
                    callback(vcpu.index, guest_pa, qualification);
                }
            }

            // Re-arm the opposite configuration right after the faulting
            // instruction retires; interrupts stay masked for exactly that
            // one step.
            vcpu.mtf_rearm = Some(rearm);
            set_monitor_trap_flag(true);
            update_guest_interrupt_flag(vcpu, false);

            Ok(ExitType::Continue)
        }
        Ok(None) => Ok(ExitType::Continue),
        Err(HypervisorError::HookNotFound) => {
            // Identity-mapped memory never faults on its own; this leaf was
            // mutated outside the hook engine.
            error!(
                "EPT violation on unhooked GPA {:#x} ({:?})",
                guest_pa, qualification
            );
            inject_general_protection(0);
            Ok(ExitType::Continue)
        }
        Err(error) => Err(error),
    }
}
