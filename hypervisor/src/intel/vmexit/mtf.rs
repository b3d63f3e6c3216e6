//! Monitor trap flag: one guest instruction retires, then this exit
//! completes whatever two-phase operation was pending, normally re-arming
//! the opposite EPT hook configuration.

use {
    crate::{
        error::HypervisorError,
        intel::{
            hooks::hook_manager::SHARED_HOOK_MANAGER,
            support::{vmread, vmwrite},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
        vmm,
    },
    log::*,
    x86::vmx::vmcs,
};

pub fn handle_monitor_trap_flag(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    if let Some(rearm) = vcpu.mtf_rearm.take() {
        let mut hook_manager = SHARED_HOOK_MANAGER.lock();
        let mut shared = vmm::shared_data().lock();
        let shared = shared.as_mut().ok_or(HypervisorError::VmxNotInitialized)?;

        hook_manager.rearm(&mut shared.primary_ept, rearm)?;

        set_monitor_trap_flag(false);
        restore_guest_interrupt_flag(vcpu);
    } else if let Some(callback) = crate::interface::callbacks().monitor_trap {
        // An upper layer armed MTF for its own single-step.
        callback(vcpu.index, &mut vcpu.guest_registers);
        vmwrite(vmcs::guest::RIP, vcpu.guest_registers.rip);
        vmwrite(vmcs::guest::RSP, vcpu.guest_registers.rsp);
        vmwrite(vmcs::guest::RFLAGS, vcpu.guest_registers.rflags);
        set_monitor_trap_flag(false);
        restore_guest_interrupt_flag(vcpu);
    } else {
        warn!("Spurious monitor trap flag exit on core {}", vcpu.index);
        set_monitor_trap_flag(false);
    }

    // The stepped instruction has retired; resume at the current RIP.
    Ok(ExitType::Continue)
}

/// Turns the monitor trap flag execution control on or off.
pub fn set_monitor_trap_flag(set: bool) {
    let controls = vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    let mut primary_controls =
        unsafe { vmcs::control::PrimaryControls::from_bits_unchecked(controls as u32) };

    if set {
        primary_controls.insert(vmcs::control::PrimaryControls::MONITOR_TRAP_FLAG);
    } else {
        primary_controls.remove(vmcs::control::PrimaryControls::MONITOR_TRAP_FLAG);
    }

    vmwrite(
        vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        primary_controls.bits(),
    );
}

/// Masks (or restores) the guest interrupt flag around an MTF single step,
/// so no interrupt is delivered between the two configuration flips.
pub fn update_guest_interrupt_flag(vcpu: &mut Vcpu, enable: bool) {
    const RFLAGS_IF: u64 = 1 << 9;

    if enable {
        restore_guest_interrupt_flag(vcpu);
        return;
    }

    if vcpu.old_rflags.is_none() {
        vcpu.old_rflags = Some(vcpu.guest_registers.rflags);
    }
    vcpu.guest_registers.rflags &= !RFLAGS_IF;
    vmwrite(vmcs::guest::RFLAGS, vcpu.guest_registers.rflags);
}

fn restore_guest_interrupt_flag(vcpu: &mut Vcpu) {
    const RFLAGS_IF: u64 = 1 << 9;

    // Only IF is reinstated; the stepped instruction owns every other flag.
    if let Some(old_rflags) = vcpu.old_rflags.take() {
        let current = vmread(vmcs::guest::RFLAGS);
        let merged = (current & !RFLAGS_IF) | (old_rflags & RFLAGS_IF);
        vcpu.guest_registers.rflags = merged;
        vmwrite(vmcs::guest::RFLAGS, merged);
    }
}
