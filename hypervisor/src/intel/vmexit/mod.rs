//! The central VM-exit dispatcher: decodes the basic exit reason and routes
//! to the per-family handlers. The RIP advancement rule lives in the
//! `ExitType` contract: instruction-boundary exits return `IncrementRip`,
//! fault-style exits and event re-execution return `Continue`, and
//! devirtualization returns `ExitHypervisor`.

pub mod cpuid;
pub mod cr;
pub mod descriptor_access;
pub mod dr;
pub mod ept_misconfiguration;
pub mod ept_violation;
pub mod exception;
pub mod interrupt;
pub mod invd;
pub mod io;
pub mod msr;
pub mod mtf;
pub mod preemption_timer;
pub mod rdtsc;
pub mod vmcall;
pub mod xsetbv;

use {
    crate::{
        error::HypervisorError,
        intel::{events, vcpu::Vcpu, vmerror::VmxBasicExitReason},
    },
    log::*,
};

/// What the run loop does after a handler returns.
#[derive(PartialOrd, PartialEq)]
pub enum ExitType {
    /// Tear down virtualization of this core.
    ExitHypervisor,

    /// Advance guest RIP past the exiting instruction.
    IncrementRip,

    /// Re-enter at the same RIP (faults, injected events, MTF).
    Continue,
}

/// Routes one VM exit. Unknown or never-enabled reasons are programming
/// bugs and surface as errors, which devirtualize the offending core.
pub fn dispatch(vcpu: &mut Vcpu, reason: VmxBasicExitReason) -> Result<ExitType, HypervisorError> {
    match reason {
        VmxBasicExitReason::ExceptionOrNmi => exception::handle_exception(vcpu),
        VmxBasicExitReason::ExternalInterrupt => interrupt::handle_external_interrupt(vcpu),
        VmxBasicExitReason::Cpuid => cpuid::handle_cpuid(vcpu),
        VmxBasicExitReason::Hlt => {
            // Only exits when HLT exiting was armed for instrumentation.
            Ok(ExitType::IncrementRip)
        }
        VmxBasicExitReason::Invd => invd::handle_invd(vcpu),
        VmxBasicExitReason::Invlpg => {
            let linear = crate::intel::support::vmread(x86::vmx::vmcs::ro::EXIT_QUALIFICATION);
            crate::intel::invvpid::invvpid_individual_address(
                crate::intel::invvpid::VPID_TAG,
                linear,
            );
            Ok(ExitType::IncrementRip)
        }
        VmxBasicExitReason::Rdpmc => rdtsc::handle_rdpmc(vcpu),
        VmxBasicExitReason::Rdtsc => rdtsc::handle_rdtsc(vcpu, false),
        VmxBasicExitReason::Rdtscp => rdtsc::handle_rdtsc(vcpu, true),
        VmxBasicExitReason::Vmcall => vmcall::handle_vmcall(vcpu),
        VmxBasicExitReason::ControlRegisterAccesses => cr::handle_cr_access(vcpu),
        VmxBasicExitReason::MovDr => dr::handle_mov_dr(vcpu),
        VmxBasicExitReason::IoInstruction => io::handle_io(vcpu),
        VmxBasicExitReason::Rdmsr => msr::handle_rdmsr(vcpu),
        VmxBasicExitReason::Wrmsr => msr::handle_wrmsr(vcpu),
        VmxBasicExitReason::MonitorTrapFlag => mtf::handle_monitor_trap_flag(vcpu),
        VmxBasicExitReason::AccessToGdtrOrIdtr | VmxBasicExitReason::AccessToLdtrOrTr => {
            descriptor_access::handle_descriptor_access(vcpu, reason)
        }
        VmxBasicExitReason::EptViolation => ept_violation::handle_ept_violation(vcpu),
        VmxBasicExitReason::EptMisconfiguration => {
            ept_misconfiguration::handle_ept_misconfiguration(vcpu)
        }
        VmxBasicExitReason::VmxPreemptionTimerExpired => {
            preemption_timer::handle_preemption_timer(vcpu)
        }
        VmxBasicExitReason::Xsetbv => xsetbv::handle_xsetbv(vcpu),
        VmxBasicExitReason::PageModificationLogFull => {
            // Upper layers drain the log through the dirty-logging
            // interface; the index just needs re-arming here.
            crate::intel::hv::reset_pml_index();
            Ok(ExitType::Continue)
        }

        // Guest attempts at VMX instructions are refused like on a CPU
        // without VMX; nested virtualization is not offered.
        VmxBasicExitReason::Vmclear
        | VmxBasicExitReason::Vmlaunch
        | VmxBasicExitReason::Vmptrld
        | VmxBasicExitReason::Vmptrst
        | VmxBasicExitReason::Vmread
        | VmxBasicExitReason::Vmresume
        | VmxBasicExitReason::Vmwrite
        | VmxBasicExitReason::Vmxoff
        | VmxBasicExitReason::Vmxon
        | VmxBasicExitReason::Invept
        | VmxBasicExitReason::Invvpid
        | VmxBasicExitReason::Vmfunc => {
            events::inject_undefined_opcode();
            Ok(ExitType::Continue)
        }

        _ => {
            error!(
                "Unhandled VM exit reason {:?} on core {}",
                reason, vcpu.index
            );
            Err(HypervisorError::UnhandledVmExit)
        }
    }
}
